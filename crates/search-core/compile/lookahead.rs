//! Language-model look-ahead cache (design doc §4.5).
//!
//! A compressed construction tree of look-ahead nodes maps network
//! states to a small set of [`LookaheadId`]s. For each LM history, a
//! [`ContextLookahead`] table gives a look-ahead score per id, stored
//! either densely (one `Score` per id) or sparsely (a hash table plus
//! a scalar back-off for ids that miss). An MRU cache of tables keeps
//! memory bounded across the many histories a decode pass visits.

use crate::error::{LookaheadError, SearchResult};
use crate::types::proxy::{Array, OrderedMap};
use crate::types::score::{Score, INVALID_SCORE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LookaheadId(pub u32);

/// One entry of the compressed construction tree: `first_successor`
/// and `first_end` delimit this node's children and terminal
/// lookahead ids as contiguous ranges in parallel flat arrays, the way
/// the original keeps the tree cache-friendly without per-node heap
/// allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Node {
  pub first_end: u32,
  pub first_successor: u32,
  pub first_parent: u32,
  pub depth: u32,
}

/// Builds the compressed construction tree once, at network-compile
/// time. `ends[n.first_end..next.first_end]` are this node's terminal
/// lookahead ids; `successors[n.first_successor..next.first_successor]`
/// are its child node indices.
#[derive(Debug, Default)]
pub struct LookaheadTree {
  nodes: Array<Node>,
  ends: Array<LookaheadId>,
  successors: Array<u32>,
}

impl LookaheadTree {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a node whose children are `successors` and whose
  /// terminal ids are `ends`; returns the new node's index.
  pub fn add_node(&mut self, depth: u32, ends: &[LookaheadId], successors: &[u32]) -> u32 {
    let idx = self.nodes.len() as u32;
    self.ends.extend_from_slice(ends);
    self.successors.extend_from_slice(successors);
    self.nodes.push(Node {
      first_end: self.ends.len() as u32,
      first_successor: self.successors.len() as u32,
      first_parent: idx,
      depth,
    });
    idx
  }

  pub fn is_single_word_node(&self, idx: u32) -> bool {
    let node = &self.nodes[idx as usize];
    let prev_end = if idx == 0 { 0 } else { self.nodes[idx as usize - 1].first_end };
    let prev_successor =
      if idx == 0 { 0 } else { self.nodes[idx as usize - 1].first_successor };
    node.first_end - prev_end == 1 && node.first_successor == prev_successor
  }
}

/// A small open-addressed hash table with exact key verification: a
/// get() can never return a value for the wrong key.
#[derive(Debug)]
pub struct LinearMiniHash {
  keys: Array<Option<LookaheadId>>,
  values: Array<Score>,
  mask: usize,
  len: usize,
}

impl LinearMiniHash {
  pub fn with_capacity(min_size: usize) -> Self {
    let size = min_size.max(1).next_power_of_two();
    Self { keys: vec![None; size], values: vec![INVALID_SCORE; size], mask: size - 1, len: 0 }
  }

  fn hash(&self, key: LookaheadId) -> usize {
    (key.0 as usize) & self.mask
  }

  pub fn fill_fraction(&self) -> f32 {
    self.len as f32 / self.keys.len() as f32
  }

  pub fn insert(&mut self, key: LookaheadId, value: Score) {
    let mut pos = self.hash(key);
    loop {
      match self.keys[pos] {
        Some(k) if k == key => {
          self.values[pos] = self.values[pos].min(value);
          return;
        }
        None => {
          self.keys[pos] = Some(key);
          self.values[pos] = value;
          self.len += 1;
          return;
        }
        Some(_) => pos = (pos + 1) & self.mask,
      }
    }
  }

  pub fn get(&self, key: LookaheadId) -> Option<Score> {
    let mut pos = self.hash(key);
    loop {
      match self.keys[pos] {
        Some(k) if k == key => return Some(self.values[pos]),
        None => return None,
        Some(_) => pos = (pos + 1) & self.mask,
      }
    }
  }
}

/// The approximate sparse variant: avoids storing keys at all by
/// embedding a one-byte collision marker (derived from the high bits
/// of the hash) into the high byte of the stored `f32`, the safe-Rust
/// equivalent of the original's `__may_alias__` pointer-aliasing
/// trick. A `get` can return a false positive if two keys collide on
/// both bucket and marker, bounded at roughly `1/256` per probe.
#[derive(Debug)]
pub struct ApproxLinearMiniHash {
  slots: Array<Score>,
  mask: usize,
  len: usize,
}

const APPROX_EMPTY: u32 = 0x7f80_0001; // a quiet NaN pattern, never a valid marked score bit pattern we produce

impl ApproxLinearMiniHash {
  pub fn with_capacity(min_size: usize) -> Self {
    let size = min_size.max(1).next_power_of_two();
    Self { slots: vec![f32::from_bits(APPROX_EMPTY); size], mask: size - 1, len: 0 }
  }

  fn hash(&self, key: LookaheadId) -> usize {
    (key.0 as usize) & self.mask
  }

  fn marker(key: LookaheadId) -> u8 {
    (key.0 >> 16) as u8
  }

  fn mark(value: Score, marker: u8) -> Score {
    let bits = (value.to_bits() & 0x00ff_ffff) | ((marker as u32) << 24);
    f32::from_bits(bits)
  }

  fn is_marked(value: Score, marker: u8) -> bool {
    value.to_bits() != APPROX_EMPTY && (value.to_bits() >> 24) as u8 == marker
  }

  pub fn fill_fraction(&self) -> f32 {
    self.len as f32 / self.slots.len() as f32
  }

  pub fn insert(&mut self, key: LookaheadId, value: Score) {
    let pos = self.hash(key);
    let marker = Self::marker(key);
    let marked = Self::mark(value, marker);
    if self.slots[pos].to_bits() == APPROX_EMPTY {
      self.slots[pos] = marked;
      self.len += 1;
    } else if self.slots[pos] > marked {
      self.slots[pos] = marked;
    }
  }

  /// Returns the stored score if the slot's marker matches `key`'s.
  /// A `Some` result may rarely be a false positive from a colliding
  /// key (design doc §9 open question); callers must treat it as a
  /// lower bound / approximation, never an exact lookup.
  pub fn get(&self, key: LookaheadId) -> Option<Score> {
    let pos = self.hash(key);
    let marker = Self::marker(key);
    if Self::is_marked(self.slots[pos], marker) {
      Some(self.slots[pos])
    } else {
      None
    }
  }
}

/// Sizes a new sparse hash table from the observed fill statistics of
/// prior ones: bins keys by an approximate expected-fill estimate and
/// interpolates between the nearest two populated bins.
#[derive(Debug)]
pub struct LinearPrediction {
  recorded: Array<(u32, f64)>,
  bin_width: f64,
}

impl LinearPrediction {
  pub fn new(bins: usize, max_key: f64) -> Self {
    Self { recorded: vec![(0, 0.0); bins.max(1)], bin_width: max_key / bins.max(1) as f64 }
  }

  fn bin_of(&self, key: f64) -> usize {
    ((key / self.bin_width) as usize).min(self.recorded.len() - 1)
  }

  pub fn add(&mut self, key: f64, value: f64) {
    let bin = self.bin_of(key);
    self.recorded[bin].0 += 1;
    self.recorded[bin].1 += value;
  }

  /// Predicted value at `key`, interpolating between the nearest
  /// populated bins below and above it. Falls back to `0.0` if no
  /// observations exist at all.
  pub fn predict(&self, key: f64) -> f64 {
    let bin = self.bin_of(key);
    let mean = |b: usize| -> Option<f64> {
      let (count, sum) = self.recorded[b];
      (count > 0).then(|| sum / count as f64)
    };
    if let Some(m) = mean(bin) {
      return m;
    }
    let below = (0..bin).rev().find_map(|b| mean(b).map(|m| (b, m)));
    let above = (bin + 1..self.recorded.len()).find_map(|b| mean(b).map(|m| (b, m)));
    match (below, above) {
      (Some((bl, vl)), Some((ba, va))) => {
        let t = (bin - bl) as f64 / (ba - bl) as f64;
        vl + t * (va - vl)
      }
      (Some((_, vl)), None) => vl,
      (None, Some((_, va))) => va,
      (None, None) => 0.0,
    }
  }
}

/// One history's worth of look-ahead scores.
#[derive(Debug)]
pub enum ContextLookahead {
  Dense { scores: Array<Score> },
  Sparse { table: LinearMiniHash, back_off_score: Score },
  ApproxSparse { table: ApproxLinearMiniHash, back_off_score: Score },
}

impl ContextLookahead {
  pub fn dense(num_ids: usize) -> Self {
    ContextLookahead::Dense { scores: vec![INVALID_SCORE; num_ids] }
  }

  pub fn sparse(capacity: usize, back_off_score: Score) -> Self {
    ContextLookahead::Sparse { table: LinearMiniHash::with_capacity(capacity), back_off_score }
  }

  pub fn approx_sparse(capacity: usize, back_off_score: Score) -> Self {
    ContextLookahead::ApproxSparse {
      table: ApproxLinearMiniHash::with_capacity(capacity),
      back_off_score,
    }
  }

  pub fn is_sparse(&self) -> bool {
    !matches!(self, ContextLookahead::Dense { .. })
  }

  pub fn set(&mut self, id: LookaheadId, score: Score) {
    match self {
      ContextLookahead::Dense { scores } => scores[id.0 as usize] = score,
      ContextLookahead::Sparse { table, .. } => table.insert(id, score),
      ContextLookahead::ApproxSparse { table, .. } => table.insert(id, score),
    }
  }

  /// The look-ahead score for `id`: an exact dense lookup, an exact
  /// sparse lookup, or an approximate sparse lookup falling back to
  /// the scalar back-off score on a miss.
  pub fn score(&self, id: LookaheadId) -> Score {
    match self {
      ContextLookahead::Dense { scores } => scores.get(id.0 as usize).copied().unwrap_or(INVALID_SCORE),
      ContextLookahead::Sparse { table, back_off_score } => {
        table.get(id).unwrap_or(*back_off_score)
      }
      ContextLookahead::ApproxSparse { table, back_off_score } => {
        table.get(id).unwrap_or(*back_off_score)
      }
    }
  }
}

/// MRU cache of per-history tables, bounded between a low and a high
/// water mark: once the cache grows past the high mark, least-
/// recently-used tables are evicted down to the low mark.
#[derive(Debug, Default)]
pub struct LookaheadCache {
  tables: OrderedMap<u64, ContextLookahead>,
  mru: Array<u64>,
  low_mark: usize,
  high_mark: usize,
}

impl LookaheadCache {
  pub fn new(low_mark: usize, high_mark: usize) -> Self {
    Self { tables: OrderedMap::new(), mru: Array::new(), low_mark, high_mark }
  }

  pub fn n_tables(&self) -> usize {
    self.tables.len()
  }

  fn touch(&mut self, history: u64) {
    self.mru.retain(|h| *h != history);
    self.mru.push(history);
  }

  pub fn insert(&mut self, history: u64, table: ContextLookahead) {
    self.tables.insert(history, table);
    self.touch(history);
    self.evict_if_needed();
  }

  pub fn get(&mut self, history: u64) -> Option<&ContextLookahead> {
    if self.tables.contains_key(&history) {
      self.touch(history);
      self.tables.get(&history)
    } else {
      None
    }
  }

  pub fn try_get(&self, history: u64) -> SearchResult<&ContextLookahead> {
    self
      .tables
      .get(&history)
      .ok_or_else(|| crate::error::SearchError::from(LookaheadError::NotCached(history)))
  }

  fn evict_if_needed(&mut self) {
    if self.tables.len() <= self.high_mark {
      return;
    }
    while self.tables.len() > self.low_mark {
      if self.mru.is_empty() {
        break;
      }
      let victim = self.mru.remove(0);
      self.tables.remove(&victim);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dense_table_round_trips_scores() {
    let mut table = ContextLookahead::dense(8);
    table.set(LookaheadId(3), 1.5);
    assert_eq!(table.score(LookaheadId(3)), 1.5);
    assert_eq!(table.score(LookaheadId(0)), INVALID_SCORE);
  }

  #[test]
  fn exact_sparse_table_never_mismatches_keys() {
    let mut table = LinearMiniHash::with_capacity(4);
    table.insert(LookaheadId(5), 1.2);
    table.insert(LookaheadId(6), 40.0);
    assert_eq!(table.get(LookaheadId(5)), Some(1.2));
    assert_eq!(table.get(LookaheadId(6)), Some(40.0));
    assert_eq!(table.get(LookaheadId(7)), None);
  }

  #[test]
  fn approx_sparse_table_hits_on_its_own_key() {
    let mut table = ApproxLinearMiniHash::with_capacity(64);
    table.insert(LookaheadId(5), 1.2);
    table.insert(LookaheadId(6), 40.0);
    assert!((table.get(LookaheadId(5)).unwrap() - 1.2).abs() < 1e-5);
    assert!((table.get(LookaheadId(6)).unwrap() - 40.0).abs() < 1e-5);
  }

  #[test]
  fn linear_prediction_interpolates_between_bins() {
    let mut pred = LinearPrediction::new(10, 100.0);
    pred.add(5.0, 2.0);
    pred.add(95.0, 20.0);
    let mid = pred.predict(50.0);
    assert!(mid > 2.0 && mid < 20.0);
  }

  #[test]
  fn cache_evicts_down_to_the_low_mark() {
    let mut cache = LookaheadCache::new(1, 2);
    cache.insert(1, ContextLookahead::dense(1));
    cache.insert(2, ContextLookahead::dense(1));
    assert_eq!(cache.n_tables(), 2);
    cache.insert(3, ContextLookahead::dense(1));
    assert_eq!(cache.n_tables(), 1, "crossing the high mark should evict down to the low mark");
    assert!(cache.get(3).is_some(), "most recently used table should survive eviction");
  }
}
