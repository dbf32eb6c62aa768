//! Confusion-network conditional-posterior builder (design doc §4.7).
//!
//! Collapses a forward/backward-decorated lattice into a compact
//! confusion network: one slot per aligned position, each slot holding
//! the candidate words that can occupy it together with their
//! posterior probability, normalized to sum to one. Pure-epsilon slots
//! are dropped; an optional top-*k* cutoff keeps only the most likely
//! candidates per slot, folding the discarded mass into a synthetic
//! "last label" filler so the slot still sums to one.
//!
//! [`estimate_posteriors`] goes further: for each slot it expands the
//! lattice contexts covering a `2 * context_size + 1` window around it
//! and recomputes, per context, the exact joint and conditional
//! posterior by re-walking the lattice rather than assuming the
//! window's slots are independent. The result is a nested
//! [`PosteriorTree`] per slot that the windowed MBR decoder (C8) reads
//! back via [`PosteriorTree::posterior`].

use std::collections::VecDeque;

use crate::collab::{Lattice, LatticeArc, LatticeNodeId, WordId};
use crate::error::{ConfusionError, SearchResult};
use crate::types::proxy::{Array, OrderedMap};
use crate::types::score::{to_probability, Collector, Score};

pub const EPSILON: WordId = WordId(u32::MAX);
pub const LAST_LABEL: WordId = WordId(u32::MAX - 1);

#[derive(Debug, Clone, Default)]
pub struct ConfusionSlot {
  pub begin: u32,
  pub end: u32,
  /// `-log` posterior probability per candidate word, normalized to
  /// sum to (approximately) one across the slot.
  pub candidates: Array<(WordId, Score)>,
}

impl ConfusionSlot {
  pub fn best(&self) -> Option<(WordId, Score)> {
    self.candidates.iter().copied().min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
  }
}

#[derive(Debug, Clone, Default)]
pub struct ConfusionNetwork {
  pub slots: Array<ConfusionSlot>,
}

#[derive(Debug, Clone, Copy)]
pub struct PosteriorLeaf {
  pub label: WordId,
  /// `-ln(N(context, label) / D(context))`: the posterior of `label`
  /// conditioned on the context leading up to it.
  pub cond_posterior_score: Score,
  /// `-ln N(context, label)`: the joint posterior of the whole context
  /// tuple ending in `label`, unnormalized relative to the window.
  pub tuple_posterior_score: Score,
}

/// One node of a [`PosteriorTree`]. `begin`/`end` index into the same
/// tree's `nodes` array and delimit this node's children - *not* time
/// boundaries, which the flat confusion-network slots already carry.
/// `leaf` indexes into the tree's `values` array for this node's own
/// `(cond, tuple)` estimate.
#[derive(Debug, Clone, Copy)]
pub struct SlotNode {
  pub label: WordId,
  pub begin: u32,
  pub end: u32,
  pub leaf: u32,
}

/// Per-slot conditional/tuple posterior estimate over a window of
/// `2 * context_size + 1` slots centered on it, computed by recursively
/// expanding lattice contexts (design doc §4.7 phase 4).
///
/// The tree's root covers the first real slot in the window; when the
/// window would extend before slot zero, `label_offset` records how
/// many leading window positions are implicit epsilons that were
/// skipped rather than represented as nodes.
#[derive(Debug, Clone, Default)]
pub struct PosteriorTree {
  pub label_offset: u32,
  pub root_begin: u32,
  pub root_end: u32,
  pub nodes: Array<SlotNode>,
  pub values: Array<PosteriorLeaf>,
}

impl PosteriorTree {
  /// Looks up the leaf for `path`, a sequence of labels starting at
  /// this tree's first real window position, by binary-searching each
  /// level's sorted sibling range in turn (design doc §4.7 Output).
  /// Returns `None` if `path` doesn't match any expanded context, or
  /// runs deeper than this tree's window reached.
  pub fn posterior(&self, path: &[WordId]) -> Option<PosteriorLeaf> {
    if path.is_empty() {
      return None;
    }
    let mut range = (self.root_begin, self.root_end);
    let mut leaf = None;
    for (depth, &label) in path.iter().enumerate() {
      if range.0 == range.1 {
        return None;
      }
      let slice = &self.nodes[range.0 as usize..range.1 as usize];
      let found = slice.binary_search_by_key(&label.0, |n| n.label.0).ok()?;
      let node = slice[found];
      leaf = Some(self.values[node.leaf as usize]);
      if depth + 1 == path.len() {
        break;
      }
      range = (node.begin, node.end);
    }
    leaf
  }
}

/// Buckets every lattice arc by its `begin_time`, paired with the node
/// it departs from - the shared index both [`build_confusion_network`]
/// and [`estimate_posteriors`] walk, so the two always agree on which
/// arcs belong to which slot.
fn collect_arcs_by_begin(lattice: &impl Lattice) -> OrderedMap<u32, Array<(LatticeNodeId, LatticeArc)>> {
  let mut by_begin: OrderedMap<u32, Array<(LatticeNodeId, LatticeArc)>> = OrderedMap::new();
  let mut visited = std::collections::HashSet::new();
  let mut queue = VecDeque::new();
  queue.push_back(lattice.initial_node());
  visited.insert(lattice.initial_node().0);

  while let Some(node) = queue.pop_front() {
    for &arc in lattice.arcs_from(node) {
      by_begin.entry(arc.begin_time).or_default().push((node, arc));
      if visited.insert(arc.target.0) {
        queue.push_back(arc.target);
      }
    }
  }
  by_begin
}

/// Builds compact confusion-network slots from a forward/backward
/// decorated lattice: one slot per distinct arc `begin_time`, pure-
/// epsilon slots dropped, optionally capped to `top_k` candidates per
/// slot with the remainder folded into [`LAST_LABEL`].
pub fn build_confusion_network(
  lattice: &impl Lattice,
  top_k: Option<usize>,
) -> SearchResult<ConfusionNetwork> {
  let total = lattice.backward_score(lattice.initial_node());
  let by_begin = collect_arcs_by_begin(lattice);
  if by_begin.is_empty() {
    return Err(ConfusionError::EmptyLattice.into());
  }

  let mut slots = Array::new();
  for (begin, arcs) in &by_begin {
    let mut by_label: OrderedMap<WordId, Collector> = OrderedMap::new();
    let mut end = 0u32;
    for &(source, arc) in arcs {
      let path_score = lattice.forward_score(source) + arc.score + lattice.backward_score(arc.target);
      let posterior = path_score - total;
      by_label.entry(arc.label).or_insert_with(Collector::new).add(posterior.max(0.0));
      end = end.max(arc.end_time);
    }

    if by_label.len() == 1 && by_label.contains_key(&EPSILON) {
      continue; // pure-epsilon slot, dropped per design doc §4.7
    }
    let mut candidates: Array<(WordId, Score)> =
      by_label.into_iter().filter(|(l, _)| *l != EPSILON).map(|(l, c)| (l, c.sum())).collect();
    candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    if let Some(k) = top_k {
      if candidates.len() > k {
        let (kept, dropped) = candidates.split_at(k);
        let mut discarded = Collector::new();
        for &(_, score) in dropped {
          discarded.add(score);
        }
        let mut kept: Array<(WordId, Score)> = kept.to_vec();
        if !discarded.is_empty() {
          kept.push((LAST_LABEL, discarded.sum()));
        }
        candidates = kept;
      }
    }

    let mut mass = Collector::new();
    for &(_, score) in &candidates {
      mass.add(score);
    }
    let normalized = to_probability(mass.sum());
    if (normalized - 1.0).abs() > 0.01 {
      tracing::warn!(begin, mass = normalized, "confusion network slot did not normalize to 1.0 +/- 0.01");
    }

    slots.push(ConfusionSlot { begin: *begin, end, candidates });
  }
  slots.sort_by_key(|s| s.begin);

  Ok(ConfusionNetwork { slots })
}

/// A frontier of lattice nodes reached so far while expanding a
/// context, each carrying a [`Collector`] of the forward scores of the
/// paths that reach it. This is the "summation space" the original
/// threads through its recursive context expansion (design doc §4.7
/// phase 4).
type SummationSpace = OrderedMap<LatticeNodeId, Collector>;

fn extend_frontier(
  arcs: &[(LatticeNodeId, LatticeArc)],
  lattice: &impl Lattice,
  frontier: Option<&SummationSpace>,
  label: WordId,
) -> SummationSpace {
  let mut next: SummationSpace = OrderedMap::new();
  for &(source, arc) in arcs {
    if arc.label != label {
      continue;
    }
    let entry_score = match frontier {
      None => lattice.forward_score(source),
      Some(f) => match f.get(&source) {
        Some(c) => c.sum(),
        None => continue,
      },
    };
    next.entry(arc.target).or_insert_with(Collector::new).add(entry_score + arc.score);
  }
  next
}

/// `D(c) = sum over the frontier reached by context c of alpha * beta
/// / norm`, in `-log` space: `-ln D(c) = best(forward(node) +
/// backward(node)) - total`, accumulated over the whole frontier via a
/// [`Collector`].
fn denominator_score(lattice: &impl Lattice, frontier: &SummationSpace, total: Score) -> Score {
  let mut acc = Collector::new();
  for (&node, forward) in frontier {
    let f = forward.sum();
    if crate::types::score::is_valid(f) {
      acc.add(f + lattice.backward_score(node) - total);
    }
  }
  acc.sum()
}

struct TempNode {
  label: WordId,
  cond: Score,
  tuple: Score,
  children: Array<TempNode>,
}

#[allow(clippy::too_many_arguments)]
fn expand_context(
  lattice: &impl Lattice,
  arcs_by_begin: &OrderedMap<u32, Array<(LatticeNodeId, LatticeArc)>>,
  slots: &[ConfusionSlot],
  total: Score,
  slot_idx: usize,
  depth_budget: usize,
  frontier: Option<&SummationSpace>,
  d_before: Score,
) -> Array<TempNode> {
  if depth_budget == 0 || slot_idx >= slots.len() {
    return Array::new();
  }
  let slot = &slots[slot_idx];
  let empty = Array::new();
  let arcs = arcs_by_begin.get(&slot.begin).unwrap_or(&empty);

  let mut result = Array::new();
  for &(label, _) in &slot.candidates {
    let next_frontier = extend_frontier(arcs, lattice, frontier, label);
    let n_score = denominator_score(lattice, &next_frontier, total);
    let cond = n_score - d_before;
    let children = expand_context(
      lattice,
      arcs_by_begin,
      slots,
      total,
      slot_idx + 1,
      depth_budget - 1,
      Some(&next_frontier),
      n_score,
    );
    result.push(TempNode { label, cond, tuple: n_score, children });
  }
  result.sort_by_key(|n| n.label.0);
  result
}

/// Flattens a level of [`TempNode`]s into the tree's flat `nodes`/
/// `values` arrays breadth-first, so a node's children always occupy a
/// contiguous range (mirroring the lookahead tree's node layout,
/// design doc §4.5).
fn flatten(roots: Array<TempNode>, nodes: &mut Array<SlotNode>, values: &mut Array<PosteriorLeaf>) -> (u32, u32) {
  let begin = nodes.len() as u32;
  let mut queue: VecDeque<(usize, Array<TempNode>)> = VecDeque::new();
  for t in roots {
    let leaf = values.len() as u32;
    values.push(PosteriorLeaf { label: t.label, cond_posterior_score: t.cond, tuple_posterior_score: t.tuple });
    let idx = nodes.len();
    nodes.push(SlotNode { label: t.label, begin: 0, end: 0, leaf });
    queue.push_back((idx, t.children));
  }
  let end = nodes.len() as u32;

  while let Some((idx, children)) = queue.pop_front() {
    if children.is_empty() {
      continue;
    }
    let child_begin = nodes.len() as u32;
    for child in children {
      let leaf = values.len() as u32;
      values.push(PosteriorLeaf {
        label: child.label,
        cond_posterior_score: child.cond,
        tuple_posterior_score: child.tuple,
      });
      let child_idx = nodes.len();
      nodes.push(SlotNode { label: child.label, begin: 0, end: 0, leaf });
      queue.push_back((child_idx, child.children));
    }
    let child_end = nodes.len() as u32;
    nodes[idx].begin = child_begin;
    nodes[idx].end = child_end;
  }
  (begin, end)
}

/// Estimates a [`PosteriorTree`] per slot over a `2 * context_size + 1`
/// window, by recursively re-walking `lattice` rather than treating
/// neighboring slots as independent. Used by the windowed Levenshtein
/// decoder (C8).
pub fn estimate_posteriors(lattice: &impl Lattice, cn: &ConfusionNetwork, context_size: u32) -> Array<PosteriorTree> {
  let d = context_size as usize;
  let window = 2 * d + 1;
  let total = lattice.backward_score(lattice.initial_node());
  let arcs_by_begin = collect_arcs_by_begin(lattice);

  let mut trees = Array::with_capacity(cn.slots.len());
  for i in 0..cn.slots.len() {
    let label_offset = d.saturating_sub(i) as u32;
    let start_idx = i.saturating_sub(d);
    let depth_budget = window.saturating_sub(label_offset as usize);

    let roots = expand_context(lattice, &arcs_by_begin, &cn.slots, total, start_idx, depth_budget, None, 0.0);
    let mut nodes = Array::new();
    let mut values = Array::new();
    let (root_begin, root_end) = flatten(roots, &mut nodes, &mut values);
    trees.push(PosteriorTree { label_offset, root_begin, root_end, nodes, values });
  }
  trees
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::score::from_probability;

  struct TwoArcLattice {
    arcs: Array<LatticeArc>,
  }

  impl Lattice for TwoArcLattice {
    fn arcs_from(&self, node: LatticeNodeId) -> &[LatticeArc] {
      if node.0 == 0 {
        &self.arcs
      } else {
        &[]
      }
    }
    fn forward_score(&self, node: LatticeNodeId) -> Score {
      if node.0 == 0 {
        0.0
      } else {
        0.0
      }
    }
    fn backward_score(&self, _node: LatticeNodeId) -> Score {
      // -ln(0.3 + 0.7) == -ln 1.0 == 0.0, since the two arcs' raw
      // scores already are -ln 0.3 and -ln 0.7 (design doc §8 scenario).
      0.0
    }
    fn final_nodes(&self) -> &[LatticeNodeId] {
      &[]
    }
    fn initial_node(&self) -> LatticeNodeId {
      LatticeNodeId(0)
    }
  }

  /// Two independent slots in sequence: node 0 -> node 1 (slot at
  /// t=0), node 1 -> node 2 (slot at t=1). Forward/backward scores are
  /// trivial (0.0 everywhere) since each slot's own arc scores already
  /// sum to probability 1, so the chain carries no extra mass.
  struct TwoSlotChain {
    first: Array<LatticeArc>,
    second: Array<LatticeArc>,
  }

  impl Lattice for TwoSlotChain {
    fn arcs_from(&self, node: LatticeNodeId) -> &[LatticeArc] {
      match node.0 {
        0 => &self.first,
        1 => &self.second,
        _ => &[],
      }
    }
    fn forward_score(&self, _node: LatticeNodeId) -> Score {
      0.0
    }
    fn backward_score(&self, _node: LatticeNodeId) -> Score {
      0.0
    }
    fn final_nodes(&self) -> &[LatticeNodeId] {
      &[LatticeNodeId(2)]
    }
    fn initial_node(&self) -> LatticeNodeId {
      LatticeNodeId(0)
    }
  }

  #[test]
  fn slot_normalizes_to_one_from_03_and_07() {
    let lattice = TwoArcLattice {
      arcs: vec![
        LatticeArc { target: LatticeNodeId(1), label: WordId(1), score: from_probability(0.3), begin_time: 0, end_time: 1 },
        LatticeArc { target: LatticeNodeId(1), label: WordId(2), score: from_probability(0.7), begin_time: 0, end_time: 1 },
      ],
    };
    let cn = build_confusion_network(&lattice, None).unwrap();
    assert_eq!(cn.slots.len(), 1);
    let mut mass = Collector::new();
    for &(_, s) in &cn.slots[0].candidates {
      mass.add(s);
    }
    assert!((to_probability(mass.sum()) - 1.0).abs() < 0.01);
  }

  #[test]
  fn empty_lattice_is_rejected() {
    let lattice = TwoArcLattice { arcs: Array::new() };
    assert!(build_confusion_network(&lattice, None).is_err());
  }

  #[test]
  fn top_k_pruning_keeps_a_last_label_filler() {
    let lattice = TwoArcLattice {
      arcs: vec![
        LatticeArc { target: LatticeNodeId(1), label: WordId(1), score: from_probability(0.5), begin_time: 0, end_time: 1 },
        LatticeArc { target: LatticeNodeId(1), label: WordId(2), score: from_probability(0.3), begin_time: 0, end_time: 1 },
        LatticeArc { target: LatticeNodeId(1), label: WordId(3), score: from_probability(0.2), begin_time: 0, end_time: 1 },
      ],
    };
    let cn = build_confusion_network(&lattice, Some(1)).unwrap();
    assert_eq!(cn.slots[0].candidates.len(), 2, "one kept candidate plus one LAST_LABEL filler");
    assert!(cn.slots[0].candidates.iter().any(|(l, _)| *l == LAST_LABEL));
  }

  #[test]
  fn posterior_tree_root_covers_first_slot_candidates() {
    let lattice = TwoSlotChain {
      first: vec![
        LatticeArc { target: LatticeNodeId(1), label: WordId(1), score: from_probability(0.6), begin_time: 0, end_time: 1 },
        LatticeArc { target: LatticeNodeId(1), label: WordId(2), score: from_probability(0.4), begin_time: 0, end_time: 1 },
      ],
      second: vec![
        LatticeArc { target: LatticeNodeId(2), label: WordId(3), score: from_probability(1.0), begin_time: 1, end_time: 2 },
      ],
    };
    let cn = build_confusion_network(&lattice, None).unwrap();
    assert_eq!(cn.slots.len(), 2);

    let trees = estimate_posteriors(&lattice, &cn, 1);
    assert_eq!(trees.len(), 2);

    // Slot 0's window would reach before slot 0, so it has one
    // implicit leading epsilon position.
    assert_eq!(trees[0].label_offset, 1);
    let leaf = trees[0].posterior(&[WordId(1)]).expect("candidate 1 at slot 0 must be found");
    assert_eq!(leaf.label, WordId(1));
    // Only one candidate continuation (word 3) exists at slot 1, so
    // the context [1, 3] should resolve to a deterministic tuple.
    let deep = trees[0].posterior(&[WordId(1), WordId(3)]).expect("context [1,3] must be found");
    assert!((deep.cond_posterior_score).abs() < 1e-3, "only continuation is certain given the context");
  }

  #[test]
  fn posterior_tree_lookup_rejects_unknown_paths() {
    let lattice = TwoArcLattice {
      arcs: vec![LatticeArc { target: LatticeNodeId(1), label: WordId(1), score: from_probability(1.0), begin_time: 0, end_time: 1 }],
    };
    let cn = build_confusion_network(&lattice, None).unwrap();
    let trees = estimate_posteriors(&lattice, &cn, 0);
    assert!(trees[0].posterior(&[WordId(99)]).is_none());
  }
}
