//! Persistent network store (design doc §4.3 / §6.1): the on-disk
//! image of a compiled [`HmmStateNetwork`] plus everything needed to
//! reconstruct the word-end / root bookkeeping around it without
//! recompiling from the lexicon and acoustic model.
//!
//! The field order below is externally fixed and must not be
//! reordered: format version, legacy dummy index, dependency
//! checksum, network payload, exits, then the remaining root/exit
//! bookkeeping sets, and finally `root_state`/`ci_root_state`.

use std::io::{Read, Write};

use crate::error::SearchResult;
use crate::types::io::{BinaryReader, BinaryWriter};
use crate::types::network::{CleanupResult, HmmStateNetwork, StateId};
use crate::types::proxy::{Array, OrderedMap, OrderedSet};

pub const DISK_FORMAT_VERSION: u32 = 2;
/// Carried only so older images (format version 1, which this crate
/// does not otherwise support reading) fail with a clear "rebuild"
/// outcome rather than a garbled parse; RASR calls this slot the
/// legacy `dummyIndex`.
const LEGACY_DUMMY_INDEX: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransitDescription {
  pub depth: u32,
  pub pronunciation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
  pub transit_state: StateId,
}

#[derive(Debug)]
pub struct PersistentStateTree {
  pub structure: HmmStateNetwork,
  pub exits: Array<Exit>,
  pub coarticulated_root_states: OrderedSet<StateId>,
  pub unpushed_coarticulated_root_states: OrderedSet<StateId>,
  pub root_transit_descriptions: OrderedMap<StateId, TransitDescription>,
  pub pushed_word_end_nodes: OrderedSet<StateId>,
  pub uncoarticulated_word_end_states: OrderedSet<StateId>,
  pub root_state: StateId,
  pub ci_root_state: StateId,
}

/// Outcome of [`PersistentStateTree::read`]: a format or dependency
/// mismatch is not an I/O error, it's a signal that the caller must
/// rebuild the network from the lexicon and acoustic model instead.
pub enum ReadOutcome {
  Loaded(PersistentStateTree),
  RebuildRequired { reason: String },
}

impl PersistentStateTree {
  pub fn new(structure: HmmStateNetwork, root_state: StateId, ci_root_state: StateId) -> Self {
    Self {
      structure,
      exits: Array::new(),
      coarticulated_root_states: OrderedSet::new(),
      unpushed_coarticulated_root_states: OrderedSet::new(),
      root_transit_descriptions: OrderedMap::new(),
      pushed_word_end_nodes: OrderedSet::new(),
      uncoarticulated_word_end_states: OrderedSet::new(),
      root_state,
      ci_root_state,
    }
  }

  pub fn write(&self, w: &mut impl Write, dependency_checksum: u64) -> SearchResult<()> {
    w.write_u32_le(DISK_FORMAT_VERSION)?;
    w.write_u32_le(LEGACY_DUMMY_INDEX)?;
    w.write_u64_le(dependency_checksum)?;

    self.structure.write(w)?;

    w.write_u32_le(self.exits.len() as u32)?;
    for exit in &self.exits {
      w.write_u32_le(exit.transit_state.0)?;
    }

    write_state_set(w, &self.coarticulated_root_states)?;
    write_state_set(w, &self.unpushed_coarticulated_root_states)?;

    w.write_u32_le(self.root_transit_descriptions.len() as u32)?;
    for (state, desc) in &self.root_transit_descriptions {
      w.write_u32_le(state.0)?;
      w.write_u32_le(desc.depth)?;
      w.write_u32_le(desc.pronunciation)?;
    }

    write_state_set(w, &self.pushed_word_end_nodes)?;
    write_state_set(w, &self.uncoarticulated_word_end_states)?;

    w.write_u32_le(self.root_state.0)?;
    w.write_u32_le(self.ci_root_state.0)?;
    Ok(())
  }

  /// Reads an image, verifying the format version and dependency
  /// checksum before touching anything else. A mismatch on either
  /// yields [`ReadOutcome::RebuildRequired`] rather than an error:
  /// per design doc §7, a stale image is an expected, recoverable
  /// condition, not a corruption.
  pub fn read(r: &mut impl Read, expected_dependency_checksum: u64) -> SearchResult<ReadOutcome> {
    let format_version = r.read_u32_le()?;
    if format_version != DISK_FORMAT_VERSION {
      return Ok(ReadOutcome::RebuildRequired {
        reason: format!(
          "persistent image format version {format_version} is not {DISK_FORMAT_VERSION}"
        ),
      });
    }
    let _dummy_index = r.read_u32_le()?;
    let found_checksum = r.read_u64_le()?;
    if found_checksum != expected_dependency_checksum {
      return Ok(ReadOutcome::RebuildRequired {
        reason: format!(
          "dependency checksum {found_checksum:#x} does not match current {expected_dependency_checksum:#x}"
        ),
      });
    }

    let structure = HmmStateNetwork::read(r)?;

    let exit_count = r.read_u32_le()? as usize;
    let mut exits = Array::with_capacity(exit_count);
    for _ in 0..exit_count {
      exits.push(Exit { transit_state: StateId(r.read_u32_le()?) });
    }

    let coarticulated_root_states = read_state_set(r)?;
    let unpushed_coarticulated_root_states = read_state_set(r)?;

    let transit_count = r.read_u32_le()? as usize;
    let mut root_transit_descriptions = OrderedMap::new();
    for _ in 0..transit_count {
      let state = StateId(r.read_u32_le()?);
      let depth = r.read_u32_le()?;
      let pronunciation = r.read_u32_le()?;
      root_transit_descriptions.insert(state, TransitDescription { depth, pronunciation });
    }

    let pushed_word_end_nodes = read_state_set(r)?;
    let uncoarticulated_word_end_states = read_state_set(r)?;

    let root_state = StateId(r.read_u32_le()?);
    let ci_root_state = StateId(r.read_u32_le()?);

    Ok(ReadOutcome::Loaded(PersistentStateTree {
      structure,
      exits,
      coarticulated_root_states,
      unpushed_coarticulated_root_states,
      root_transit_descriptions,
      pushed_word_end_nodes,
      uncoarticulated_word_end_states,
      root_state,
      ci_root_state,
    }))
  }

  /// Strips all label edges from the network and recomputes the
  /// coarticulated-root-state bookkeeping, keeping only the state
  /// graph structure itself.
  pub fn remove_outputs(&mut self) -> SearchResult<()> {
    for state_idx in 0..self.structure.num_states() {
      let state = StateId(state_idx as u32);
      let plan = self.structure.change(state);
      let labels: Array<StateId> =
        self.structure.successors(state).filter(|s| s.is_label()).collect();
      let plan = labels.into_iter().fold(plan, |p, l| p.remove(l));
      plan.apply(&mut self.structure, state)?;
    }
    self.exits.clear();
    let roots: Array<StateId> = self.coarticulated_root_states.iter().copied().collect();
    self.structure.cleanup(&roots);
    Ok(())
  }

  /// Delegates into [`HmmStateNetwork::cleanup`] and remaps every
  /// field that cross-references a state id through the returned
  /// [`CleanupResult`].
  pub fn cleanup(&mut self) -> CleanupResult {
    let roots: Array<StateId> = self.coarticulated_root_states.iter().copied().collect();
    let result = self.structure.cleanup(&roots);

    self.exits.retain_mut(|exit| match result.map_state(exit.transit_state) {
      Some(mapped) => {
        exit.transit_state = mapped;
        true
      }
      None => false,
    });

    self.coarticulated_root_states = remap_set(&self.coarticulated_root_states, &result);
    self.unpushed_coarticulated_root_states =
      remap_set(&self.unpushed_coarticulated_root_states, &result);
    self.pushed_word_end_nodes = remap_set(&self.pushed_word_end_nodes, &result);
    self.uncoarticulated_word_end_states = remap_set(&self.uncoarticulated_word_end_states, &result);

    self.root_transit_descriptions = self
      .root_transit_descriptions
      .iter()
      .filter_map(|(state, desc)| result.map_state(*state).map(|mapped| (mapped, *desc)))
      .collect();

    if let Some(mapped) = result.map_state(self.root_state) {
      self.root_state = mapped;
    }
    if let Some(mapped) = result.map_state(self.ci_root_state) {
      self.ci_root_state = mapped;
    }

    result
  }
}

fn remap_set(set: &OrderedSet<StateId>, result: &CleanupResult) -> OrderedSet<StateId> {
  set.iter().filter_map(|s| result.map_state(*s)).collect()
}

fn write_state_set(w: &mut impl Write, set: &OrderedSet<StateId>) -> SearchResult<()> {
  w.write_u32_le(set.len() as u32)?;
  for state in set {
    w.write_u32_le(state.0)?;
  }
  Ok(())
}

fn read_state_set(r: &mut impl Read) -> SearchResult<OrderedSet<StateId>> {
  let count = r.read_u32_le()? as usize;
  let mut set = OrderedSet::new();
  for _ in 0..count {
    set.insert(StateId(r.read_u32_le()?));
  }
  Ok(set)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::network::StateDesc;
  use std::io::Cursor;

  fn three_state_chain() -> PersistentStateTree {
    let mut net = HmmStateNetwork::new(true);
    let s0 = net.allocate_state(StateDesc { emission: 0, transition_model: 0 });
    let s1 = net.allocate_state(StateDesc { emission: 1, transition_model: 0 });
    let s2 = net.allocate_state(StateDesc { emission: 2, transition_model: 0 });
    net.add_target_to_state(s0, s1).unwrap();
    net.add_target_to_state(s1, s2).unwrap();
    net.add_target_to_state(s2, StateId::from_label(0)).unwrap();
    let tree = net.allocate_tree();
    net.add_root_to_tree(tree, s0).unwrap();

    let mut pst = PersistentStateTree::new(net, s0, s0);
    pst.exits.push(Exit { transit_state: s2 });
    pst.coarticulated_root_states.insert(s0);
    pst
  }

  #[test]
  fn round_trips_a_three_state_chain() {
    let pst = three_state_chain();
    let mut buf = Vec::new();
    pst.write(&mut buf, 0xabc).unwrap();

    let mut cursor = Cursor::new(buf);
    let loaded = match PersistentStateTree::read(&mut cursor, 0xabc).unwrap() {
      ReadOutcome::Loaded(t) => t,
      ReadOutcome::RebuildRequired { reason } => panic!("unexpected rebuild: {reason}"),
    };
    assert_eq!(loaded.structure.num_states(), 3);
    assert_eq!(loaded.exits.len(), 1);
    assert_eq!(loaded.root_state, pst.root_state);
    assert_eq!(loaded.coarticulated_root_states, pst.coarticulated_root_states);
  }

  #[test]
  fn dependency_checksum_mismatch_requests_a_rebuild() {
    let pst = three_state_chain();
    let mut buf = Vec::new();
    pst.write(&mut buf, 0xabc).unwrap();

    let mut cursor = Cursor::new(buf);
    match PersistentStateTree::read(&mut cursor, 0xdead).unwrap() {
      ReadOutcome::Loaded(_) => panic!("checksum mismatch should not load"),
      ReadOutcome::RebuildRequired { .. } => {}
    }
  }

  #[test]
  fn format_version_mismatch_requests_a_rebuild() {
    let mut buf = Vec::new();
    buf.write_u32_le(1).unwrap(); // stale format version
    let mut cursor = Cursor::new(buf);
    match PersistentStateTree::read(&mut cursor, 0).unwrap() {
      ReadOutcome::Loaded(_) => panic!("stale format should not load"),
      ReadOutcome::RebuildRequired { .. } => {}
    }
  }
}
