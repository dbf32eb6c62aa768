//! The compiled HMM state network (design doc §4.2): a graph of
//! [`HmmState`]s connected through packed successor lists, organized
//! into one or more [`Tree`]s (root state sets for distinct phonetic
//! contexts).
//!
//! `StateId` reserves its high bit to distinguish an ordinary
//! successor (another HMM state to transition into) from a label
//! successor (a word-end / exit marker, which terminates a path
//! through the network rather than continuing it).

use std::io::{self, Read, Write};

use crate::error::{NetworkError, SearchResult};
use crate::types::batch::{BatchId, BatchManager, INVALID_BATCH};
use crate::types::io::{BinaryReader, BinaryWriter};
use crate::types::proxy::{Array, OrderedMap, OrderedSet};

const LABEL_MASK: u32 = 1 << 27;

/// On-disk format tag for the network payload itself, independent of
/// the persistent store's own outer format version (§6.1).
pub const NETWORK_DISK_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub u32);

impl StateId {
  pub fn is_label(self) -> bool {
    self.0 & LABEL_MASK != 0
  }

  pub fn from_label(label: u32) -> Self {
    debug_assert_eq!(label & LABEL_MASK, 0);
    StateId(label | LABEL_MASK)
  }

  pub fn label_value(self) -> Option<u32> {
    self.is_label().then_some(self.0 & !LABEL_MASK)
  }

  pub fn state_index(self) -> Option<usize> {
    (!self.is_label()).then_some(self.0 as usize)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeIndex(pub u32);

/// What an HMM state represents acoustically: which tied emission
/// distribution (see [`crate::types::state_sequence`]) and transition
/// model score it to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StateDesc {
  pub emission: u32,
  pub transition_model: u32,
}

#[derive(Debug, Clone)]
pub struct HmmState {
  pub desc: StateDesc,
  successors: BatchId,
}

impl HmmState {
  pub fn has_single_successor(&self) -> bool {
    self.successors.is_single()
  }
}

/// The root state ids belonging to one coarticulated phonetic context.
#[derive(Debug, Clone, Default)]
pub struct Tree {
  pub roots: Array<StateId>,
}

/// The outcome of [`HmmStateNetwork::cleanup`]: how old ids map onto
/// the renumbered network, so every cross-referencing structure (the
/// persistent store's exit table, root-transit descriptions, ...) can
/// be remapped consistently.
#[derive(Debug, Default)]
pub struct CleanupResult {
  pub node_map: OrderedMap<StateId, StateId>,
  pub tree_map: OrderedMap<TreeIndex, TreeIndex>,
}

impl CleanupResult {
  /// Maps an old id through, returning `None` if the state was pruned
  /// as an unreachable dead end.
  pub fn map_state(&self, old: StateId) -> Option<StateId> {
    if old.is_label() {
      Some(old)
    } else {
      self.node_map.get(&old).copied()
    }
  }
}

/// An in-progress edit to one state's successor set: collect
/// additions/removals, then [`ChangePlan::apply`] recomputes the
/// state's successor batch from scratch so the result is always a
/// deduplicated, ascending list — mirroring the original's
/// `add`-then-`remove`-then-`apply` idiom.
#[derive(Debug, Default)]
pub struct ChangePlan {
  add: OrderedSet<StateId>,
  remove: OrderedSet<StateId>,
}

impl ChangePlan {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(mut self, target: StateId) -> Self {
    self.add.insert(target);
    self.remove.remove(&target);
    self
  }

  pub fn remove(mut self, target: StateId) -> Self {
    self.remove.insert(target);
    self.add.remove(&target);
    self
  }

  pub fn apply(self, network: &mut HmmStateNetwork, state: StateId) -> SearchResult<()> {
    let idx = state.state_index().ok_or(NetworkError::UnknownState(state))?;
    let existing: OrderedSet<StateId> = network.successors(state).collect();
    let mut next: OrderedSet<StateId> =
      existing.into_iter().filter(|t| !self.remove.contains(t)).collect();
    next.extend(self.add);

    let mut successors = INVALID_BATCH;
    let ordered: Array<u32> = next.into_iter().map(|id| id.0).collect();
    if !ordered.is_empty() {
      successors = network.edges.append(INVALID_BATCH, &ordered);
    }
    network
      .states
      .get_mut(idx)
      .ok_or(NetworkError::UnknownState(state))?
      .successors = successors;
    Ok(())
  }
}

#[derive(Debug, Default)]
pub struct HmmStateNetwork {
  states: Array<HmmState>,
  trees: Array<Tree>,
  edges: BatchManager,
}

impl HmmStateNetwork {
  pub fn new(merge_batches: bool) -> Self {
    Self { states: Array::new(), trees: Array::new(), edges: BatchManager::new(merge_batches) }
  }

  pub fn allocate_tree(&mut self) -> TreeIndex {
    self.trees.push(Tree::default());
    TreeIndex((self.trees.len() - 1) as u32)
  }

  pub fn add_root_to_tree(&mut self, tree: TreeIndex, root: StateId) -> SearchResult<()> {
    self
      .trees
      .get_mut(tree.0 as usize)
      .ok_or(NetworkError::UnknownTree(tree.0))?
      .roots
      .push(root);
    Ok(())
  }

  pub fn allocate_state(&mut self, desc: StateDesc) -> StateId {
    self.states.push(HmmState { desc, successors: INVALID_BATCH });
    StateId((self.states.len() - 1) as u32)
  }

  pub fn get_state(&self, id: StateId) -> SearchResult<&HmmState> {
    let idx = id.state_index().ok_or(NetworkError::UnknownState(id))?;
    self.states.get(idx).ok_or_else(|| crate::error::SearchError::from(NetworkError::UnknownState(id)))
  }

  pub fn num_states(&self) -> usize {
    self.states.len()
  }

  pub fn trees(&self) -> &[Tree] {
    &self.trees
  }

  pub fn change(&self, _state: StateId) -> ChangePlan {
    ChangePlan::new()
  }

  /// Adds `target` to `state`'s successor set without disturbing the
  /// rest of it, via `BatchManager::append_one`.
  pub fn add_target_to_state(&mut self, state: StateId, target: StateId) -> SearchResult<()> {
    let idx = state.state_index().ok_or(NetworkError::UnknownState(state))?;
    let st = self.states.get_mut(idx).ok_or(NetworkError::UnknownState(state))?;
    st.successors = self.edges.append_one(st.successors, target.0);
    Ok(())
  }

  pub fn successors(&self, state: StateId) -> impl Iterator<Item = StateId> + '_ {
    let batch = state.state_index().and_then(|idx| self.states.get(idx)).map(|s| s.successors);
    SuccessorIter { inner: batch.map(|b| self.edges.iter(b)) }
  }

  /// Reverse-reachability dead-end pruning followed by a forward
  /// topological renumbering from `roots` (design doc §4.2). A state
  /// survives only if it is reachable from some root *and* can itself
  /// reach a label (word-end) successor.
  pub fn cleanup(&mut self, roots: &[StateId]) -> CleanupResult {
    let forward_reachable = self.reachable_from(roots);
    let can_reach_exit = self.can_reach_exit(&forward_reachable);
    let keep: OrderedSet<StateId> =
      forward_reachable.intersection(&can_reach_exit).copied().collect();

    // Forward topological (BFS) order from the roots determines the
    // new, contiguous numbering. States are visited in sibling groups
    // (every child of one state before any child of the next queued
    // state) rather than a flat FIFO, so that the second-order
    // successors of a given state - the children of its children -
    // are renumbered and, below, batch-packed contiguously. This is
    // the `follow`/order-behind packing the original relies on to
    // keep the compacted form's successor lists for siblings adjacent
    // in the flat element array (design doc §4.2).
    let mut node_map = OrderedMap::new();
    let mut order = Array::new();
    let mut group_queue: std::collections::VecDeque<Array<StateId>> =
      std::collections::VecDeque::new();
    let root_group: Array<StateId> = roots.iter().copied().filter(|r| keep.contains(r)).collect();
    let mut seen: OrderedSet<StateId> = root_group.iter().copied().collect();
    if !root_group.is_empty() {
      group_queue.push_back(root_group);
    }
    while let Some(group) = group_queue.pop_front() {
      for &state in &group {
        order.push(state);
      }
      for &state in &group {
        let children: Array<StateId> = self
          .successors(state)
          .filter(|succ| !succ.is_label() && keep.contains(succ) && seen.insert(*succ))
          .collect();
        if !children.is_empty() {
          group_queue.push_back(children);
        }
      }
    }
    for (new_idx, old) in order.iter().enumerate() {
      node_map.insert(*old, StateId(new_idx as u32));
    }

    let mut new_states = Array::with_capacity(order.len());
    let mut new_edges = BatchManager::new(true);
    for old in &order {
      let desc = self.get_state(*old).expect("state in keep-set must exist").desc;
      let mut new_successors: Array<u32> = self
        .successors(*old)
        .filter_map(|succ| {
          if succ.is_label() {
            Some(succ.0)
          } else {
            node_map.get(&succ).map(|mapped| mapped.0)
          }
        })
        .collect();
      new_successors.sort_unstable();
      new_successors.dedup();
      let batch = if new_successors.is_empty() {
        INVALID_BATCH
      } else {
        new_edges.append(INVALID_BATCH, &new_successors)
      };
      new_states.push(HmmState { desc, successors: batch });
    }

    let mut new_trees = Array::with_capacity(self.trees.len());
    let mut tree_map = OrderedMap::new();
    for (old_idx, tree) in self.trees.iter().enumerate() {
      let remapped: Array<StateId> =
        tree.roots.iter().filter_map(|r| node_map.get(r).copied()).collect();
      if remapped.is_empty() {
        continue;
      }
      tree_map.insert(TreeIndex(old_idx as u32), TreeIndex(new_trees.len() as u32));
      new_trees.push(Tree { roots: remapped });
    }

    self.states = new_states;
    self.edges = new_edges;
    self.trees = new_trees;

    CleanupResult { node_map, tree_map }
  }

  fn reachable_from(&self, roots: &[StateId]) -> OrderedSet<StateId> {
    let mut seen: OrderedSet<StateId> = OrderedSet::new();
    let mut queue: std::collections::VecDeque<StateId> = roots.iter().copied().collect();
    for r in roots {
      seen.insert(*r);
    }
    while let Some(state) = queue.pop_front() {
      for succ in self.successors(state) {
        if succ.is_label() || seen.contains(&succ) {
          continue;
        }
        seen.insert(succ);
        queue.push_back(succ);
      }
    }
    seen
  }

  /// States that can reach a label successor, restricted to
  /// `forward_reachable` (states unreachable from the roots can never
  /// contribute to a valid path regardless).
  fn can_reach_exit(&self, forward_reachable: &OrderedSet<StateId>) -> OrderedSet<StateId> {
    let mut live: OrderedSet<StateId> = OrderedSet::new();
    // Fixed point over a small graph; networks built by this crate
    // are acyclic-per-tree in practice, so this converges in one pass
    // over a reverse-topological state order, but a fixed point keeps
    // correctness even if a cycle sneaks in.
    let mut changed = true;
    while changed {
      changed = false;
      for (idx, _) in self.states.iter().enumerate() {
        let state = StateId(idx as u32);
        if !forward_reachable.contains(&state) || live.contains(&state) {
          continue;
        }
        let reaches_exit =
          self.successors(state).any(|s| s.is_label() || live.contains(&s));
        if reaches_exit {
          live.insert(state);
          changed = true;
        }
      }
    }
    live
  }

  /// Serializes the network in the format `PersistentStateTree`
  /// embeds as its `structure` payload (§6.1): a format-version tag,
  /// then the state table, then the tree table.
  pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
    w.write_u32_le(NETWORK_DISK_FORMAT_VERSION)?;
    w.write_u32_le(self.states.len() as u32)?;
    for state in &self.states {
      w.write_u32_le(state.desc.emission)?;
      w.write_u32_le(state.desc.transition_model)?;
      let successors: Array<u32> = self.edges.iter(state.successors).collect();
      w.write_u32_le(successors.len() as u32)?;
      for s in successors {
        w.write_u32_le(s)?;
      }
    }
    w.write_u32_le(self.trees.len() as u32)?;
    for tree in &self.trees {
      w.write_u32_le(tree.roots.len() as u32)?;
      for root in &tree.roots {
        w.write_u32_le(root.0)?;
      }
    }
    Ok(())
  }

  pub fn read(r: &mut impl Read) -> SearchResult<Self> {
    let version = r.read_u32_le()?;
    if version != NETWORK_DISK_FORMAT_VERSION {
      return Err(
        crate::error::PersistError::UnsupportedFormatVersion {
          expected: NETWORK_DISK_FORMAT_VERSION,
          found: version,
        }
        .into(),
      );
    }
    let mut net = Self::new(true);
    let state_count = r.read_u32_le()? as usize;
    let mut raw_successors = Array::with_capacity(state_count);
    for _ in 0..state_count {
      let emission = r.read_u32_le()?;
      let transition_model = r.read_u32_le()?;
      net.allocate_state(StateDesc { emission, transition_model });
      let successor_count = r.read_u32_le()? as usize;
      let mut successors = Array::with_capacity(successor_count);
      for _ in 0..successor_count {
        successors.push(r.read_u32_le()?);
      }
      raw_successors.push(successors);
    }
    for (idx, successors) in raw_successors.into_iter().enumerate() {
      if successors.is_empty() {
        continue;
      }
      let batch = net.edges.append(INVALID_BATCH, &successors);
      net.states[idx].successors = batch;
    }

    let tree_count = r.read_u32_le()? as usize;
    for _ in 0..tree_count {
      let tree = net.allocate_tree();
      let root_count = r.read_u32_le()? as usize;
      for _ in 0..root_count {
        net.add_root_to_tree(tree, StateId(r.read_u32_le()?))?;
      }
    }
    Ok(net)
  }
}

struct SuccessorIter<'a> {
  inner: Option<crate::types::batch::BatchPointerIterator<'a>>,
}

impl<'a> Iterator for SuccessorIter<'a> {
  type Item = StateId;

  fn next(&mut self) -> Option<StateId> {
    self.inner.as_mut()?.next().map(StateId)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn three_state_chain() -> (HmmStateNetwork, StateId, StateId, StateId) {
    let mut net = HmmStateNetwork::new(true);
    let s0 = net.allocate_state(StateDesc { emission: 0, transition_model: 0 });
    let s1 = net.allocate_state(StateDesc { emission: 1, transition_model: 0 });
    let s2 = net.allocate_state(StateDesc { emission: 2, transition_model: 0 });
    net.add_target_to_state(s0, s1).unwrap();
    net.add_target_to_state(s1, s2).unwrap();
    net.add_target_to_state(s2, StateId::from_label(7)).unwrap();
    (net, s0, s1, s2)
  }

  #[test]
  fn chain_round_trips_through_successors() {
    let (net, s0, s1, s2) = three_state_chain();
    assert_eq!(net.successors(s0).collect::<Vec<_>>(), vec![s1]);
    assert_eq!(net.successors(s1).collect::<Vec<_>>(), vec![s2]);
    let exits: Vec<_> = net.successors(s2).collect();
    assert_eq!(exits, vec![StateId::from_label(7)]);
    assert!(exits[0].is_label());
    assert_eq!(exits[0].label_value(), Some(7));
  }

  #[test]
  fn cleanup_prunes_unreachable_dead_ends() {
    let (mut net, s0, _s1, _s2) = three_state_chain();
    let dead = net.allocate_state(StateDesc { emission: 9, transition_model: 0 });
    // `dead` has no path to any label and is not reachable from s0.
    let result = net.cleanup(&[s0]);
    assert_eq!(net.num_states(), 3, "dead-end state must be pruned");
    assert!(result.map_state(dead).is_none());
    assert!(result.map_state(s0).is_some());
  }

  #[test]
  fn cleanup_packs_second_order_successors_of_a_shared_parent_contiguously() {
    let mut net = HmmStateNetwork::new(true);
    let root = net.allocate_state(StateDesc::default());
    let t1 = net.allocate_state(StateDesc::default());
    let t2 = net.allocate_state(StateDesc::default());
    net.add_target_to_state(root, t1).unwrap();
    net.add_target_to_state(root, t2).unwrap();

    // Give each of root's two children (t1, t2) two successors of
    // their own, so each gets a real chained batch record rather than
    // a singleton.
    for (t, base) in [(t1, 10u32), (t2, 20u32)] {
      let a = net.allocate_state(StateDesc { emission: base, transition_model: 0 });
      let b = net.allocate_state(StateDesc { emission: base + 1, transition_model: 0 });
      net.add_target_to_state(t, a).unwrap();
      net.add_target_to_state(t, b).unwrap();
      net.add_target_to_state(a, StateId::from_label(1)).unwrap();
      net.add_target_to_state(b, StateId::from_label(1)).unwrap();
    }

    let result = net.cleanup(&[root]);
    let new_t1 = result.map_state(t1).unwrap();
    let new_t2 = result.map_state(t2).unwrap();

    let batch_t1 = net.states[new_t1.0 as usize].successors;
    let batch_t2 = net.states[new_t2.0 as usize].successors;
    let (_, end_t1) = net.edges.single_range(batch_t1).expect("t1 successors form one record");
    let (start_t2, _) = net.edges.single_range(batch_t2).expect("t2 successors form one record");
    assert_eq!(end_t1, start_t2, "siblings' second-order successor batches must be adjacent");
  }

  #[test]
  fn change_plan_dedupes_and_orders_successors() {
    let mut net = HmmStateNetwork::new(true);
    let s0 = net.allocate_state(StateDesc::default());
    let a = net.allocate_state(StateDesc::default());
    let b = net.allocate_state(StateDesc::default());
    let plan = net.change(s0).add(b).add(a).add(a);
    plan.apply(&mut net, s0).unwrap();
    let succ: Vec<_> = net.successors(s0).collect();
    assert_eq!(succ, vec![a, b]);
  }
}
