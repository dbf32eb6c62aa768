//! Tied state-sequence table (design doc §4.4).
//!
//! Many allophones in different phonetic contexts end up sharing the
//! exact same chain of HMM state descriptors (acoustic tying). Rather
//! than let the network carry a duplicate state chain per allophone,
//! [`TiedStateSequenceMap`] deduplicates chains by structural equality
//! and hands out one canonical index per distinct chain.

use crate::types::network::StateDesc;
use crate::types::proxy::{Array, OrderedMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmissionId(pub u32);

#[derive(Debug, Default)]
pub struct TiedStateSequenceMap {
  by_sequence: OrderedMap<Array<StateDesc>, EmissionId>,
  sequences: Array<Array<StateDesc>>,
}

impl TiedStateSequenceMap {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the canonical [`EmissionId`] for `sequence`, interning it
  /// as a new entry if this exact chain hasn't been seen before.
  pub fn intern(&mut self, sequence: &[StateDesc]) -> EmissionId {
    if let Some(&id) = self.by_sequence.get(sequence) {
      return id;
    }
    let id = EmissionId(self.sequences.len() as u32);
    self.sequences.push(sequence.to_vec());
    self.by_sequence.insert(sequence.to_vec(), id);
    id
  }

  pub fn sequence(&self, id: EmissionId) -> Option<&[StateDesc]> {
    self.sequences.get(id.0 as usize).map(Array::as_slice)
  }

  /// Number of distinct tied sequences interned so far.
  pub fn len(&self) -> usize {
    self.sequences.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sequences.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn seq(vals: &[u32]) -> Array<StateDesc> {
    vals.iter().map(|&v| StateDesc { emission: v, transition_model: 0 }).collect()
  }

  #[test]
  fn identical_sequences_share_one_id() {
    let mut map = TiedStateSequenceMap::new();
    let a = map.intern(&seq(&[1, 2, 3]));
    let b = map.intern(&seq(&[1, 2, 3]));
    assert_eq!(a, b);
    assert_eq!(map.len(), 1);
  }

  #[test]
  fn distinct_sequences_get_distinct_ids() {
    let mut map = TiedStateSequenceMap::new();
    let a = map.intern(&seq(&[1, 2, 3]));
    let b = map.intern(&seq(&[1, 2, 4]));
    assert_ne!(a, b);
    assert_eq!(map.len(), 2);
    assert_eq!(map.sequence(a), Some(seq(&[1, 2, 3]).as_slice()));
  }
}
