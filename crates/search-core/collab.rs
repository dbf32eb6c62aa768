//! Collaborator interfaces (design doc §4.9 / §6.4).
//!
//! The decoder, the confusion-network builder and the MBR decoder are
//! all written against these traits rather than against a concrete
//! acoustic model, language model, lexicon or lattice implementation.
//! This is the Rust-native collapse of what the original keeps as
//! separate `Core::Component`-derived collaborator class hierarchies:
//! here they're trait objects the algorithmic code borrows.

use crate::types::network::StateDesc;
use crate::types::score::Score;
use crate::types::state_sequence::EmissionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WordId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LatticeNodeId(pub u32);

/// Supplies per-frame, per-emission acoustic scores.
pub trait AcousticModel {
  fn score(&self, state: EmissionId, frame: usize) -> Score;
  fn num_emissions(&self) -> usize;
}

/// Supplies LM scores for a word given its history, plus the back-off
/// score used when a context's look-ahead table is built sparse.
pub trait LanguageModel {
  fn score(&self, history: &[WordId], word: WordId) -> Score;
  fn back_off_score(&self, history: &[WordId]) -> Score;
}

/// Maps a word to the tied HMM state sequence that pronounces it.
pub trait Lexicon {
  fn state_sequence(&self, word: WordId) -> &[StateDesc];
}

#[derive(Debug, Clone, Copy)]
pub struct LatticeArc {
  pub target: LatticeNodeId,
  pub label: WordId,
  pub score: Score,
  pub begin_time: u32,
  pub end_time: u32,
}

/// The minimal forward/backward-decorated arc iteration the
/// confusion-network builder needs; collapses `Fsa`/`Flf` lattice
/// types down to one borrowable trait.
pub trait Lattice {
  fn arcs_from(&self, node: LatticeNodeId) -> &[LatticeArc];
  fn forward_score(&self, node: LatticeNodeId) -> Score;
  fn backward_score(&self, node: LatticeNodeId) -> Score;
  fn final_nodes(&self) -> &[LatticeNodeId];
  fn initial_node(&self) -> LatticeNodeId;
}
