//! Time-synchronous Viterbi decoder (design doc §4.6): the per-frame
//! pipeline that expands, prunes and scores hypotheses over the
//! compiled [`HmmStateNetwork`].

use crate::collab::AcousticModel;
use crate::config::DecoderConfig;
use crate::error::{DecodeError, SearchResult};
use crate::types::network::{HmmStateNetwork, StateId};
use crate::types::proxy::{Array, OrderedMap};
use crate::types::score::{Score, INVALID_SCORE};
use crate::types::state_sequence::EmissionId;

/// One surviving hypothesis at a given HMM state, before its
/// successors have been expanded for the next frame.
#[derive(Debug, Clone, Copy)]
pub struct HmmStateHypothesis {
  pub score: Score,
  pub back_pointer: u32,
  pub hmm_state_index: StateId,
}

/// One recorded word-end event: a hypothesis passed through a label
/// (exit) successor at some frame. Forms a back-trace chain through
/// `predecessor`.
#[derive(Debug, Clone, Copy)]
pub struct BackPointer {
  pub frame: usize,
  pub label: u32,
  pub score: Score,
  pub predecessor: Option<u32>,
}

/// An arc of the network currently under active expansion — kept
/// separate from [`HmmStateHypothesis`] so the per-frame pipeline can
/// reason about "the state I'm scoring now" versus "the successor arc
/// I might expand into" without conflating the two.
#[derive(Debug, Clone, Copy)]
pub struct ArcHypothesis {
  pub state: StateId,
  pub target: StateId,
  pub end: bool,
  pub best_score: Score,
}

pub struct TimeSyncDecoder<'a, A: AcousticModel> {
  config: DecoderConfig,
  acoustic: &'a A,
  network: &'a HmmStateNetwork,
  active: Array<HmmStateHypothesis>,
  back_pointers: Array<BackPointer>,
}

impl<'a, A: AcousticModel> TimeSyncDecoder<'a, A> {
  pub fn new(config: DecoderConfig, acoustic: &'a A, network: &'a HmmStateNetwork, roots: &[StateId]) -> Self {
    let active = roots
      .iter()
      .map(|&s| HmmStateHypothesis { score: 0.0, back_pointer: u32::MAX, hmm_state_index: s })
      .collect();
    Self { config, acoustic, network, active, back_pointers: Array::new() }
  }

  pub fn num_active(&self) -> usize {
    self.active.len()
  }

  pub fn back_pointers(&self) -> &[BackPointer] {
    &self.back_pointers
  }

  /// Runs one frame of the eight-stage pipeline (design doc §4.6):
  /// acoustic scoring + beam pruning, per-state pruning, histogram
  /// pruning, exit emission, arc expansion with look-ahead scoring,
  /// look-ahead-beam pruning, and the active/next swap.
  pub fn decode_frame(&mut self, frame: usize) -> SearchResult<()> {
    self.decode_frame_with_lookahead(frame, |_| 0.0)
  }

  pub fn decode_frame_with_lookahead(
    &mut self,
    frame: usize,
    lookahead: impl Fn(StateId) -> Score,
  ) -> SearchResult<()> {
    if self.active.is_empty() {
      return Err(DecodeError::SearchSpaceCollapsed(frame).into());
    }

    // Stage 1 + 2: acoustic scoring and beam pruning.
    let mut scored = Array::with_capacity(self.active.len());
    let mut best = INVALID_SCORE;
    for hyp in &self.active {
      let state = self.network.get_state(hyp.hmm_state_index)?;
      let acoustic = self.acoustic.score(EmissionId(state.desc.emission), frame);
      let score = hyp.score + acoustic;
      best = best.min(score);
      scored.push(HmmStateHypothesis { score, ..*hyp });
    }
    let beam = best + self.config.acoustic_pruning_threshold;
    scored.retain(|h| h.score <= beam);

    // Stage 3: per-state pruning, keep only the best N hypotheses per
    // distinct HMM state.
    let mut per_state: OrderedMap<StateId, Array<HmmStateHypothesis>> = OrderedMap::new();
    for hyp in scored {
      per_state.entry(hyp.hmm_state_index).or_default().push(hyp);
    }
    let mut pruned = Array::new();
    for bucket in per_state.values_mut() {
      bucket.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
      bucket.truncate(self.config.states_per_state_limit as usize);
      pruned.extend_from_slice(bucket);
    }

    // Stage 4: histogram pruning, bucketed by score - best, once the
    // population exceeds the global cap.
    if pruned.len() > self.config.max_active_hyps as usize {
      let best = pruned.iter().map(|h| h.score).fold(INVALID_SCORE, f32::min);
      pruned.sort_by(|a, b| (a.score - best).partial_cmp(&(b.score - best)).unwrap());
      pruned.truncate(self.config.max_active_hyps as usize);
      tracing::debug!(frame, kept = pruned.len(), "histogram pruning engaged");
    }

    // Stage 5: arc-exit emission for hypotheses sitting on a label
    // successor, recorded into the back-pointer table.
    for hyp in &pruned {
      for succ in self.network.successors(hyp.hmm_state_index) {
        if let Some(label) = succ.label_value() {
          self.back_pointers.push(BackPointer {
            frame,
            label,
            score: hyp.score,
            predecessor: (hyp.back_pointer != u32::MAX).then_some(hyp.back_pointer),
          });
        }
      }
    }

    // Stage 6 + 7: arc expansion to network successors, scored with
    // look-ahead, then look-ahead-beam pruning of the newly expanded
    // arcs. Self-loops (staying at the same state for the next frame)
    // are carried over unscored by look-ahead, matching the original's
    // treatment of intra-state transitions.
    let mut expanded = Array::new();
    for hyp in &pruned {
      expanded.push(*hyp);
      for succ in self.network.successors(hyp.hmm_state_index) {
        if succ.is_label() {
          continue;
        }
        let la = lookahead(succ);
        expanded.push(HmmStateHypothesis {
          score: hyp.score + la,
          back_pointer: hyp.back_pointer,
          hmm_state_index: succ,
        });
      }
    }
    if !expanded.is_empty() {
      let best = expanded.iter().map(|h| h.score).fold(INVALID_SCORE, f32::min);
      let beam = best + self.config.lm_lookahead_pruning_threshold;
      expanded.retain(|h| h.score <= beam);
    }

    // Stage 8: swap current/new hypothesis arrays.
    self.active = expanded;
    Ok(())
  }

  /// The single best-scoring active hypothesis, if any.
  pub fn best(&self) -> Option<&HmmStateHypothesis> {
    self.active.iter().min_by(|a, b| a.score.partial_cmp(&b.score).unwrap())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::network::StateDesc;

  struct ConstantAcoustic;
  impl AcousticModel for ConstantAcoustic {
    fn score(&self, state: EmissionId, _frame: usize) -> Score {
      state.0 as f32 * 0.1
    }
    fn num_emissions(&self) -> usize {
      8
    }
  }

  fn two_frame_chain() -> (HmmStateNetwork, StateId) {
    let mut net = HmmStateNetwork::new(true);
    let s0 = net.allocate_state(StateDesc { emission: 1, transition_model: 0 });
    let s1 = net.allocate_state(StateDesc { emission: 2, transition_model: 0 });
    net.add_target_to_state(s0, s1).unwrap();
    net.add_target_to_state(s1, StateId::from_label(3)).unwrap();
    (net, s0)
  }

  #[test]
  fn decoding_emits_a_word_end_back_pointer() {
    let (net, s0) = two_frame_chain();
    let acoustic = ConstantAcoustic;
    let mut decoder = TimeSyncDecoder::new(DecoderConfig::default(), &acoustic, &net, &[s0]);
    decoder.decode_frame(0).unwrap();
    decoder.decode_frame(1).unwrap();
    assert!(decoder.num_active() > 0);
    assert!(!decoder.back_pointers().is_empty(), "reaching the label successor should emit a back pointer");
    assert_eq!(decoder.back_pointers()[0].label, 3);
  }

  #[test]
  fn empty_search_space_is_reported() {
    let mut net = HmmStateNetwork::new(true);
    let s0 = net.allocate_state(StateDesc::default());
    let acoustic = ConstantAcoustic;
    let mut decoder = TimeSyncDecoder::new(DecoderConfig::default(), &acoustic, &net, &[s0]);
    decoder.active.clear();
    assert!(decoder.decode_frame(0).is_err());
  }
}
