use serde::{Deserialize, Serialize};

/// Tunable knobs for the decoding pipeline, gathered in one place the
/// way the construction-time options of each original component were
/// gathered behind `Core::Component` parameter blocks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct DecoderConfig {
  /// Acoustic beam width applied during per-frame HMM-state pruning
  /// (stage 2 of the per-frame pipeline). Hypotheses whose score
  /// exceeds `best + acoustic_pruning_threshold` are dropped.
  pub acoustic_pruning_threshold: f32,
  /// Beam width applied to newly expanded arcs after LM look-ahead
  /// scoring (stage 7).
  pub lm_lookahead_pruning_threshold: f32,
  /// Maximum number of surviving hypotheses kept per HMM state
  /// (stage 3).
  pub states_per_state_limit: u32,
  /// Global cap on the number of active hypotheses; once exceeded,
  /// histogram pruning (stage 4) trims down to this count.
  pub max_active_hyps: u32,

  /// Maximum history length considered when building look-ahead
  /// construction trees.
  pub history_limit: u32,
  /// Depth at which the look-ahead construction tree is cut off and
  /// replaced with a single combined node.
  pub tree_cutoff: u32,
  /// Minimum number of distinct successors a look-ahead node must
  /// have to be worth representing explicitly.
  pub minimum_representation: u32,
  /// Low water mark for the look-ahead table MRU cache: eviction stops
  /// once the cache shrinks to this size.
  pub cache_size_low_mark: u32,
  /// High water mark: eviction starts once the cache grows past this
  /// size.
  pub cache_size_high_mark: u32,
  /// Expected-value threshold above which a look-ahead table is built
  /// sparse rather than dense.
  pub sparse_threshold_expectation_based: f32,
  /// Observed-fill threshold above which a sparse look-ahead table is
  /// built.
  pub sparse_lookahead_threshold: f32,
  /// Multiplier applied to the predicted fill count when sizing a new
  /// sparse hash table.
  pub sparse_hash_size_factor: f32,

  /// Half-window size for the windowed Levenshtein decoder; the full
  /// window is `2 * context_size + 1`.
  pub context_size: u32,
  /// Risk-threshold pruning margin added to the current best risk
  /// (C8 `Pruning::riskThreshold`).
  pub pruning_threshold: f32,
  /// Number of leading slots exempt from risk-threshold pruning.
  pub pruning_supply_size: u32,
  /// Pruning is (re-)applied every this many slots once past
  /// `pruning_supply_size`.
  pub pruning_interval: u32,

  /// Enables merging a newly appended batch range into an existing
  /// batch when the ranges are exactly contiguous (C1).
  pub merge_batches: bool,
}

impl Default for DecoderConfig {
  fn default() -> Self {
    Self {
      acoustic_pruning_threshold: 18.0,
      lm_lookahead_pruning_threshold: 14.0,
      states_per_state_limit: 6,
      max_active_hyps: 50_000,

      history_limit: 2,
      tree_cutoff: 1_000,
      minimum_representation: 4,
      cache_size_low_mark: 400,
      cache_size_high_mark: 500,
      sparse_threshold_expectation_based: 0.1,
      sparse_lookahead_threshold: 0.05,
      sparse_hash_size_factor: 2.0,

      context_size: 1,
      pruning_threshold: 1.0,
      pruning_supply_size: 0,
      pruning_interval: 1,

      merge_batches: true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_window_size_is_three() {
    let cfg = DecoderConfig::default();
    assert_eq!(2 * cfg.context_size + 1, 3);
  }
}
