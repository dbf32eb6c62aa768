use thiserror::Error;

use crate::types::network::StateId;

/// Top level error type for every fallible operation in this crate.
///
/// Each variant groups the failures of one component (§7 of the design
/// doc). Callers match on the outer kind first and drill into the
/// inner detail only when they need to.
#[derive(Debug, Error)]
pub enum SearchError {
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("batch manager error: {0}")]
  Batch(#[from] BatchError),

  #[error("network error: {0}")]
  Network(#[from] NetworkError),

  #[error("persistent store error: {0}")]
  Persist(#[from] PersistError),

  #[error("look-ahead cache error: {0}")]
  Lookahead(#[from] LookaheadError),

  #[error("decoder error: {0}")]
  Decode(#[from] DecodeError),

  #[error("confusion network error: {0}")]
  Confusion(#[from] ConfusionError),

  #[error("mbr decoder error: {0}")]
  Mbr(#[from] MbrError),
}

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug, Error)]
pub enum BatchError {
  #[error("batch id {0} does not exist")]
  UnknownBatch(u32),
  #[error("attempted to append to a batch that is not the last batch in its chain")]
  NotLastBatch,
  #[error("batch chain verification failed at element {index}: expected next {expected}, found {found}")]
  ChainBroken { index: u32, expected: u32, found: u32 },
}

#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("state id {0:?} is out of range")]
  UnknownState(StateId),
  #[error("tree index {0} is out of range")]
  UnknownTree(u32),
  #[error("cannot allocate a new tree: tree index space exhausted")]
  TreeSpaceExhausted,
  #[error("cleanup() left {0} states unreachable from their own roots after remap, which should be impossible")]
  CleanupInvariantViolated(usize),
}

#[derive(Debug, Error)]
pub enum PersistError {
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
  #[error("disk format version {found} is not supported (expected {expected})")]
  UnsupportedFormatVersion { expected: u32, found: u32 },
  #[error("dependency checksum mismatch: image was built against {found:#x}, current dependencies are {expected:#x}")]
  DependencyChecksumMismatch { expected: u64, found: u64 },
  #[error("network error while (de)serializing: {0}")]
  Network(#[from] NetworkError),
}

#[derive(Debug, Error)]
pub enum LookaheadError {
  #[error("no lookahead table is cached for history id {0}")]
  NotCached(u64),
  #[error("lookahead id {0} is out of range for this construction tree")]
  UnknownLookaheadId(u32),
  #[error("sparse hash table is full; checkResize should have triggered a resize before this")]
  SparseTableFull,
}

#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("no active hypotheses remain at frame {0}; the search space collapsed")]
  SearchSpaceCollapsed(usize),
  #[error("acoustic score source exhausted at frame {0}")]
  OutOfFrames(usize),
  #[error("network error while decoding: {0}")]
  Network(#[from] NetworkError),
}

#[derive(Debug, Error)]
pub enum ConfusionError {
  #[error("slot {0} failed to normalize: posterior mass summed to {1}, expected 1.0 +/- 0.01")]
  NotNormalized(usize, f32),
  #[error("lattice is empty; there is nothing to build a confusion network from")]
  EmptyLattice,
}

#[derive(Debug, Error)]
pub enum MbrError {
  #[error("context size must be >= 0, window size derives as 2*context_size+1")]
  InvalidContextSize,
  #[error("confusion network has no slots to align against")]
  EmptySlots,
}
