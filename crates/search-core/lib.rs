//! Core decoding subsystems of a large-vocabulary continuous speech
//! recognizer: a compiled HMM state network, the persistent store that
//! keeps it off disk between runs, the time-synchronous Viterbi search
//! over it, and the confusion-network / windowed Levenshtein machinery
//! used to turn a lattice of hypotheses into a single minimum Bayes
//! risk transcript.

pub mod collab;
pub mod compile;
pub mod config;
pub mod error;
pub mod types;

pub use config::DecoderConfig;
pub use error::{SearchError, SearchResult};
