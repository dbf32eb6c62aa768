use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use search_core::collab::{AcousticModel, Lattice, LatticeArc, LatticeNodeId, WordId};
use search_core::compile::confusion::{build_confusion_network, estimate_posteriors};
use search_core::compile::decoder::TimeSyncDecoder;
use search_core::compile::mbr::MbrDecoder;
use search_core::config::DecoderConfig;
use search_core::types::network::{HmmStateNetwork, StateDesc, StateId};
use search_core::types::persistent::{PersistentStateTree, ReadOutcome};
use search_core::types::score::{from_probability, Score};
use search_core::types::state_sequence::EmissionId;

#[derive(Parser)]
#[command(name = "search-decode", about = "LVCSR decoding subsystem toolkit")]
struct Cli {
  /// Optional TOML file overlaying the default decoder configuration.
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Network state graph operations.
  Network {
    #[command(subcommand)]
    action: NetworkAction,
  },
  /// Run the time-synchronous decoder over a JSON-described frame score table.
  Decode {
    /// Path to a persisted network image.
    #[arg(long)]
    network: PathBuf,
    /// Path to a JSON file of per-frame, per-emission acoustic scores.
    #[arg(long)]
    scores: PathBuf,
    /// Dependency checksum the persisted image was built against.
    #[arg(long, default_value_t = 0)]
    checksum: u64,
  },
  /// Run the windowed Levenshtein MBR decoder over a JSON confusion network.
  Mbr {
    #[arg(long)]
    confusion: PathBuf,
  },
}

#[derive(Subcommand)]
enum NetworkAction {
  /// Build a small demo network from a JSON chain description and persist it.
  Build {
    #[arg(long)]
    chain: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = 0)]
    checksum: u64,
  },
  /// Read a persisted network image and print summary statistics.
  Inspect {
    #[arg(long)]
    network: PathBuf,
    #[arg(long, default_value_t = 0)]
    checksum: u64,
  },
}

fn load_config(path: Option<&Path>) -> Result<DecoderConfig> {
  match path {
    None => Ok(DecoderConfig::default()),
    Some(path) => {
      let text = fs::read_to_string(path)
        .with_context(|| format!("reading decoder config from {}", path.display()))?;
      toml::from_str(&text).with_context(|| format!("parsing decoder config {}", path.display()))
    }
  }
}

#[derive(Deserialize)]
struct ChainDescription {
  /// One emission id per state, chained state[i] -> state[i+1], with
  /// the final state exiting through `final_label`.
  emissions: Vec<u32>,
  final_label: u32,
}

#[derive(Deserialize)]
struct ScoreTable {
  /// `frames[f][e]` is the acoustic score for emission `e` at frame `f`.
  frames: Vec<Vec<Score>>,
}

struct TableAcoustic {
  frames: Vec<Vec<Score>>,
}

impl AcousticModel for TableAcoustic {
  fn score(&self, state: EmissionId, frame: usize) -> Score {
    self.frames.get(frame).and_then(|row| row.get(state.0 as usize)).copied().unwrap_or(search_core::types::score::INVALID_SCORE)
  }
  fn num_emissions(&self) -> usize {
    self.frames.first().map(|row| row.len()).unwrap_or(0)
  }
}

#[derive(Deserialize)]
struct JsonSlot {
  begin: u32,
  end: u32,
  /// `(word id, probability)` pairs; converted to `-log` scores on load.
  candidates: Vec<(u32, f64)>,
}

#[derive(Deserialize)]
struct JsonConfusionNetwork {
  slots: Vec<JsonSlot>,
}

/// A minimal chain lattice built directly from a JSON confusion
/// network: node `i` -> node `i+1` carries one arc per candidate at
/// slot `i`. Forward/backward scores are trivially zero since each
/// slot's candidate scores are taken as already normalized, giving
/// [`build_confusion_network`] and [`estimate_posteriors`] a real
/// (if topologically trivial) lattice to walk.
struct FlatLattice {
  arcs: Vec<Vec<LatticeArc>>,
  final_node: LatticeNodeId,
}

impl FlatLattice {
  fn from_slots(slots: &[JsonSlot]) -> Self {
    let arcs = slots
      .iter()
      .enumerate()
      .map(|(i, slot)| {
        slot
          .candidates
          .iter()
          .map(|&(w, p)| LatticeArc {
            target: LatticeNodeId((i + 1) as u32),
            label: WordId(w),
            score: from_probability(p),
            begin_time: i as u32,
            end_time: (i + 1) as u32,
          })
          .collect()
      })
      .collect();
    Self { arcs, final_node: LatticeNodeId(slots.len() as u32) }
  }
}

impl Lattice for FlatLattice {
  fn arcs_from(&self, node: LatticeNodeId) -> &[LatticeArc] {
    self.arcs.get(node.0 as usize).map(Vec::as_slice).unwrap_or(&[])
  }
  fn forward_score(&self, _node: LatticeNodeId) -> Score {
    0.0
  }
  fn backward_score(&self, _node: LatticeNodeId) -> Score {
    0.0
  }
  fn final_nodes(&self) -> &[LatticeNodeId] {
    std::slice::from_ref(&self.final_node)
  }
  fn initial_node(&self) -> LatticeNodeId {
    LatticeNodeId(0)
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

  let cli = Cli::parse();
  let config = load_config(cli.config.as_deref())?;

  match cli.command {
    Command::Network { action } => run_network(action, &config),
    Command::Decode { network, scores, checksum } => run_decode(&network, &scores, checksum, &config),
    Command::Mbr { confusion } => run_mbr(&confusion, &config),
  }
}

fn run_network(action: NetworkAction, config: &DecoderConfig) -> Result<()> {
  match action {
    NetworkAction::Build { chain, output, checksum } => {
      let text = fs::read_to_string(&chain).with_context(|| format!("reading chain description {}", chain.display()))?;
      let desc: ChainDescription = serde_json::from_str(&text)?;

      let mut net = HmmStateNetwork::new(config.merge_batches);
      let tree = net.allocate_tree();
      let mut states = Vec::with_capacity(desc.emissions.len());
      for &emission in &desc.emissions {
        states.push(net.allocate_state(StateDesc { emission, transition_model: 0 }));
      }
      if let Some(&root) = states.first() {
        net.add_root_to_tree(tree, root)?;
      }
      for pair in states.windows(2) {
        net.add_target_to_state(pair[0], pair[1])?;
      }
      if let Some(&last) = states.last() {
        net.add_target_to_state(last, StateId::from_label(desc.final_label))?;
      }

      let (&root, &ci_root) = (states.first().unwrap(), states.first().unwrap());
      let pst = PersistentStateTree::new(net, root, ci_root);
      let mut file = fs::File::create(&output).with_context(|| format!("creating {}", output.display()))?;
      pst.write(&mut file, checksum)?;
      println!("wrote {} states to {}", desc.emissions.len(), output.display());
      Ok(())
    }
    NetworkAction::Inspect { network, checksum } => {
      let mut file = fs::File::open(&network).with_context(|| format!("opening {}", network.display()))?;
      match PersistentStateTree::read(&mut file, checksum)? {
        ReadOutcome::Loaded(pst) => {
          println!("states: {}", pst.structure.num_states());
          println!("exits: {}", pst.exits.len());
          println!("root_state: {:?}", pst.root_state);
          println!("coarticulated_root_states: {}", pst.coarticulated_root_states.len());
          Ok(())
        }
        ReadOutcome::RebuildRequired { reason } => {
          println!("rebuild required: {reason}");
          Ok(())
        }
      }
    }
  }
}

fn run_decode(network_path: &Path, scores_path: &Path, checksum: u64, config: &DecoderConfig) -> Result<()> {
  let mut file = fs::File::open(network_path).with_context(|| format!("opening {}", network_path.display()))?;
  let pst = match PersistentStateTree::read(&mut file, checksum)? {
    ReadOutcome::Loaded(pst) => pst,
    ReadOutcome::RebuildRequired { reason } => anyhow::bail!("network image requires a rebuild: {reason}"),
  };

  let text = fs::read_to_string(scores_path).with_context(|| format!("reading {}", scores_path.display()))?;
  let table: ScoreTable = serde_json::from_str(&text)?;
  let acoustic = TableAcoustic { frames: table.frames };
  let num_frames = acoustic.frames.len();

  let roots = pst.structure.trees().iter().flat_map(|t| t.roots.iter().copied()).collect::<Vec<_>>();
  let mut decoder = TimeSyncDecoder::new(*config, &acoustic, &pst.structure, &roots);
  for frame in 0..num_frames {
    decoder.decode_frame(frame)?;
  }

  println!("active hypotheses: {}", decoder.num_active());
  for bp in decoder.back_pointers() {
    println!("frame={} label={} score={:.4}", bp.frame, bp.label, bp.score);
  }
  if let Some(best) = decoder.best() {
    println!("best score: {:.4}", best.score);
  }
  Ok(())
}

fn run_mbr(confusion_path: &Path, config: &DecoderConfig) -> Result<()> {
  let text = fs::read_to_string(confusion_path).with_context(|| format!("reading {}", confusion_path.display()))?;
  let json: JsonConfusionNetwork = serde_json::from_str(&text)?;

  let lattice = FlatLattice::from_slots(&json.slots);
  let cn = build_confusion_network(&lattice, None)?;
  let trees = estimate_posteriors(&lattice, &cn, config.context_size);

  let decoder = MbrDecoder::new(config);
  let result = decoder.decode(&trees)?;
  if result.aborted {
    println!("utterance aborted by pruning; best risk = +inf");
    return Ok(());
  }
  for word in &result.words {
    println!("label={} risk={:.4}", word.label.0, word.risk);
  }
  println!("total risk: {:.4}", result.total_risk);
  Ok(())
}
