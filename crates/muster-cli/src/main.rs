use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use muster_core::{EmbeddingStore, Observation};
use muster_engine::{
    Engine, EngineConfig, NullSubmissionChannel, RecordStore, SessionOptions,
};
use muster_store::{load_snapshot_file, save_snapshot_file, SqliteRecordStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser)]
#[command(name = "muster", about = "Muster biometric attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Individual,
    Group,
    Verification,
}

impl Mode {
    fn options(self) -> SessionOptions {
        match self {
            Mode::Individual => SessionOptions::individual(),
            Mode::Group => SessionOptions::group(),
            Mode::Verification => SessionOptions::verification(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from a captured observation file
    Enroll {
        /// Identity key, assigned by the backend
        #[arg(short, long)]
        id: String,
        /// JSON file holding one Observation
        #[arg(short, long)]
        observation: PathBuf,
        /// Gallery snapshot file (created if absent)
        #[arg(short, long)]
        snapshot: PathBuf,
        /// Replace the active template instead of enrolling fresh
        #[arg(long)]
        re_enroll: bool,
    },
    /// Replay a recorded capture session through the engine
    Replay {
        /// Session identifier
        #[arg(long)]
        session: String,
        /// JSON file holding the frames: an array of observation arrays
        #[arg(short, long)]
        frames: PathBuf,
        /// Gallery snapshot file
        #[arg(short, long)]
        snapshot: PathBuf,
        #[arg(short, long, value_enum, default_value = "individual")]
        mode: Mode,
        /// Persist attendance records into this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Summarize a gallery snapshot
    Snapshot {
        #[arg(short, long)]
        snapshot: PathBuf,
    },
    /// List persisted attendance records
    Records {
        #[arg(long)]
        db: PathBuf,
        /// Restrict to one session
        #[arg(long)]
        session: Option<String>,
    },
    /// Generate a synthetic gallery and capture burst for pipeline tests
    Synth {
        /// Number of identities to enroll
        #[arg(long, default_value_t = 3)]
        identities: usize,
        /// Number of frames in the generated session
        #[arg(long, default_value_t = 12)]
        frames: usize,
        #[arg(long, default_value_t = 512)]
        dim: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Where to write the gallery snapshot
        #[arg(long)]
        out_snapshot: PathBuf,
        /// Where to write the session frames
        #[arg(long)]
        out_frames: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Enroll { id, observation, snapshot, re_enroll } => {
            let store = Arc::new(open_gallery(&snapshot, &config)?);
            let observation: Observation = read_json(&observation)?;

            let workflow = muster_engine::EnrollmentWorkflow::new(&config, Arc::clone(&store));
            let receipt = if re_enroll {
                workflow.re_enroll_candidate(&id, &observation)
            } else {
                workflow.enroll_candidate(&id, &observation)
            }?;

            save_snapshot_file(&store, &snapshot)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Replay { session, frames, snapshot, mode, db } => {
            let store = Arc::new(load_snapshot_file(&snapshot, config.template_history_bound)?);
            let frames: Vec<Vec<Observation>> = read_json(&frames)?;

            match db {
                Some(path) => {
                    let records = SqliteRecordStore::open(&path).await?;
                    let engine = Engine::with_store(config, store, records, NullSubmissionChannel);
                    replay(&engine, &session, mode, frames).await?;
                }
                None => {
                    let records = muster_engine::MemoryRecordStore::new();
                    let engine = Engine::with_store(config, store, records, NullSubmissionChannel);
                    replay(&engine, &session, mode, frames).await?;
                }
            }
        }
        Commands::Snapshot { snapshot } => {
            let store = load_snapshot_file(&snapshot, config.template_history_bound)?;
            println!("dim: {}  identities: {}", store.dim(), store.len());
            for identity in store.snapshot() {
                println!(
                    "{}  enrolled: {}  history: {}  last match: {}",
                    identity.id,
                    identity.enrolled_at.to_rfc3339(),
                    identity.template_history.len(),
                    identity
                        .last_matched_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
        }
        Commands::Records { db, session } => {
            let store = SqliteRecordStore::open(&db).await?;
            let records = store.list(session).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Synth { identities, frames, dim, seed, out_snapshot, out_frames } => {
            synth(identities, frames, dim, seed, &out_snapshot, &out_frames, &config)?;
            println!(
                "wrote {identities} identities to {} and {frames} frames to {}",
                out_snapshot.display(),
                out_frames.display()
            );
        }
    }

    Ok(())
}

async fn replay<R: RecordStore>(
    engine: &Engine<R, NullSubmissionChannel>,
    session: &str,
    mode: Mode,
    frames: Vec<Vec<Observation>>,
) -> Result<()> {
    engine.begin_session(session, mode.options())?;
    for (i, observations) in frames.into_iter().enumerate() {
        let report = engine.feed_frame(session, observations).await?;
        tracing::debug!(
            frame = i,
            sampled_out = report.sampled_out,
            observations = report.observations.len(),
            "frame replayed"
        );
    }
    let result = engine.end_session(session).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn open_gallery(path: &Path, config: &EngineConfig) -> Result<EmbeddingStore> {
    if path.exists() {
        Ok(load_snapshot_file(path, config.template_history_bound)?)
    } else {
        Ok(EmbeddingStore::with_history_bound(
            config.embedding_dim,
            config.template_history_bound,
        ))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
}

/// Generate a gallery of random unit embeddings plus a session in which
/// each identity drifts across the frame with light embedding noise.
fn synth(
    identities: usize,
    frames: usize,
    dim: usize,
    seed: u64,
    out_snapshot: &Path,
    out_frames: &Path,
    config: &EngineConfig,
) -> Result<()> {
    if identities == 0 || frames == 0 || dim == 0 {
        bail!("identities, frames, and dim must all be positive");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let store = EmbeddingStore::with_history_bound(dim, config.template_history_bound);

    let mut templates = Vec::with_capacity(identities);
    for i in 0..identities {
        let template = random_unit(&mut rng, dim);
        store.enroll(&format!("synth-{i:03}"), muster_core::Embedding::new(template.clone()))?;
        templates.push(template);
    }
    save_snapshot_file(&store, out_snapshot)?;

    let mut session: Vec<Vec<Observation>> = Vec::with_capacity(frames);
    for frame in 0..frames {
        let mut observations = Vec::with_capacity(identities);
        for (i, template) in templates.iter().enumerate() {
            let x = i as f32 * 300.0 + rng.gen_range(-5.0..5.0);
            let y = 50.0 + rng.gen_range(-5.0..5.0);
            observations.push(Observation {
                tracking_hint: muster_core::BoundingBox::new(x, y, 120.0, 120.0),
                embedding: muster_core::Embedding::new(jitter(&mut rng, template)),
                quality: muster_core::QualitySubscores {
                    blur: rng.gen_range(0.85..1.0),
                    illumination: rng.gen_range(0.85..1.0),
                    resolution: rng.gen_range(0.85..1.0),
                    angle: rng.gen_range(0.85..1.0),
                },
                liveness: muster_core::LivenessSubscores {
                    blink: rng.gen_range(0.9..1.0),
                    motion: rng.gen_range(0.9..1.0),
                    texture: rng.gen_range(0.9..1.0),
                    depth: rng.gen_range(0.9..1.0),
                },
                anti_spoof: Some(rng.gen_range(0.9..1.0)),
                captured_at_ms: frame as u64 * 33,
            });
        }
        session.push(observations);
    }
    std::fs::write(out_frames, serde_json::to_string_pretty(&session)?)?;
    Ok(())
}

fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    } else {
        v[0] = 1.0;
    }
    v
}

/// Add small per-component noise, keeping the vector close to its
/// template (cosine similarity well above the default threshold).
fn jitter(rng: &mut StdRng, template: &[f32]) -> Vec<f32> {
    let mut v: Vec<f32> = template
        .iter()
        .map(|x| x + rng.gen_range(-0.02f32..0.02))
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
