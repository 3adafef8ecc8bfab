use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reel_forge::alignment::Transcript;
use reel_forge::batch::BatchFile;
use reel_forge::clips::load_clip_pool;
use reel_forge::gateway::create_gateway;
use reel_forge::voiceover::{build_voiceover, transcript_path, voice_audio_path};
use reel_forge::{Assembler, Config, FfmpegRenderer, JobKind, Ledger, Renderer, TaskManager};

#[derive(Parser)]
#[command(name = "reel-forge", version, author = "TigreRoll")]
#[command(about = "Resumable media generation and voice-timed short video assembly")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to reel-forge.toml or config/reel-forge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit, poll and download every item of a batch file
    Run {
        /// JSON batch file
        #[arg(long)]
        batch: PathBuf,
    },
    /// Show ledger statistics and every work item
    Status,
    /// Move a failed item back to queued
    Reset {
        /// Work item id, e.g. "image:hero/view_0"
        id: String,
    },
    /// Decode a completed speech item into voice audio and a line transcript
    Voiceover {
        /// Speech work item id
        id: String,
    },
    /// Build the final video for a completed speech item
    Assemble {
        /// Speech work item id
        id: String,

        /// Directory of source clips (*.mp4, optional clips.toml)
        #[arg(long)]
        clips: PathBuf,

        /// Output video path
        #[arg(long)]
        out: PathBuf,

        /// Background music mixed under the voice
        #[arg(long)]
        music: Option<PathBuf>,

        /// Rebuild even if the output exists
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool, level: &str) {
    let default_filter = if verbose {
        "reel_forge=debug,warn".to_string()
    } else {
        format!("reel_forge={},warn", level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.output.log_level);
    config.validate()?;
    info!("🚀 reel-forge starting");
    tracing::debug!("{}", config.summary());

    let ledger = Ledger::open(&config.output.ledger_file).await?;
    let voice_dir = config.output.base_dir.join("voice");

    match cli.command {
        Commands::Run { batch } => {
            let items = BatchFile::load(&batch).await?.into_work_items()?;
            let kinds: BTreeSet<JobKind> = items.iter().map(|i| i.kind).collect();

            let mut manager = TaskManager::new(ledger, &config);
            for kind in kinds {
                manager = manager.with_gateway(kind, create_gateway(kind, &config)?);
            }

            let stored = manager.enqueue(items).await?;
            let ids: Vec<String> = stored.into_iter().map(|i| i.id).collect();
            info!("📋 {} work items in batch {}", ids.len(), batch.display());

            tokio::select! {
                summary = manager.run_batch(&ids) => summary?.log(),
                _ = tokio::signal::ctrl_c() => {
                    warn!("⏹️ Interrupted; the ledger keeps the last persisted state, rerun to resume");
                    std::process::exit(130);
                }
            }
        }

        Commands::Status => {
            let stats = ledger.statistics().await;
            info!(
                "📊 {} items: {} queued, {} in flight, {} completed, {} failed",
                stats.total, stats.queued, stats.in_flight, stats.completed, stats.failed
            );
            for (id, item) in ledger.all().await {
                match &item.error {
                    Some(error) => info!("  {} [{}] {}", id, item.state.status_string(), error),
                    None => info!("  {} [{}]", id, item.state.status_string()),
                }
            }
        }

        Commands::Reset { id } => {
            ledger.reset(&id).await?;
        }

        Commands::Voiceover { id } => {
            let item = ledger.get(&id).await.ok_or_else(|| anyhow!("unknown work item: {}", id))?;
            build_voiceover(&item, &voice_dir, &config.speech.pause_markers).await?;
        }

        Commands::Assemble {
            id,
            clips,
            out,
            music,
            force,
        } => {
            let item = ledger.get(&id).await.ok_or_else(|| anyhow!("unknown work item: {}", id))?;

            let transcript_file = transcript_path(&voice_dir, &item);
            let audio = voice_audio_path(&voice_dir, &item);
            let transcript = if transcript_file.exists() && audio.exists() {
                Transcript::load(&transcript_file).await?
            } else {
                build_voiceover(&item, &voice_dir, &config.speech.pause_markers)
                    .await?
                    .transcript
            };

            let renderer: Arc<dyn Renderer> = Arc::new(FfmpegRenderer::new(&config.render)?);
            let pool = load_clip_pool(&clips, renderer.as_ref()).await?;
            Assembler::new(renderer, &config)?
                .assemble(&transcript, &audio, &pool, music.as_deref(), &out, force)
                .await?;
        }
    }

    Ok(())
}
