//! # LocalLens CLI (`locallens`)
//!
//! Thin command-line host for the [`locallens::LocalLens`] engine: create the
//! index, import folders, search, watch for changes and inspect the index.
//!
//! ## Usage
//!
//! ```bash
//! locallens --config ./config/locallens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `locallens init` | Create the SQLite index and run schema migrations |
//! | `locallens import <folder>` | Import every supported file under a folder |
//! | `locallens sync <path>` | Re-index or remove a single file |
//! | `locallens watch <folder>` | Keep a folder in sync until interrupted |
//! | `locallens search "<query>"` | Semantic search, or keyword search without a model |
//! | `locallens stats` | Counts, coverage and database size |
//! | `locallens status` | Embedding model status |
//! | `locallens embed pending` | Embed passages stored without vectors |
//!
//! Logs go to stderr and are controlled with `RUST_LOG`
//! (default `locallens=info`).

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use locallens::config::Config;
use locallens::ingest::{CancelToken, ImportOutcome, SyncOutcome};
use locallens::progress::ProgressMode;
use locallens::search::{MatchKind, SearchHit, SearchResponse};
use locallens::LocalLens;

/// LocalLens — local-only semantic search for your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "locallens",
    about = "LocalLens — local-only semantic search for your documents",
    version,
    long_about = "LocalLens splits your documents into passages, embeds them with a model \
    that runs on this machine and answers natural-language queries from a single SQLite \
    index. Without a model it falls back to keyword search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/locallens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database. Safe to run repeatedly.
    Init,

    /// Import every supported file under a folder.
    ///
    /// Files whose modification time is unchanged since the last import are
    /// skipped, and indexed files that no longer exist are removed.
    Import {
        folder: PathBuf,

        /// Re-read every file even if it looks unchanged.
        #[arg(long)]
        full: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Re-index one file, or remove it from the index if it is gone.
    Sync { path: PathBuf },

    /// Watch a folder and re-index files as they change. Stops on Ctrl-C.
    Watch { folder: PathBuf },

    /// Search the index.
    Search {
        query: String,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,

        /// Show at most this many hits.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Load the embedding model and report its status.
    Status,

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed passages that were stored without a vector.
    Pending {
        /// Maximum number of passages to embed in this run.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("locallens=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = Config::load_or_default(&cli.config)?;
    let lens = LocalLens::open(cfg).await?;

    let result = run(&lens, cli.command).await;
    lens.close().await;
    result
}

async fn run(lens: &LocalLens, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Index initialized at {}",
                lens.config().db.path.display()
            );
        }
        Commands::Import {
            folder,
            full,
            progress,
        } => {
            lens.ensure_model_loaded().await;
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let sink = mode.sink();

            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let outcome = lens
                .import_folder_with(&folder, sink.as_ref(), &cancel, full)
                .await?;
            let summary = outcome.summary();

            match &outcome {
                ImportOutcome::Completed(_) => println!("import {}", folder.display()),
                ImportOutcome::Cancelled {
                    files_processed, ..
                } => println!(
                    "import {} (cancelled after {} files)",
                    folder.display(),
                    files_processed
                ),
            }
            println!("  files imported: {}", summary.files_imported);
            println!("  chunks created: {}", summary.chunks_created);
            println!("  embeddings generated: {}", summary.embeddings_generated);
            println!("  skipped: {}", summary.skipped);
            println!("  removed: {}", summary.removed);
            if !outcome.is_cancelled() {
                println!("ok");
            }
        }
        Commands::Sync { path } => {
            lens.ensure_model_loaded().await;
            match lens.sync_path(&path).await? {
                SyncOutcome::Indexed {
                    passages,
                    embeddings,
                } => println!(
                    "indexed {} ({} passages, {} embeddings)",
                    path.display(),
                    passages,
                    embeddings
                ),
                SyncOutcome::Unchanged => println!("unchanged {}", path.display()),
                SyncOutcome::Removed => println!("removed {}", path.display()),
                SyncOutcome::Skipped(e) => println!("skipped {}: {}", path.display(), e),
            }
        }
        Commands::Watch { folder } => {
            lens.ensure_model_loaded().await;
            let mut watcher = lens.watch(&folder)?;
            println!("watching {} (Ctrl-C to stop)", folder.display());
            tokio::select! {
                res = watcher.run() => res?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Commands::Search { query, json, limit } => {
            lens.ensure_model_loaded().await;
            let mut response = lens.search_text(&query).await?;
            if let Some(limit) = limit {
                response.hits.truncate(limit);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
        }
        Commands::Stats { json } => {
            let report = lens.stats_report().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }
        Commands::Status => {
            let state = lens.ensure_model_loaded().await;
            println!("model: {}", state);
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => {
                let state = lens.ensure_model_loaded().await;
                if !state.is_ready() {
                    anyhow::bail!("Embedding model is {}; nothing can be embedded.", state);
                }
                let summary = lens.backfill_embeddings(limit).await?;
                println!("embed pending");
                println!("  embedded: {}", summary.embedded);
                println!("  remaining: {}", summary.remaining);
            }
        },
    }
    Ok(())
}

fn print_response(response: &SearchResponse) {
    if let Some(empty) = response.empty_state {
        println!("{}", empty.message());
        return;
    }
    if response.hits.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in response.hits.iter().enumerate() {
        match hit.kind {
            MatchKind::Semantic { score } => {
                println!("{}. [{:.2}] {} #{}", i + 1, score, hit.file_name, hit.chunk_index)
            }
            MatchKind::Lexical { .. } => {
                println!("{}. [keyword] {} #{}", i + 1, hit.file_name, hit.chunk_index)
            }
        }
        println!("    path: {}", hit.file_path);
        println!("    excerpt: \"{}\"", excerpt(hit));
        println!();
    }
}

const EXCERPT_CHARS: usize = 160;

/// A single-line excerpt, centred on the match for keyword hits.
fn excerpt(hit: &SearchHit) -> String {
    let chars: Vec<char> = hit.content.chars().collect();
    let start = match hit.kind {
        MatchKind::Lexical { offset, .. } => offset.saturating_sub(EXCERPT_CHARS / 4),
        MatchKind::Semantic { .. } => 0,
    };
    let start = start.min(chars.len());
    let end = (start + EXCERPT_CHARS).min(chars.len());

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    out.extend(chars[start..end].iter());
    if end < chars.len() {
        out.push('…');
    }
    out.replace('\n', " ").trim().to_string()
}
