//! # docqa CLI
//!
//! The `docqa` binary runs the HTTP server and exposes the same operations
//! for local use.
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa serve` | Start the HTTP server |
//! | `docqa ingest <file> --category <c>` | Extract, chunk, embed and index a `.pdf`/`.txt` file |
//! | `docqa ask "<question>" --category <c>` | Answer a question from a category |
//! | `docqa delete <source> --category <c>` | Remove a document and its chunks |
//! | `docqa sources --category <c>` | List indexed sources |
//! | `docqa docs --category <c>` | List retained documents |
//! | `docqa completions <shell>` | Print a shell completion script |
//!
//! Logging goes to stderr and honours `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use docqa::answer::AnswerRequest;
use docqa::app::App;
use docqa::config::{self, Config};
use docqa::index_manager::run_blocking;
use docqa::progress::ProgressMode;
use docqa::server;

const DEFAULT_CONFIG: &str = "./config/docqa.toml";

/// docqa: category-partitioned document question answering.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "docqa: ingest documents into per-category vector indexes and answer questions from them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docqa.toml` when that file exists; built-in
    /// defaults are used otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Ingest a `.pdf` or `.txt` file into a category.
    Ingest {
        file: PathBuf,

        #[arg(long)]
        category: String,

        /// Region tag stored on every chunk (default `regional-unknown`).
        #[arg(long)]
        region: Option<String>,

        #[arg(long, default_value = "cli")]
        uploaded_by: String,

        /// Progress output on stderr: off, human or json.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Answer a question from a category.
    Ask {
        question: String,

        #[arg(long)]
        category: String,

        #[arg(long, default_value = "default")]
        user: String,

        #[arg(long, default_value = "default")]
        thread: String,

        /// Number of chunks to retrieve (default `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Keep only chunks whose region contains this text.
        #[arg(long)]
        region: Option<String>,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a document and its chunks from a category.
    Delete {
        source: String,

        #[arg(long)]
        category: String,
    },

    /// List the sources indexed in a category.
    Sources {
        #[arg(long)]
        category: String,
    },

    /// List the documents retained for a category.
    Docs {
        #[arg(long)]
        category: String,
    },

    /// Print a shell completion script to stdout.
    Completions { shell: Shell },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn resolve_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                config::load_config(&default)
            } else {
                warn!(path = DEFAULT_CONFIG, "config file not found, using defaults");
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "docqa", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = resolve_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            file,
            category,
            region,
            uploaded_by,
            progress,
        } => {
            let app = App::from_config(&cfg)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = app
                .ingestor
                .ingest_file(&file, &category, region, &uploaded_by, Arc::from(reporter))
                .await?;
            println!(
                "Ingested {} into '{}': {} chunks ({} total in index, dim {})",
                report.source, report.category, report.chunks, report.index.total, report.index.dim
            );
        }
        Commands::Ask {
            question,
            category,
            user,
            thread,
            top_k,
            region,
            json,
        } => {
            let app = App::from_config(&cfg)?;
            let req = AnswerRequest {
                question,
                category,
                user_id: user,
                thread_id: thread,
                top_k: top_k.unwrap_or(cfg.retrieval.top_k).max(1),
                region_filter: region,
            };
            let outcome = app.answers.answer(&req).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                if let Some(rephrased) = &outcome.rephrased_question {
                    println!("(interpreted as: {})\n", rephrased);
                }
                println!("{}", outcome.answer);
                if !outcome.results.is_empty() {
                    println!("\nSources:");
                    for hit in &outcome.results {
                        println!(
                            "  {} #{} (distance {:.4})",
                            hit.chunk.source, hit.chunk.chunk_index, hit.distance
                        );
                    }
                }
                if let Some(err) = &outcome.error {
                    eprintln!("\nretrieval: {}", err);
                }
            }
        }
        Commands::Delete { source, category } => {
            let app = App::from_config(&cfg)?;
            let report = app.ingestor.remove_document(&category, &source).await?;
            println!("{}", report.message);
        }
        Commands::Sources { category } => {
            let app = App::from_config(&cfg)?;
            let manager = app.index.clone();
            let sources = run_blocking(move || manager.list_sources(&category)).await?;
            if sources.is_empty() {
                println!("No sources indexed.");
            }
            for source in sources {
                println!("{}", source);
            }
        }
        Commands::Docs { category } => {
            let app = App::from_config(&cfg)?;
            let docs = app.ingestor.list_documents(&category)?;
            if docs.is_empty() {
                println!("No documents retained.");
            }
            for doc in docs {
                println!("{}", doc);
            }
        }
        // Printed before configuration is loaded.
        Commands::Completions { .. } => {}
    }

    Ok(())
}
