//! # data-concierge CLI (`dcx`)
//!
//! ## Usage
//!
//! ```bash
//! dcx --config ./config/dcx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dcx serve` | Start the HTTP server |
//! | `dcx ask "<question>"` | Answer one question in the terminal |
//! | `dcx parse <file>` | Print the text extracted from a document |
//! | `dcx status` | Check the language model, warehouse and storage |
//! | `dcx completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! # Start the server on [server].bind
//! dcx serve --config ./config/dcx.toml
//!
//! # One-off question, streamed to stdout
//! dcx ask "What is our current ARR?"
//!
//! # Inspect what the parser makes of a spreadsheet
//! dcx parse ./board/Q3_pipeline.xlsx
//! ```
//!
//! Logs go to stderr. `RUST_LOG` controls verbosity
//! (default `data_concierge=info,tower_http=info`) and `LOG_FORMAT=json`
//! switches to JSON lines.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use data_concierge::app::{App, Backends};
use data_concierge::config::{self, Config};
use data_concierge::extract;
use data_concierge::models::{ConversationTurn, QueryEvent};
use data_concierge::pipeline::QueryRequest;
use data_concierge::server;

/// data-concierge: ask questions of your warehouse and uploaded documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dcx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dcx",
    about = "data-concierge: routed, grounded, streamed answers over a warehouse and uploaded documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dcx.toml`. A missing file means built-in
    /// defaults; secrets always come from the environment.
    #[arg(long, global = true, default_value = "./config/dcx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Runs the startup phase (warehouse probe, upload restoration) and then
    /// serves `/query`, `/upload`, `/uploads`, `/health` and `/reload`.
    Serve,

    /// Answer a single question and stream it to stdout.
    Ask {
        question: String,

        /// JSON file holding prior turns: `[{"role": "user", "content": "..."}]`.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Print every stream event as a JSON line instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// Parse a document and print the extracted text.
    Parse {
        file: PathBuf,
    },

    /// Report dependency availability.
    Status,

    /// Print a shell completion script.
    Completions {
        shell: Shell,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("data_concierge=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn start_app(cfg: Config) -> anyhow::Result<App> {
    let backends = Backends::from_config(&cfg)?;
    Ok(App::start(cfg, backends).await)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Commands that need neither config nor logging
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "dcx", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Parse { file } => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            println!("{}", extract::parse_document(name, &bytes));
            return Ok(());
        }
        _ => {}
    }

    init_logging();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let app = Arc::new(start_app(cfg).await?);
            server::run_server(app).await?;
        }
        Commands::Ask {
            question,
            history,
            json,
        } => {
            let history: Vec<ConversationTurn> = match history {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    serde_json::from_str(&raw).with_context(|| "Invalid history file")?
                }
                None => Vec::new(),
            };
            let app = start_app(cfg).await?;
            run_ask(&app, QueryRequest { question, history }, json).await?;
        }
        Commands::Status => {
            let app = start_app(cfg).await?;
            print!("{}", app.status().await.render_table());
        }
        Commands::Parse { .. } | Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

async fn run_ask(app: &App, request: QueryRequest, json: bool) -> anyhow::Result<()> {
    let mut events = app.pipeline.submit(request);
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            QueryEvent::Routing {
                sources, reasoning, ..
            } => {
                let names: Vec<&str> = sources.iter().map(|s| s.wire_name()).collect();
                eprintln!("→ sources: [{}] ({})", names.join(", "), reasoning);
            }
            QueryEvent::Sql { sql, status } => {
                eprintln!("→ sql ({:?}): {}", status, sql.as_deref().unwrap_or("-"));
            }
            QueryEvent::Token { token } => {
                write!(stdout, "{}", token)?;
                stdout.flush()?;
            }
            QueryEvent::Done { metadata, .. } => {
                println!();
                if !metadata.sources_used.is_empty() || metadata.confidence.is_some() {
                    eprintln!("→ metadata: {}", serde_json::to_string(&metadata)?);
                }
            }
        }
    }

    Ok(())
}
