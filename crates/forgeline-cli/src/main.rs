//! forgeline - prompt-driven refactoring pipelines with human checkpoints
//!
//! - `forgeline serve`: HTTP/SSE server for sessions
//! - `forgeline run`: one pipeline in the terminal, checkpoints answered on stdin

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use forgeline_core::{paths, ForgelineConfig};

mod run;
mod serve;

/// forgeline - Refactoring Pipelines
#[derive(Parser)]
#[command(name = "forgeline", version)]
#[command(about = "Prompt-driven multi-step refactoring with human checkpoints", long_about = None)]
struct Cli {
    /// Config file (default: ~/.forgeline/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    ///
    /// Sessions are started with POST /api/start, streamed from
    /// GET /api/sessions/{id}/events and answered with
    /// POST /api/sessions/{id}/confirm.
    Serve {
        /// Port to listen on (overrides config and FORGELINE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one pipeline in the terminal
    ///
    /// Progress events are printed as they arrive. At each checkpoint one
    /// line is read from stdin and interpreted as the answer ("yes",
    /// "no, too risky", "use branch feature/x", ...).
    Run(run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = ForgelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            init_stdout_logging();
            serve::run(config, port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => {
            // stdout belongs to the progress printer
            init_file_logging();
            run::run(config, args).await
        }
    }
}

fn init_stdout_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

fn init_file_logging() {
    let log_dir = paths::logs_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory: {}", e);
    }

    let log_file = match std::fs::File::create(log_dir.join("forgeline.log")) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to create log file: {}, logging disabled", e);
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
}
