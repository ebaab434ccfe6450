//! # Interview Analyzer - Command Line Entry Point
//!
//! Two modes behind one binary:
//! - `analyze <file>`: run one upload/analysis cycle against the backend,
//!   rendering live progress as it streams in, then print the analysis and
//!   transcription.
//! - `relay`: run the HTTP relay proxy in front of the backend.

use anyhow::Result;
use clap::{Parser, Subcommand};
use interview_analyzer::config::AppConfig;
use interview_analyzer::orchestrator::Orchestrator;
use interview_analyzer::relay;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "interview-analyzer", version, about = "Audio interview analysis client and relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an audio file for analysis and watch its progress.
    Analyze {
        /// Path to the audio file (mp3, wav, mp4, or m4a).
        file: PathBuf,

        /// Backend base URL, overriding configuration.
        #[arg(long)]
        backend_url: Option<String>,
    },

    /// Run the relay proxy in front of the analysis backend.
    Relay,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();

    let mut config = AppConfig::load()?;
    config.validate()?;

    match cli.command {
        Command::Analyze { file, backend_url } => {
            if let Some(url) = backend_url {
                config.backend.base_url = url;
            }
            run_analyze(&config, &file).await
        }
        Command::Relay => relay::run_relay(config).await,
    }
}

/// Run one analysis cycle, rendering progress lines as events arrive.
async fn run_analyze(config: &AppConfig, file: &PathBuf) -> Result<()> {
    info!(
        "interview-analyzer v{} against {}",
        env!("CARGO_PKG_VERSION"),
        config.backend.base_url
    );

    let orchestrator = Orchestrator::from_config(config);

    // Presentation is read-only over the latest-state slot: render whatever
    // the most recent event says, at whatever pace events arrive.
    let mut progress = orchestrator.subscribe();
    let renderer = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let view = progress.borrow().view();
            if view.message.is_empty() {
                println!("[{:>3}%] {}", view.percent, view.label);
            } else {
                println!("[{:>3}%] {} - {}", view.percent, view.label, view.message);
            }
        }
    });

    let result = orchestrator.run_analysis(file).await;
    renderer.abort();

    let result = result?;

    println!();
    println!("=== Analysis ===");
    println!("{}", result.analysis);
    println!();
    println!("=== Transcription ===");
    println!("{}", result.full_transcription);

    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// Reads `RUST_LOG` from the environment, defaulting to debug output for
/// this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_analyzer=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
