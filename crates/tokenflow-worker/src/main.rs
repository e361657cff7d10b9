//! Tokenflow CLI.
//!
//! Runs a playbook end to end with the in-process runtime, or validates
//! one without executing it.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenflow_core::{parse_playbook, EventName};
use tokenflow_worker::{AdapterRegistry, Runtime};

#[derive(Parser)]
#[command(name = "tokenflow")]
#[command(version, about = "Tokenflow playbook engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a playbook to completion with the built-in adapters
    Run {
        /// Path to the playbook YAML file
        #[arg(value_name = "PLAYBOOK")]
        playbook: PathBuf,

        /// Submission payload merged over the playbook workload, as JSON
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Print every recorded event instead of a summary
        #[arg(long)]
        events: bool,
    },
    /// Parse and validate a playbook without executing it
    Validate {
        /// Path to the playbook YAML file
        #[arg(value_name = "PLAYBOOK")]
        playbook: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tokenflow_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            playbook,
            payload,
            events,
        } => run(playbook, payload, events).await,
        Commands::Validate { playbook } => validate(playbook),
    }
}

async fn run(path: PathBuf, payload: String, print_events: bool) -> Result<()> {
    let yaml = fs::read_to_string(&path)
        .with_context(|| format!("failed to read playbook {}", path.display()))?;
    let playbook = parse_playbook(&yaml).context("invalid playbook")?;
    let payload: Value = serde_json::from_str(&payload).context("invalid payload JSON")?;

    let name = playbook.metadata.name.clone();
    tracing::info!(playbook = %name, "starting execution");

    let runtime = Runtime::new(AdapterRegistry::with_builtins());
    let execution_id = runtime.run_playbook(playbook, payload).await?;

    let events = runtime.scheduler().log().read(execution_id)?;
    if print_events {
        for event in &events {
            println!(
                "{:>4}  {:<32} {:<10} {}",
                event.seq, event.name, event.status, event.entity_id
            );
        }
    }

    let finished = events
        .iter()
        .find(|e| e.name == EventName::WorkflowFinished)
        .context("execution produced no workflow.finished event")?;
    println!(
        "execution {} finished: {} ({} events)",
        execution_id,
        finished.status,
        events.len()
    );
    Ok(())
}

fn validate(path: PathBuf) -> Result<()> {
    let yaml = fs::read_to_string(&path)
        .with_context(|| format!("failed to read playbook {}", path.display()))?;
    let playbook = parse_playbook(&yaml)?;
    println!(
        "ok: {} ({} steps)",
        playbook.metadata.name,
        playbook.workflow.len()
    );
    Ok(())
}
