//! `cmdproxy` binary: config loading, logging, and a local demonstration
//! mode for the transit pipelines.
//!
//! There is no broker or blob-store backend in scope (spec §1 Non-goals),
//! so this binary wires the core crates together against local stand-ins —
//! [`cmdproxy_dispatch::InMemoryBroker`] and
//! [`cmdproxy_blobstore::FsBlobStore`] rooted at `blobstore.endpoint` — good
//! enough to exercise the whole pipeline end to end from a shell, but not a
//! deployable two-process client/worker split. A real deployment supplies
//! its own broker/backend adapters implementing the same traits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmdproxy_blobstore::FsBlobStore;
use cmdproxy_client::{ArgTree, Scalar};
use cmdproxy_dispatch::{Broker, InMemoryBroker};
use cmdproxy_param::Parameter;
use cmdproxy_worker::CommandPalette;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmdproxy", version, about = "Argument-transit protocol client/worker demo")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "cmdproxy.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one command through the client pipeline against a local worker.
    Run {
        /// Logical command name, resolved via the configured palette.
        #[arg(long, conflicts_with = "command_path")]
        command_name: Option<String>,
        /// Absolute executable path; requires `--queue`.
        #[arg(long, conflicts_with = "command_name")]
        command_path: Option<String>,
        /// Target queue. Required with `--command-path`.
        #[arg(long)]
        queue: Option<String>,
        /// Positional string arguments.
        args: Vec<String>,
    },
    /// Read newline-delimited `RunRequest` JSON from stdin, write
    /// newline-delimited `RunResponse` JSON to stdout.
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cmdproxy_config::load_config(&cli.config)
        .await
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let store = Arc::new(
        FsBlobStore::new(config.blobstore.endpoint.clone())
            .await
            .context("initialising blob store")?,
    );
    let palette = Arc::new(CommandPalette::new(config.command_palette.clone()));

    match cli.command {
        Command::Worker => run_worker(store, palette).await,
        Command::Run { command_name, command_path, queue, args } => {
            run_once(store, palette, config.dispatch_timeout(), command_name, command_path, queue, args).await
        }
    }
}

async fn run_worker(
    store: Arc<FsBlobStore>,
    palette: Arc<CommandPalette>,
) -> Result<()> {
    tracing::info!("worker reading run requests from stdin");
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdin));
    let mut stdout = std::io::stdout();

    while let Some(line) = tokio::io::AsyncBufReadExt::next_line(&mut lines).await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = cmdproxy_worker::handle(&line, store.as_ref(), palette.as_ref()).await;
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    store: Arc<FsBlobStore>,
    palette: Arc<CommandPalette>,
    dispatch_timeout: Duration,
    command_name: Option<String>,
    command_path: Option<String>,
    queue: Option<String>,
    args: Vec<String>,
) -> Result<()> {
    let command = match (command_name, command_path) {
        (Some(name), None) => Parameter::CmdName { name },
        (None, Some(path)) => Parameter::CmdPath { path },
        _ => anyhow::bail!("exactly one of --command-name or --command-path is required"),
    };

    let broker = InMemoryBroker::new();
    let worker_store = Arc::clone(&store);
    let worker_palette = Arc::clone(&palette);
    let target = cmdproxy_client::target_queue(&command, queue.as_deref())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    broker.register(
        &target,
        "run",
        Arc::new(move |payload| {
            let store = Arc::clone(&worker_store);
            let palette = Arc::clone(&worker_palette);
            Box::pin(async move { cmdproxy_worker::handle(&payload, store.as_ref(), palette.as_ref()).await })
        }),
    );
    // registration is spawned onto the runtime; give it a tick to land.
    tokio::task::yield_now().await;

    let arg_tree = args
        .into_iter()
        .map(|a| ArgTree::Scalar(Scalar::Str(a)))
        .collect();

    let outcome = cmdproxy_client::run(
        &broker,
        store.as_ref(),
        command,
        arg_tree,
        None,
        None,
        None,
        None,
        queue.as_deref(),
        Some(dispatch_timeout),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    std::process::exit(outcome.return_code);
}
