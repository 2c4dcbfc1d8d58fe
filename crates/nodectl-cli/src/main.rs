//! # nodectl CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Kernel log of the local node
//! nodectl dmesg
//!
//! # Follow new messages on two nodes
//! nodectl dmesg -F --tail \
//!   -n cp-1=unix:///run/nodes/cp-1.sock \
//!   -n worker-1=unix:///run/nodes/worker-1.sock
//! ```
//!
//! Logs go to stderr at `warn` by default so stdout carries only kernel log
//! lines; `RUST_LOG` overrides the level.

use std::time::Duration;

use anyhow::{bail, Result};
use argh::FromArgs;
use nodectl_client::ConnectionRegistry;
use nodectl_common::protocol::DmesgOptions;
use nodectl_dispatch::{DispatchConfig, Dispatcher};
use tokio_util::sync::CancellationToken;

/// nodectl - administer cluster nodes through their agents
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Dmesg(DmesgArgs),
}

/// Arguments for printing the kernel log.
///
/// # Example
///
/// ```bash
/// nodectl dmesg --follow -n cp-1=/run/nodes/cp-1.sock
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "dmesg")]
/// print the kernel log of one or more nodes
struct DmesgArgs {
    /// keep printing new messages until interrupted
    #[argh(switch, short = 'F')]
    follow: bool,

    /// with --follow, only print messages logged from now on
    #[argh(switch)]
    tail: bool,

    /// target node as name=endpoint, may be repeated
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,

    /// agent endpoint used when no --node is given (default: $NODECTL_ENDPOINT or /run/nodectl/agent.sock)
    #[argh(option, short = 'e')]
    endpoint: Option<String>,

    /// stop after this many milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // stdout is reserved for command output
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Dmesg(args) => run_dmesg(args).await,
    }
}

async fn run_dmesg(args: DmesgArgs) -> Result<()> {
    let env_endpoint = std::env::var(nodectl_cli::ENDPOINT_ENV).ok();
    let targets =
        nodectl_cli::resolve_targets(&args.nodes, args.endpoint.as_deref(), env_endpoint.as_deref())?;

    if args.tail && !args.follow {
        tracing::warn!("--tail has no effect without --follow");
    }
    let options = DmesgOptions::default().follow(args.follow).tail(args.tail);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    if let Some(ms) = args.timeout_ms {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            tracing::debug!(timeout_ms = ms, "timeout reached, stopping");
            cancel.cancel();
        });
    }

    let dispatcher = Dispatcher::new(DispatchConfig::default());
    let report = {
        let mut stdout = std::io::stdout().lock();
        nodectl_cli::run_dmesg(&dispatcher, targets, options, cancel, &mut stdout).await?
    };

    let failed = nodectl_cli::report_failures(&report, &mut std::io::stderr())?;
    nodectl_cli::log_leaked_handles(&ConnectionRegistry::global());

    if failed > 0 {
        bail!("{} of {} nodes failed", failed, report.len());
    }
    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupted, stopping");
            cancel.cancel();
        }
    });
}
