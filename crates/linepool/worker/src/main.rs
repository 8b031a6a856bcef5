//! linepool worker - executes lines of a flow for a `LinePool`.
//!
//! Started by the pool either per slot (`--broker ... --slot ...`) or once as
//! the fork server (`--fork-server`).

mod flows;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use linepool::worker::{self, ExecutorBuilder, WorkerArgs};

#[derive(Parser)]
#[command(name = "linepool-worker")]
#[command(about = "Worker process for the linepool line execution pool")]
#[command(version)]
struct Cli {
    /// Address of the pool's broker
    #[arg(long, required_unless_present = "fork_server")]
    broker: Option<String>,

    /// Token authenticating this worker to the broker
    #[arg(long, required_unless_present = "fork_server")]
    token: Option<String>,

    /// Slot index this worker serves
    #[arg(long, required_unless_present = "fork_server")]
    slot: Option<usize>,

    /// Generation of the slot this worker was started for
    #[arg(long, default_value_t = 0)]
    generation: u64,

    /// Run as the fork server, reading control frames from stdin
    #[arg(long, conflicts_with_all = ["broker", "token", "slot"])]
    fork_server: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let builder: ExecutorBuilder = Arc::new(flows::build);

    if cli.fork_server {
        worker::run_fork_server(&builder).context("fork server failed")?;
        return Ok(());
    }

    let args = WorkerArgs {
        broker: cli.broker.context("--broker is required")?,
        token: cli.token.context("--token is required")?,
        slot: cli.slot.context("--slot is required")?,
        generation: cli.generation,
    };
    worker::serve(&args, &builder)
        .with_context(|| format!("worker for slot {} failed", args.slot))?;
    Ok(())
}
