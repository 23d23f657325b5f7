//! kaimono-sim: several clients editing one shared list at once.
//!
//! Drives random intents (add, toggle, rename, remove, reorder, clear done,
//! reload, feed drops) from every client against the in-memory store, then
//! checks that every client's view converged to the store.
//!
//! ## Usage
//!
//! ```bash
//! kaimono-sim --clients 4 --ops 500 --seed 7 --latency-ms 25
//! KAIMONO_CONFIG=client.ron RUST_LOG=kaimono_client=debug kaimono-sim
//! ```

mod sim;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use kaimono_client::ClientConfig;
use kaimono_client::constants::CONFIG_ENV;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::sim::{SimOptions, Simulation};

/// Multi-client convergence simulator for kaimono.
#[derive(Parser, Debug)]
#[command(name = "kaimono-sim")]
#[command(about = "Simulate concurrent clients on one shared list and check convergence")]
struct Args {
    /// Number of clients sharing the list
    #[arg(short, long, default_value_t = 3)]
    clients: usize,

    /// Total intents issued across all clients
    #[arg(short, long, default_value_t = 200)]
    ops: usize,

    /// RNG seed; the same seed replays the same intents
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Upper bound on each client's simulated store latency
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Percent of intents whose store call is made to fail
    #[arg(long, default_value_t = 5)]
    fault_rate: u8,

    /// Drop every feed after this many intents (0 = never)
    #[arg(long, default_value_t = 0)]
    drop_every: usize,

    /// How long to wait for views to converge at the end
    #[arg(long, default_value_t = 5000)]
    settle_ms: u64,

    /// RON client config (overrides $KAIMONO_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(explicit: Option<PathBuf>) -> Result<ClientConfig> {
    let path = explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    match path {
        Some(path) => ClientConfig::load(&path)
            .with_context(|| format!("loading client config from {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be at least 1");
    anyhow::ensure!(args.fault_rate <= 100, "--fault-rate is a percentage");
    let config = load_config(args.config)?;

    let options = SimOptions {
        clients: args.clients,
        ops: args.ops,
        seed: args.seed,
        max_latency_ms: args.latency_ms,
        fault_rate: args.fault_rate,
        drop_every: args.drop_every,
        settle: std::time::Duration::from_millis(args.settle_ms),
    };
    tracing::info!(
        clients = options.clients,
        ops = options.ops,
        seed = options.seed,
        "Starting simulation"
    );

    let sim = Simulation::start(options, config).await?;
    let report = sim.run().await?;
    println!("{report}");
    Ok(())
}
