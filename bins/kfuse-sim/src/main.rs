mod daemon;
mod workload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use kfuse_core::{Bridge, BridgeConfig, BridgeHooks, Session, StatsSnapshot};
use serde::Serialize;

use crate::daemon::{DaemonOptions, DaemonSummary};
use crate::workload::{WorkloadOptions, WorkloadReport};

/// Drive a kfuse bridge against an in-memory daemon and report its counters.
#[derive(Parser, Debug)]
#[command(name = "kfuse-sim", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads issuing operations
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Total operations across all workers
    #[arg(long, default_value_t = 10_000)]
    ops: usize,

    /// Files created under the root before the run
    #[arg(long, default_value_t = 64)]
    files: usize,

    /// Probability that a relayed request gets interrupted
    #[arg(long, default_value_t = 0.05)]
    interrupt_rate: f64,

    /// Probability that the daemon stalls before answering
    #[arg(long, default_value_t = 0.1)]
    slow_rate: f64,

    /// RNG seed; random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[derive(Serialize)]
struct SimReport {
    seed: u64,
    workload: WorkloadReport,
    daemon: DaemonSummary,
    stats: StatsSnapshot,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&BridgeConfig::default())?);
        return Ok(());
    }

    for (name, rate) in [("interrupt-rate", args.interrupt_rate), ("slow-rate", args.slow_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            bail!("--{name} must be within [0, 1], got {rate}");
        }
    }

    let config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    let _log_guard = kfuse_logging::init_logging(&config.log)?;

    let seed = args.seed.unwrap_or_else(rand::random);
    tracing::info!(
        threads = args.threads,
        ops = args.ops,
        files = args.files,
        seed,
        "Starting kfuse simulation"
    );

    let session = Arc::new(Session::from_config(&config));
    let (bridge, end) = Bridge::connect_channel(session, BridgeHooks::default())?;
    let bridge = Arc::new(bridge);
    let daemon = daemon::spawn(
        end,
        DaemonOptions {
            owner: config.daemon,
            slow_rate: args.slow_rate,
            seed,
        },
    )?;

    let nodes = workload::prepare(&bridge, args.files).context("preparing namespace")?;
    let report = workload::run(
        &bridge,
        &nodes,
        &WorkloadOptions {
            threads: args.threads,
            ops: args.ops,
            interrupt_rate: args.interrupt_rate,
            seed,
        },
    );

    bridge.teardown();
    let summary = daemon.join().map_err(|_| anyhow!("daemon thread panicked"))?;
    let out = SimReport {
        seed,
        workload: report,
        daemon: summary,
        stats: bridge.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);

    if out.stats.tickets_live != 0 {
        bail!("{} request tickets were never released", out.stats.tickets_live);
    }
    tracing::info!("Simulation complete");
    Ok(())
}
