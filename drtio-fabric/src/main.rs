/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use drtio_fabric::admin::ErrorCounters;
use drtio_fabric::channel::{ChannelId, ChannelKind};
use drtio_fabric::config::{TopologyConfig, TopologyConfigManager};
use drtio_fabric::cri::{SourceId, TimedCommand};
use drtio_fabric::error::CriError;
use drtio_fabric::fabric::Fabric;
use drtio_fabric::node::NodeId;
use drtio_fabric::runtime::{FabricRuntime, RuntimeHandle};

// ── CLI argument definition ───────────────────────────────────────────────────

/// Simulated DRTIO fabric.
///
/// Example:
///   drtio-fabric --topology topology.yaml --ticks 5000 --tick-us 100 --pulses 8
#[derive(Debug, Parser)]
#[command(
    name = "drtio-fabric",
    about = "DRTIO fabric simulator – TSC distribution, timed commands, aux control",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML topology file.  Without it a built-in two-node
    /// fabric is used.
    #[arg(short = 't', long = "topology")]
    topology: Option<PathBuf>,

    /// How many ticks to run before reporting.
    #[arg(short = 'n', long = "ticks", default_value_t = 2000)]
    ticks: u64,

    /// Wall-clock length of one tick, in microseconds.
    #[arg(short = 'u', long = "tick-us", default_value_t = 100)]
    tick_us: u64,

    /// Pulses of the demo train sent to the first remote output channel.
    #[arg(short = 'p', long = "pulses", default_value_t = 4)]
    pulses: u64,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("DRTIO fabric starting up...");

    let cli = Cli::parse();
    info!(
        topology = ?cli.topology,
        ticks    = cli.ticks,
        tick_us  = cli.tick_us,
        pulses   = cli.pulses,
        "Configuration"
    );

    // ── Load topology ─────────────────────────────────────────────────────────
    let mut manager = TopologyConfigManager::new();
    match &cli.topology {
        Some(path) => {
            info!("Loading topology from: {}", path.display());
            if let Err(e) = manager.load_from_file(path) {
                error!("Failed to load topology: {:#}", e);
                process::exit(1);
            }
        }
        None => warn!("No topology file provided, using the built-in two-node fabric"),
    }
    let config = manager.config_or_default();

    if let Err(e) = run(&cli, &config).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli, config: &TopologyConfig) -> Result<()> {
    let (fabric, events) = Fabric::new(config).context("cannot build the fabric")?;
    let tick = Duration::from_micros(cli.tick_us);
    let (runtime, mut events) = FabricRuntime::start(fabric, events, tick);
    let handle = runtime.handle();

    // Events are already logged where they are raised.
    let drain = tokio::spawn(async move {
        let mut count = 0u64;
        while events.recv().await.is_some() {
            count += 1;
        }
        count
    });

    let budget = tick.saturating_mul(u32::try_from(cli.ticks).unwrap_or(u32::MAX));
    handle.wait_synchronized(budget.max(Duration::from_secs(1))).await?;
    info!(now = handle.now(), "✓ all links synchronized");

    if let Some((node, channel)) = remote_output(config) {
        pulse_train(&handle, channel, cli.pulses)?;
        info!(%node, %channel, pulses = cli.pulses, "pulse train queued");
    } else {
        warn!("no remote output channel, skipping pulse train");
    }

    for sat in &config.satellites {
        match handle.ping(sat.id, Duration::from_secs(1)).await {
            Ok(rtt) => info!(node = %sat.id, name = %sat.name, rtt, "echo"),
            Err(e) => warn!(node = %sat.id, "✗ {:#}", e),
        }
    }

    let end = handle.now() + cli.ticks;
    while handle.now() < end {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // ── Report ────────────────────────────────────────────────────────────────
    for (link, report) in handle.link_status().await? {
        info!(%link, state = %report.state, latency = ?report.latency, "link");
    }
    log_counters(&handle.error_counters().await?);

    let fabric = runtime.shutdown().await?;
    for sat in &config.satellites {
        let executed = fabric
            .latches(sat.id)
            .map(|bank| bank.history().len())
            .unwrap_or(0);
        info!(node = %sat.id, executed, "commands executed");
    }
    let stats = fabric.interconnect().stats();
    info!(
        local = stats.local,
        forwarded = stats.forwarded,
        rejected = stats.rejected,
        "interconnect"
    );
    drop(fabric);
    let events = drain.await.context("event drain failed")?;
    info!(events, now = handle.now(), "done");
    Ok(())
}

/// First output channel owned by a satellite.
fn remote_output(config: &TopologyConfig) -> Option<(NodeId, ChannelId)> {
    config.satellites.iter().find_map(|sat| {
        sat.channels
            .iter()
            .find(|c| c.kind == ChannelKind::Output)
            .map(|c| (sat.id, c.id))
    })
}

/// Queue `pulses` high/low pairs, 8 ticks apart, starting 100 ticks out.
fn pulse_train(
    handle: &RuntimeHandle,
    channel: ChannelId,
    pulses: u64,
) -> Result<()> {
    let cpu = handle.source(SourceId::CPU);
    let start = handle.now() + 100;
    for i in 0..pulses {
        let at = start + i * 8;
        for (offset, level) in [(0, 1), (4, 0)] {
            match cpu.submit(TimedCommand::write(channel, at + offset, level)) {
                Ok(_) => {}
                Err(e @ CriError::BufferFull { .. }) => {
                    warn!(pulse = i, "{e}, stopping the train");
                    return Ok(());
                }
                Err(e) => return Err(e).context("pulse rejected"),
            }
        }
    }
    Ok(())
}

fn log_counters(counters: &ErrorCounters) {
    for ((node, kind), count) in &counters.remote {
        warn!(%node, %kind, count, "remote errors");
    }
    for (link, c) in &counters.links {
        info!(
            %link,
            calibrations = c.calibration_attempts,
            downs = c.link_downs,
            forwarded = c.commands_forwarded,
            failed = c.commands_failed,
            "link counters"
        );
    }
    for link in &counters.alarms {
        error!(%link, "calibration alarm raised");
    }
}
