//! Spanstore data node simulator
//!
//! Starts an in-process cluster of data nodes sharing one metadata index,
//! load balancer and transfer registry, then alternates a random write
//! workload with overflow cycles on every node whose live journal is full.

mod workload;

use anyhow::Result;
use clap::Parser;
use futures::future::join_all;
use spanstore_common::Config;
use spanstore_overflow::{DataNode, LocalCluster, OverflowReport};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workload::{EVENTS, USERS, Workload};

#[derive(Parser, Debug)]
#[command(name = "spanstore-datanode")]
#[command(about = "Spanstore data node simulator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "SPANSTORE_CONFIG", default_value = "datanode.toml")]
    config: String,

    /// Number of data nodes
    #[arg(long, env = "SPANSTORE_NODES")]
    nodes: Option<usize>,

    /// Number of overflow cycles to run
    #[arg(long, env = "SPANSTORE_CYCLES")]
    cycles: Option<u64>,

    /// Data directory (a temporary directory when unset)
    #[arg(long, env = "SPANSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "SPANSTORE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text or json)
    #[arg(long, env = "SPANSTORE_LOG_FORMAT", default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence over the config file
    if let Some(nodes) = args.nodes {
        config.simulation.nodes = nodes;
    }
    if let Some(cycles) = args.cycles {
        config.simulation.cycles = cycles;
    }

    let json = args.log_format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    config.overflow.validate()?;
    config.simulation.validate()?;
    let sim = config.simulation.clone();

    info!("Starting spanstore simulator {}", config.node.name);
    info!("Config file: {}", args.config);
    info!(
        "Nodes: {}, cycles: {}, writes per cycle: {}",
        sim.nodes, sim.cycles, sim.writes_per_cycle
    );

    let scratch = tempfile::tempdir()?;
    let data_dir = args.data_dir.unwrap_or_else(|| scratch.path().to_path_buf());
    info!("Data directory: {}", data_dir.display());

    let cluster = LocalCluster::new(
        sim.nodes,
        config.overflow.clone(),
        &data_dir,
        sim.max_journal_bytes,
    )?;
    let mut workload = Workload::new(sim.clone());
    workload.seed(&cluster).await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(sim.interval_ms));
    for cycle in 1..=sim.cycles {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }

        let stats = workload.run(&cluster, sim.writes_per_cycle).await;
        info!("Cycle {cycle}: workload {}", serde_json::to_string(&stats)?);

        let full: Vec<&Arc<DataNode>> = cluster
            .nodes()
            .iter()
            .filter(|node| node.should_overflow())
            .collect();
        let reports = join_all(full.iter().map(|node| node.overflow())).await;
        for (node, report) in full.into_iter().zip(reports) {
            match report {
                Ok(report) => log_report(node, &report),
                Err(e) if e.is_normal_shutdown() => warn!("Overflow on {} stopped: {e}", node.name()),
                Err(e) => error!("Overflow on {} failed: {e}", node.name()),
            }
            node.purge_unused();
        }
    }

    for node in cluster.nodes() {
        info!(
            "{} counters {}",
            node.name(),
            serde_json::to_string(&node.counters().snapshot())?
        );
    }
    for index in [USERS, EVENTS] {
        let locators = cluster.metadata_index.locators(index);
        let mut per_node: BTreeMap<String, usize> = BTreeMap::new();
        for locator in &locators {
            *per_node.entry(locator.node.to_string()).or_default() += 1;
        }
        info!("{index}: {} shards across {per_node:?}", locators.len());
    }

    cluster.shutdown();
    info!("Simulator stopped");
    Ok(())
}

fn log_report(node: &DataNode, report: &OverflowReport) {
    let mut actions: BTreeMap<String, usize> = BTreeMap::new();
    for action in report.actions.values().flatten() {
        *actions.entry(action.to_string()).or_default() += 1;
    }
    info!(
        "{} overflow at commit time {}: {} shards, actions {actions:?}, {} incomplete, {:?}",
        node.name(),
        report.last_commit_time,
        report.actions.len(),
        report.incomplete(),
        report.elapsed
    );
}
