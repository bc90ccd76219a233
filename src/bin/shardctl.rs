//! shardctl: drive the allocation engine from the command line

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardalloc::allocation::AllocationExplanation;
use shardalloc::routing::RecoveryRequest;
use shardalloc::{
    AllocationCoordinator, AllocationService, ClusterHealth, ClusterState, Config, CoordinatorHandle,
    DiscoveryNodes, IndexMetadata, RoutingTable, ShardId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Shard allocation engine tooling")]
#[command(version = shardalloc::VERSION)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate indices on an in-process cluster, completing every recovery
    /// until the routing converges
    Simulate {
        /// Live node ids (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Index as name:shards:replicas (repeatable)
        #[arg(long = "index", value_parser = parse_index, required = true)]
        indices: Vec<IndexMetadata>,

        /// Nodes to remove after the first convergence (repeatable)
        #[arg(long)]
        kill: Vec<String>,

        /// Explain a shard (index:shard) after the last convergence
        #[arg(long, value_parser = parse_shard_id)]
        explain: Option<ShardId>,

        /// Maximum reroute rounds per convergence
        #[arg(long, default_value = "100")]
        max_rounds: u32,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn parse_index(s: &str) -> Result<IndexMetadata, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [name, shards, replicas] = parts.as_slice() else {
        return Err(format!("expected name:shards:replicas, got '{}'", s));
    };
    let shards = shards
        .parse()
        .map_err(|e| format!("invalid shard count '{}': {}", shards, e))?;
    let replicas = replicas
        .parse()
        .map_err(|e| format!("invalid replica count '{}': {}", replicas, e))?;
    Ok(IndexMetadata::new(*name, shards, replicas))
}

fn parse_shard_id(s: &str) -> Result<ShardId, String> {
    let (index, id) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected index:shard, got '{}'", s))?;
    let id = id
        .parse()
        .map_err(|e| format!("invalid shard number '{}': {}", id, e))?;
    Ok(ShardId::new(index, id))
}

#[derive(Serialize)]
struct Report<'a> {
    version: u64,
    health: ClusterHealth,
    routing_table: &'a RoutingTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<AllocationExplanation>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            indices,
            kill,
            explain,
            max_rounds,
            json,
        } => {
            let mut state = ClusterState::new().with_nodes(DiscoveryNodes::from_ids(nodes));
            for meta in indices {
                state = state.with_index(meta, chrono::Utc::now())?;
            }

            let service = Arc::new(AllocationService::new(config.allocation.clone()));
            let (recovery_tx, mut recovery_rx) = mpsc::unbounded_channel();
            let (handle, task) = AllocationCoordinator::spawn(state, service, recovery_tx);

            let rounds = converge(&handle, &mut recovery_rx, max_rounds).await?;
            tracing::info!(rounds, "Cluster converged");

            if !kill.is_empty() {
                let current = handle.state();
                let survivors = kill
                    .iter()
                    .fold(current.nodes().clone(), |nodes, id| nodes.remove(id));
                tracing::info!(killed = ?kill, remaining = survivors.len(), "Removing nodes");
                handle.on_nodes_changed(survivors).await?;
                let rounds = converge(&handle, &mut recovery_rx, max_rounds).await?;
                tracing::info!(rounds, "Cluster converged after node loss");
            }

            let explanation = match explain {
                Some(shard_id) => Some(handle.explain(shard_id).await?),
                None => None,
            };

            let state = handle.state();
            let health = ClusterHealth::of(&state);
            if json {
                let report = Report {
                    version: state.version(),
                    health,
                    routing_table: state.routing_table(),
                    explanation,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_table(&state);
                println!("{}", health);
                if let Some(explanation) = explanation {
                    print_explanation(&explanation);
                }
            }

            handle.shutdown().await?;
            task.await??;
        }
    }

    Ok(())
}

/// Reroute, complete every requested recovery, repeat until a pass changes
/// nothing and requests no recovery.
async fn converge(
    handle: &CoordinatorHandle,
    recoveries: &mut mpsc::UnboundedReceiver<RecoveryRequest>,
    max_rounds: u32,
) -> anyhow::Result<u32> {
    for round in 1..=max_rounds {
        let (_, changed) = handle.reroute("simulate").await?;
        let mut started = 0;
        while let Ok(recovery) = recoveries.try_recv() {
            handle
                .on_shard_started(recovery.shard_id, recovery.target_node)
                .await?;
            started += 1;
        }
        if started == 0 && !changed {
            return Ok(round);
        }
    }
    bail!("cluster did not converge within {} rounds", max_rounds)
}

fn print_table(state: &ClusterState) {
    println!("cluster state version {}", state.version());
    for index in state.routing_table().indices() {
        println!("index [{}]", index.index());
        for shard in index.shards() {
            for copy in shard.copies() {
                println!("  {}", copy);
            }
        }
    }
}

fn print_explanation(explanation: &AllocationExplanation) {
    println!("explain {}: {}", explanation.shard_id, explanation.decision);
    println!("  copy: {}", explanation.copy);
    if let Some(remain) = &explanation.remain {
        println!("  can remain on [{}]: {}", remain.node_id, remain.decision);
    }
    for node in &explanation.nodes {
        println!("  [{}] {}", node.node_id, node.decision);
        for verdict in &node.verdicts {
            println!("    {}", verdict);
        }
    }
    for attempt in &explanation.history {
        println!(
            "  earlier attempt ({}): {}",
            if attempt.primary { "primary" } else { "replica" },
            attempt.outcome
        );
    }
}
