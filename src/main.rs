//! Mesh Sentinel - in-process cluster simulation
//!
//! Runs N nodes over a simulated network with synthetic telemetry. Every node
//! runs the full control loop: detection, decision, governance, consensus and
//! guarded execution.
//!
//! # Usage
//!
//! ```bash
//! # Five nodes, CPU fault on node-3 after 5 s
//! cargo run --release -- --nodes 5 --fault-node node-3
//!
//! # Fixed number of cycles, then exit
//! cargo run --release -- --cycles 30
//! ```
//!
//! # Environment Variables
//!
//! - `MESH_SENTINEL_CONFIG`: Path to the node config TOML
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mesh_sentinel::config::{self, NodeConfig, StorageBackend};
use mesh_sentinel::control::{NodeRuntime, Service, SyntheticTelemetry};
use mesh_sentinel::executor::SimulatedRemediation;
use mesh_sentinel::transport::LocalNetwork;
use mesh_sentinel::types::{IssueKind, NodeId};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "mesh-sentinel")]
#[command(about = "Autonomic self-healing control loop, simulated cluster")]
#[command(version)]
struct CliArgs {
    /// Node config TOML (otherwise $MESH_SENTINEL_CONFIG or ./mesh_sentinel.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Cluster size when the config lists no peers
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Stop after this many control cycles per node
    #[arg(long)]
    cycles: Option<u64>,

    /// Node whose telemetry turns faulty
    #[arg(long)]
    fault_node: Option<String>,

    /// Kind of fault to inject
    #[arg(long, value_enum, default_value = "cpu")]
    fault: FaultKind,

    /// Seconds before the fault starts
    #[arg(long, default_value = "5")]
    fault_after_secs: u64,

    /// Seconds the fault lasts (0 = until shutdown)
    #[arg(long, default_value = "0")]
    fault_secs: u64,

    /// Simulated remediation failure probability
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Persist node state with sled under this directory
    #[arg(long, env = "MESH_SENTINEL_DATA_DIR")]
    data_dir: Option<String>,

    /// Seconds between status lines
    #[arg(long, default_value = "5")]
    status_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FaultKind {
    Cpu,
    Memory,
    Loss,
    Latency,
}

impl From<FaultKind> for IssueKind {
    fn from(kind: FaultKind) -> Self {
        match kind {
            FaultKind::Cpu => IssueKind::HighCpu,
            FaultKind::Memory => IssueKind::HighMemory,
            FaultKind::Loss => IssueKind::NetworkLoss,
            FaultKind::Latency => IssueKind::HighLatency,
        }
    }
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone)]
enum TaskName {
    Node { node: NodeId, service: Service },
    FaultInjector,
    StatusReporter,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Node { node, service } => write!(f, "{}/{}", node, service),
            TaskName::FaultInjector => write!(f, "FaultInjector"),
            TaskName::StatusReporter => write!(f, "StatusReporter"),
        }
    }
}

// ============================================================================
// Cluster Assembly
// ============================================================================

fn load_base_config(path: Option<&PathBuf>) -> Result<NodeConfig> {
    match path {
        Some(p) => NodeConfig::load_from_file(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(NodeConfig::load()),
    }
}

/// Member ids: the configured node plus its peers, or `node-1..node-N`.
fn cluster_members(base: &NodeConfig, nodes: usize) -> Vec<NodeId> {
    if base.node.peers.is_empty() {
        (1..=nodes.max(1)).map(|i| format!("node-{i}")).collect()
    } else {
        let mut ids = vec![base.node.id.clone()];
        ids.extend(base.node.peers.iter().cloned());
        ids.sort();
        ids.dedup();
        ids
    }
}

fn build_cluster(
    base: &NodeConfig,
    members: &[NodeId],
    args: &CliArgs,
    network: &Arc<LocalNetwork>,
    telemetry: &Arc<SyntheticTelemetry>,
    cancel_token: &CancellationToken,
) -> Result<Vec<Arc<NodeRuntime>>> {
    let remediation = Arc::new(SimulatedRemediation::new(args.failure_rate, Duration::from_millis(50)));
    let mut runtimes = Vec::with_capacity(members.len());

    for id in members {
        let mut node_config = base.clone();
        node_config.node.id = id.clone();
        node_config.node.peers = members.iter().filter(|m| *m != id).cloned().collect();
        if let Some(dir) = &args.data_dir {
            node_config.storage.backend = StorageBackend::Sled;
            node_config.storage.data_dir = dir.clone();
        }

        let runtime = NodeRuntime::builder(node_config)
            .transport(Arc::new(network.endpoint(id)))
            .telemetry(telemetry.clone())
            .remediation(remediation.clone())
            .cancel_token(cancel_token.child_token())
            .build()
            .with_context(|| format!("starting {id}"))?;
        network.on_receive(id, runtime.consensus().clone());
        runtimes.push(runtime);
    }
    Ok(runtimes)
}

// ============================================================================
// Task Spawning
// ============================================================================

fn spawn_node(task_set: &mut JoinSet<Result<TaskName>>, runtime: &Arc<NodeRuntime>, cycles: Option<u64>) {
    let node = runtime.node_id().to_string();
    let name = move |service| TaskName::Node {
        node: node.clone(),
        service,
    };

    let (rt, task) = (Arc::clone(runtime), name(Service::Consensus));
    task_set.spawn(async move { rt.run_consensus().await.map(|()| task) });

    let (rt, task) = (Arc::clone(runtime), name(Service::Applier));
    task_set.spawn(async move { rt.run_applier().await.map(|()| task) });

    let (rt, task) = (Arc::clone(runtime), name(Service::ControlCycle));
    task_set.spawn(async move { rt.run_cycles(cycles).await.map(|()| task) });

    let maintainer = runtime.maintainer();
    let cancel = runtime.cancel_token().clone();
    let task = name(Service::Maintenance);
    task_set.spawn(async move {
        maintainer.run(cancel).await;
        Ok(task)
    });
}

fn spawn_fault_injector(
    task_set: &mut JoinSet<Result<TaskName>>,
    telemetry: Arc<SyntheticTelemetry>,
    node: NodeId,
    issue: IssueKind,
    after: Duration,
    lasts: Option<Duration>,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(TaskName::FaultInjector),
            _ = tokio::time::sleep(after) => telemetry.inject_fault(&node, issue),
        }
        if let Some(lasts) = lasts {
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                _ = tokio::time::sleep(lasts) => telemetry.clear_fault(&node),
            }
        }
        Ok(TaskName::FaultInjector)
    });
}

fn spawn_status_reporter(
    task_set: &mut JoinSet<Result<TaskName>>,
    runtimes: Vec<Arc<NodeRuntime>>,
    every: Duration,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(TaskName::StatusReporter),
                _ = interval.tick() => {
                    for runtime in &runtimes {
                        info!("[Status] {}", runtime.status().headline());
                    }
                }
            }
        }
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure, stop once
/// every bounded control cycle has finished.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
    cycle_tasks: usize,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring...");
    let mut cycles_finished = 0usize;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task))) => {
                        info!("Supervisor: task {} completed normally", task);
                        if matches!(task, TaskName::Node { service: Service::ControlCycle, .. }) {
                            cycles_finished += 1;
                            if cycles_finished == cycle_tasks {
                                info!("Supervisor: every node finished its cycles");
                                cancel_token.cancel();
                                break;
                            }
                        }
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {:#}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    let drain = async {
        while let Some(result) = task_set.join_next().await {
            if let Ok(Err(e)) = result {
                warn!("Supervisor: task ended with error during shutdown: {:#}", e);
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("Supervisor: tasks still running after 5s, aborting");
        task_set.abort_all();
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let base = load_base_config(args.config.as_ref())?;
    config::init(base.clone());
    let members = cluster_members(&base, args.nodes);
    if let Some(fault_node) = &args.fault_node {
        if !members.contains(fault_node) {
            bail!("--fault-node {} is not a cluster member ({})", fault_node, members.join(", "));
        }
    }

    info!("Mesh Sentinel - self-healing cluster simulation");
    info!(
        "Members: {} | cycle {}ms | storage {:?}",
        members.join(", "),
        base.cycle.interval_ms,
        if args.data_dir.is_some() { StorageBackend::Sled } else { base.storage.backend }
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let network = LocalNetwork::new();
    let telemetry = Arc::new(SyntheticTelemetry::new(members.clone()));
    let runtimes = build_cluster(&base, &members, &args, &network, &telemetry, &cancel_token)?;

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    for runtime in &runtimes {
        spawn_node(&mut task_set, runtime, args.cycles);
    }
    if let Some(fault_node) = args.fault_node.clone() {
        let lasts = (args.fault_secs > 0).then(|| Duration::from_secs(args.fault_secs));
        spawn_fault_injector(
            &mut task_set,
            Arc::clone(&telemetry),
            fault_node,
            args.fault.into(),
            Duration::from_secs(args.fault_after_secs),
            lasts,
            cancel_token.clone(),
        );
    }
    spawn_status_reporter(
        &mut task_set,
        runtimes.clone(),
        Duration::from_secs(args.status_secs.max(1)),
        cancel_token.clone(),
    );

    let cycle_tasks = if args.cycles.is_some() { runtimes.len() } else { usize::MAX };
    let result = run_supervisor(&mut task_set, cancel_token, cycle_tasks).await;

    for runtime in &runtimes {
        runtime.shutdown();
        match runtime.status().to_json() {
            Ok(json) => info!("Final status of {}:\n{}", runtime.node_id(), json),
            Err(e) => warn!("Could not render status of {}: {}", runtime.node_id(), e),
        }
    }

    info!("Mesh Sentinel shutdown complete");
    result
}
