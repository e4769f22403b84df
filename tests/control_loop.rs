//! End-to-end control loop: telemetry through detection, decision,
//! consensus and execution.

use mesh_sentinel::config::{DetectorBackend, StorageBackend};
use mesh_sentinel::control::{NodeRuntime, Service, StaticTelemetry, SyntheticTelemetry};
use mesh_sentinel::executor::SimulatedRemediation;
use mesh_sentinel::governance::{ProposalStatus, VoteChoice};
use mesh_sentinel::storage::InMemoryStateStore;
use mesh_sentinel::transport::LocalNetwork;
use mesh_sentinel::types::metrics;
use mesh_sentinel::{
    ActionOrigin, ActionStatus, ActionType, AnomalyEvent, CycleOutcome, FeatureMap, IssueKind, NodeConfig,
    RecoveryAction,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

type Tasks = JoinSet<anyhow::Result<Service>>;

fn config(id: &str, peers: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.id = id.to_string();
    config.node.peers = peers.iter().map(|p| p.to_string()).collect();
    config.detector.backend = DetectorBackend::Rule;
    config.storage.backend = StorageBackend::Memory;
    config.cycle.interval_ms = 50;
    config
}

fn readings(cpu: f64) -> FeatureMap {
    let mut f = FeatureMap::new();
    f.insert(metrics::CPU_PERCENT.to_string(), cpu);
    f.insert(metrics::MEMORY_PERCENT.to_string(), 40.0);
    f
}

async fn wait_for<F: Fn() -> bool>(deadline: Duration, done: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

fn succeeded(runtime: &NodeRuntime, target: &str) -> Option<RecoveryAction> {
    runtime
        .executor()
        .history(100)
        .into_iter()
        .find(|a| a.target_node == target && a.status == ActionStatus::Succeeded)
}

async fn stop(runtimes: &[Arc<NodeRuntime>], mut tasks: Tasks) {
    for rt in runtimes {
        rt.shutdown();
    }
    let drained = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    })
    .await;
    assert!(drained.is_ok(), "services did not stop on cancellation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturated_cpu_is_remediated_automatically() {
    let network = LocalNetwork::new();
    let telemetry = Arc::new(StaticTelemetry::default());
    telemetry.set("n1", readings(99.0));
    let remediation = Arc::new(SimulatedRemediation::new(0.0, Duration::from_millis(10)));
    let runtime = NodeRuntime::builder(config("n1", &[]))
        .transport(Arc::new(network.endpoint("n1")))
        .telemetry(telemetry.clone())
        .remediation(remediation.clone())
        .store(Arc::new(InMemoryStateStore::new()))
        .build()
        .unwrap();
    network.on_receive("n1", runtime.consensus().clone());

    let mut tasks = JoinSet::new();
    runtime.start(&mut tasks, None);

    assert!(
        wait_for(Duration::from_secs(5), || succeeded(&runtime, "n1").is_some()).await,
        "no remediation ran"
    );
    telemetry.set("n1", readings(30.0));

    let action = succeeded(&runtime, "n1").unwrap();
    assert_eq!(action.action_type, ActionType::RestartService);
    assert_eq!(action.issue, IssueKind::HighCpu);
    assert_eq!(action.origin, ActionOrigin::AutoExecute);
    assert_eq!(action.assigned_executor.as_deref(), Some("n1"));
    assert_eq!(
        action.status_trail,
        vec![ActionStatus::Pending, ActionStatus::Running, ActionStatus::Succeeded]
    );
    assert!(action.recovery_secs().is_some());

    let status = runtime.status();
    assert!(!status.observe_only);
    assert_eq!(status.executor_success_rate, Some(1.0));
    assert!(status.knowledge.anomalies_recorded >= 1);
    assert!(status.knowledge.outcomes_recorded >= 1);
    assert!(remediation.invocations() >= 1);

    stop(&[runtime], tasks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_without_quorum_never_executes() {
    // peers n2 and n3 never come up
    let network = LocalNetwork::new();
    let telemetry = Arc::new(StaticTelemetry::default());
    telemetry.set("n1", readings(99.0));
    let mut cfg = config("n1", &["n2", "n3"]);
    cfg.cycle.interval_ms = 20;
    let runtime = NodeRuntime::builder(cfg)
        .transport(Arc::new(network.endpoint("n1")))
        .telemetry(telemetry.clone())
        .build()
        .unwrap();
    network.on_receive("n1", runtime.consensus().clone());

    let mut tasks = JoinSet::new();
    runtime.start(&mut tasks, Some(10));
    assert!(wait_for(Duration::from_secs(3), || runtime.status().cycles_completed >= 10).await);

    assert!(runtime.is_observe_only());
    assert!(!runtime.consensus().is_leader());
    assert!(runtime.executor().history(10).is_empty());
    assert_eq!(runtime.knowledge().stats().anomalies_recorded, 10);

    stop(&[runtime], tasks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_proposal_runs_once_an_operator_agrees() {
    let network = LocalNetwork::new();
    let mut cfg = config("n1", &[]);
    cfg.governance.voters.insert("ops".to_string(), 100);
    let runtime = NodeRuntime::builder(cfg)
        .transport(Arc::new(network.endpoint("n1")))
        .remediation(Arc::new(SimulatedRemediation::new(0.0, Duration::ZERO)))
        .build()
        .unwrap();
    network.on_receive("n1", runtime.consensus().clone());

    let mut tasks = JoinSet::new();
    runtime.start(&mut tasks, None);
    assert!(wait_for(Duration::from_secs(3), || runtime.consensus().is_leader()).await);

    let event = AnomalyEvent::new(
        "n1",
        0.925,
        0.85,
        true,
        readings(91.5),
        Some(metrics::CPU_PERCENT.to_string()),
        "rule",
    );
    let CycleOutcome::ProposalOpened { proposal_id } = runtime.submit(event).await else {
        panic!("expected an emergency proposal");
    };
    // the node's own vote alone cannot carry it against an outstanding operator
    let ledger = runtime.governance();
    assert!(
        wait_for(Duration::from_secs(2), || {
            ledger.get(proposal_id).is_ok_and(|p| p.votes.contains_key("n1"))
        })
        .await
    );
    assert_eq!(ledger.get(proposal_id).unwrap().status, ProposalStatus::Open);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(runtime.executor().history(10).is_empty());

    runtime.cast_vote(proposal_id, "ops", VoteChoice::Yes, 100).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || {
            ledger.get(proposal_id).is_ok_and(|p| p.status == ProposalStatus::Passed)
        })
        .await
    );

    assert!(wait_for(Duration::from_secs(3), || succeeded(&runtime, "n1").is_some()).await);
    let action = succeeded(&runtime, "n1").unwrap();
    assert_eq!(action.origin, ActionOrigin::Proposal(proposal_id));

    stop(&[runtime], tasks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fault_on_a_follower_is_fixed_by_the_leader() {
    let ids = ["n1", "n2", "n3"];
    let network = LocalNetwork::seeded(21);
    let telemetry = Arc::new(SyntheticTelemetry::seeded(ids.iter().map(|s| s.to_string()).collect(), 21));
    let remediation = Arc::new(SimulatedRemediation::seeded(0.0, Duration::from_millis(10), 21));

    let runtimes: Vec<Arc<NodeRuntime>> = ids
        .iter()
        .map(|id| {
            let peers: Vec<&str> = ids.iter().copied().filter(|p| p != id).collect();
            let runtime = NodeRuntime::builder(config(id, &peers))
                .transport(Arc::new(network.endpoint(id)))
                .telemetry(telemetry.clone())
                .remediation(remediation.clone())
                .build()
                .unwrap();
            network.on_receive(id, runtime.consensus().clone());
            runtime
        })
        .collect();

    let mut tasks = JoinSet::new();
    for rt in &runtimes {
        rt.start(&mut tasks, None);
    }
    assert!(
        wait_for(Duration::from_secs(5), || {
            runtimes.iter().filter(|rt| rt.consensus().is_leader()).count() == 1
                && runtimes.iter().all(|rt| !rt.is_observe_only())
        })
        .await,
        "cluster never settled"
    );
    let follower = runtimes.iter().find(|rt| !rt.consensus().is_leader()).unwrap().clone();

    telemetry.inject_fault(follower.node_id(), IssueKind::HighLatency);
    assert!(
        wait_for(Duration::from_secs(8), || {
            runtimes.iter().any(|rt| succeeded(rt, follower.node_id()).is_some())
        })
        .await,
        "fault on {} was never remediated",
        follower.node_id()
    );
    telemetry.clear_fault(follower.node_id());

    // whoever led at commit time ran it; normally the original leader
    let runner = runtimes
        .iter()
        .find(|rt| succeeded(rt, follower.node_id()).is_some())
        .unwrap();
    let action = succeeded(runner, follower.node_id()).unwrap();
    assert_eq!(action.action_type, ActionType::SwitchRoute);
    assert_eq!(action.assigned_executor.as_deref(), Some(runner.node_id()));

    stop(&runtimes, tasks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_cast_on_another_node_carries_the_proposal() {
    let ids = ["n1", "n2", "n3"];
    let network = LocalNetwork::seeded(22);
    let runtimes: Vec<Arc<NodeRuntime>> = ids
        .iter()
        .map(|id| {
            let peers: Vec<&str> = ids.iter().copied().filter(|p| p != id).collect();
            let mut cfg = config(id, &peers);
            cfg.governance.node_tokens = 0;
            cfg.governance.voters.insert("ops".to_string(), 100);
            let runtime = NodeRuntime::builder(cfg)
                .transport(Arc::new(network.endpoint(id)))
                .remediation(Arc::new(SimulatedRemediation::new(0.0, Duration::ZERO)))
                .build()
                .unwrap();
            network.on_receive(id, runtime.consensus().clone());
            runtime
        })
        .collect();

    let mut tasks = JoinSet::new();
    for rt in &runtimes {
        rt.start(&mut tasks, None);
    }
    assert!(
        wait_for(Duration::from_secs(5), || {
            runtimes.iter().filter(|rt| rt.consensus().is_leader()).count() == 1
                && runtimes.iter().all(|rt| !rt.is_observe_only())
        })
        .await,
        "cluster never settled"
    );
    let opener = runtimes.iter().find(|rt| rt.consensus().is_leader()).unwrap().clone();
    let voter = runtimes.iter().find(|rt| rt.node_id() != opener.node_id()).unwrap().clone();

    // mid-confidence anomaly: a standard proposal nobody votes on automatically
    let event = AnomalyEvent::new(
        "edge-7",
        0.85,
        0.7,
        true,
        readings(93.0),
        Some(metrics::CPU_PERCENT.to_string()),
        "rule",
    );
    let CycleOutcome::ProposalOpened { proposal_id } = opener.submit(event).await else {
        panic!("expected a standard proposal");
    };
    assert!(voter.governance().await_present(proposal_id, Duration::from_secs(3)).await);
    assert_eq!(voter.governance().get(proposal_id).unwrap().status, ProposalStatus::Open);

    voter.cast_vote(proposal_id, "ops", VoteChoice::Yes, 100).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(3), || {
            runtimes.iter().all(|rt| {
                rt.governance()
                    .get(proposal_id)
                    .is_ok_and(|p| p.status == ProposalStatus::Passed && p.votes.contains_key("ops"))
            })
        })
        .await,
        "not every replica saw the proposal pass"
    );

    assert!(
        wait_for(Duration::from_secs(5), || {
            runtimes.iter().any(|rt| succeeded(rt, "edge-7").is_some())
        })
        .await,
        "passed proposal was never executed"
    );
    let runner = runtimes.iter().find(|rt| succeeded(rt, "edge-7").is_some()).unwrap();
    let action = succeeded(runner, "edge-7").unwrap();
    assert_eq!(action.origin, ActionOrigin::Proposal(proposal_id));

    stop(&runtimes, tasks).await;
}
