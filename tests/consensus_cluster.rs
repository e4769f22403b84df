//! Multi-node consensus over the in-process network.

use mesh_sentinel::config::ConsensusConfig;
use mesh_sentinel::consensus::ConsensusCoordinator;
use mesh_sentinel::transport::LocalNetwork;
use mesh_sentinel::{ActionOrigin, ActionType, IssueKind, NodeId, RecoveryAction, Role};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Cluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<ConsensusCoordinator>>,
    /// term -> leader seen in that term
    leaders: Mutex<HashMap<u64, NodeId>>,
}

impl Cluster {
    fn new(size: usize, seed: u64) -> Self {
        Self::with_config(size, seed, ConsensusConfig::default())
    }

    fn with_config(size: usize, seed: u64, config: ConsensusConfig) -> Self {
        let network = LocalNetwork::seeded(seed);
        let ids: Vec<NodeId> = (1..=size).map(|i| format!("n{i}")).collect();
        let nodes = ids
            .iter()
            .map(|id| {
                let node = ConsensusCoordinator::new(
                    id,
                    &ids,
                    config.clone(),
                    Arc::new(network.endpoint(id)),
                    None,
                );
                network.on_receive(id, node.clone());
                node
            })
            .collect();
        Self {
            network,
            nodes,
            leaders: Mutex::new(HashMap::new()),
        }
    }

    fn node(&self, id: &str) -> &Arc<ConsensusCoordinator> {
        self.nodes.iter().find(|n| n.id() == id).unwrap()
    }

    /// Record every leader observed, failing on two leaders in one term.
    fn observe_leaders(&self) {
        let mut leaders = self.leaders.lock().unwrap();
        for n in &self.nodes {
            let status = n.status();
            if status.role == Role::Leader {
                let seen = leaders.entry(status.term).or_insert_with(|| n.id().to_string());
                assert_eq!(seen, n.id(), "two leaders in term {}", status.term);
            }
        }
    }

    /// Tick `live` nodes until `done` holds or the deadline passes.
    async fn drive_until<F: Fn(&Self) -> bool>(&self, live: &[&str], deadline: Duration, done: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            for n in self.nodes.iter().filter(|n| live.contains(&n.id())) {
                n.tick().await;
            }
            self.observe_leaders();
            if done(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn leaders_among(&self, live: &[&str]) -> Vec<Arc<ConsensusCoordinator>> {
        self.nodes
            .iter()
            .filter(|n| live.contains(&n.id()) && n.is_leader())
            .cloned()
            .collect()
    }
}

/// One leader that every node agrees on, with its first entry committed everywhere.
fn settled(c: &Cluster) -> bool {
    let leaders = c.leaders_among(&ALL);
    leaders.len() == 1
        && c.nodes.iter().all(|n| {
            n.leader_id().as_deref() == Some(leaders[0].id()) && n.status().commit_index >= 1
        })
}

fn action(target: &str) -> RecoveryAction {
    RecoveryAction::new(ActionType::SwitchRoute, target, IssueKind::NetworkLoss, ActionOrigin::AutoExecute)
}

const ALL: [&str; 5] = ["n1", "n2", "n3", "n4", "n5"];

#[tokio::test]
async fn five_nodes_elect_exactly_one_leader() {
    let cluster = Cluster::new(5, 11);
    let elected = cluster.drive_until(&ALL, Duration::from_secs(5), settled).await;
    assert!(elected, "no stable leader within 5s");

    let leader = &cluster.leaders_among(&ALL)[0];
    for n in &cluster.nodes {
        assert_eq!(n.current_term(), leader.current_term());
        if n.id() != leader.id() {
            assert_eq!(n.role(), Role::Follower);
            assert!(n.has_live_leader(Duration::from_secs(1)));
        }
    }
}

#[tokio::test]
async fn follower_forwards_and_entry_replicates() {
    let cluster = Cluster::new(5, 12);
    assert!(cluster.drive_until(&ALL, Duration::from_secs(5), settled).await);
    let leader_id = cluster.leaders_among(&ALL)[0].id().to_string();
    let follower = cluster.nodes.iter().find(|n| n.id() != leader_id).unwrap();

    let a = action("edge-4");
    let index = follower.propose(a.clone()).await.unwrap();
    let replicated = cluster
        .drive_until(&ALL, Duration::from_secs(3), |c| {
            c.nodes.iter().all(|n| n.status().commit_index >= index)
        })
        .await;
    assert!(replicated, "entry {index} not committed everywhere");

    for n in &cluster.nodes {
        let committed = n.committed_entries();
        let entry = &committed[(index - 1) as usize];
        assert_eq!(entry.key, a.id);
        // the leader stamps itself as the executor
        assert_eq!(entry.action().unwrap().assigned_executor.as_deref(), Some(leader_id.as_str()));
    }
}

#[tokio::test]
async fn isolated_leader_is_replaced_at_a_higher_term() {
    let cluster = Cluster::new(5, 13);
    assert!(cluster.drive_until(&ALL, Duration::from_secs(5), settled).await);
    let old = cluster.leaders_among(&ALL)[0].clone();
    let old_term = old.current_term();

    cluster.network.isolate(old.id());
    let survivors: Vec<&str> = ALL.iter().copied().filter(|id| *id != old.id()).collect();

    // the old leader keeps ticking so its lease can lapse
    let replaced = cluster
        .drive_until(&ALL, Duration::from_secs(5), |c| {
            let leaders = c.leaders_among(&survivors);
            leaders.len() == 1 && leaders[0].current_term() > old_term && !old.is_leader()
        })
        .await;
    assert!(replaced, "survivors did not elect a replacement");

    let new_leader = cluster.leaders_among(&survivors)[0].clone();
    assert_ne!(new_leader.id(), old.id());

    // the four survivors are still a majority and can commit
    let a = action("edge-1");
    let index = new_leader.propose(a.clone()).await.unwrap();
    assert!(
        cluster
            .drive_until(&ALL, Duration::from_secs(3), |c| {
                survivors.iter().all(|id| c.node(id).status().commit_index >= index)
            })
            .await
    );
    assert!(old.status().commit_index < index);

    // once healed the old leader catches up on what it missed
    cluster.network.heal(old.id());
    assert!(
        cluster
            .drive_until(&ALL, Duration::from_secs(5), |c| {
                c.node(old.id()).status().commit_index >= index
            })
            .await
    );
    assert_eq!(old.committed_entries()[(index - 1) as usize].key, a.id);
}

#[tokio::test]
async fn removed_leader_is_replaced() {
    let cluster = Cluster::new(5, 14);
    assert!(cluster.drive_until(&ALL, Duration::from_secs(5), settled).await);
    let old = cluster.leaders_among(&ALL)[0].clone();
    let old_term = old.current_term();
    cluster.network.remove(old.id());
    let survivors: Vec<&str> = ALL.iter().copied().filter(|id| *id != old.id()).collect();

    let replaced = cluster
        .drive_until(&survivors, Duration::from_secs(5), |c| {
            let leaders = c.leaders_among(&survivors);
            leaders.len() == 1 && leaders[0].current_term() > old_term
        })
        .await;
    assert!(replaced);
    assert_eq!(cluster.network.members().len(), 4);
}

#[tokio::test]
async fn minority_partition_cannot_commit() {
    let cluster = Cluster::new(5, 15);
    assert!(cluster.drive_until(&ALL, Duration::from_secs(5), settled).await);
    let leader = cluster.leaders_among(&ALL)[0].clone();
    let before = leader.status().commit_index;

    // cut three followers, leaving the leader with one peer
    let followers: Vec<String> = cluster
        .nodes
        .iter()
        .filter(|n| n.id() != leader.id())
        .map(|n| n.id().to_string())
        .collect();
    for id in followers.iter().take(3) {
        cluster.network.isolate(id);
    }

    if let Ok(index) = leader.propose(action("edge-3")).await {
        let committed = cluster
            .drive_until(&[leader.id()], Duration::from_millis(400), |_| {
                leader.status().commit_index >= index
            })
            .await;
        assert!(!committed, "a minority must not commit");
    }
    assert_eq!(leader.status().commit_index, before);
}

#[tokio::test]
async fn lagging_follower_catches_up_from_snapshot() {
    let config = ConsensusConfig {
        log_compaction_threshold: 8,
        applied_key_window: 64,
        ..ConsensusConfig::default()
    };
    let cluster = Cluster::with_config(3, 16, config);
    let all = ["n1", "n2", "n3"];
    assert!(cluster.drive_until(&all, Duration::from_secs(5), settled).await);
    let leader = cluster.leaders_among(&all)[0].clone();
    let lagging = cluster.nodes.iter().find(|n| n.id() != leader.id()).unwrap().clone();
    let live: Vec<&str> = all.iter().copied().filter(|id| *id != lagging.id()).collect();

    cluster.network.isolate(lagging.id());
    let mut last = 0;
    let mut keys = Vec::new();
    for i in 0..40 {
        let a = action(&format!("edge-{i}"));
        last = leader.propose(a.clone()).await.unwrap();
        leader.release_target(&a.target_node, a.id);
        keys.push(a.id);
    }
    // only the two connected nodes tick, so the isolated one keeps its term
    assert!(
        cluster
            .drive_until(&live, Duration::from_secs(3), |_| leader.status().applied_index >= last)
            .await
    );
    let compacted_to = leader.status().snapshot_index;
    assert!(compacted_to > lagging.status().last_log_index, "leader never compacted past the follower");

    cluster.network.heal(lagging.id());
    let caught_up = cluster
        .drive_until(&all, Duration::from_secs(5), |c| {
            let status = lagging.status();
            let leaders = c.leaders_among(&all);
            leaders.len() == 1 && status.commit_index >= last && status.snapshot_index >= compacted_to
        })
        .await;
    assert!(caught_up, "follower did not catch up through a snapshot");

    let status = lagging.status();
    assert!(status.applied_index >= last);
    assert!(status.applied_keys > 0);
    // retained entries start right after the snapshot
    if let Some(first) = lagging.committed_entries().first() {
        assert_eq!(first.index, status.snapshot_index + 1);
    }
    assert!(lagging.committed_entries().len() <= 8);
}
