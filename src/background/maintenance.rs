//! Maintainer - periodic upkeep of the knowledge and governance stores
//!
//! Each task runs on its own interval:
//! - Knowledge sweep: evicts records past their TTL
//! - Threshold recompute: folds new outcomes into the adaptive thresholds
//! - Proposal sweep: resolves expired proposals, evicts old resolved ones

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{GovernanceConfig, KnowledgeConfig};
use crate::governance::GovernanceLedger;
use crate::knowledge::KnowledgeStore;

/// Loop wake-up granularity; task intervals are rounded up to this.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What one task run did
#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceOutcome {
    Idle,
    Evicted(usize),
    Retuned { warning_sigma: f64 },
}

impl std::fmt::Display for MaintenanceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceOutcome::Idle => write!(f, "idle"),
            MaintenanceOutcome::Evicted(n) => write!(f, "evicted {}", n),
            MaintenanceOutcome::Retuned { warning_sigma } => {
                write!(f, "retuned (warning_sigma {:.2})", warning_sigma)
            }
        }
    }
}

/// Periodic upkeep job.
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn run(&self) -> MaintenanceOutcome;
}

pub struct KnowledgeSweep {
    knowledge: Arc<KnowledgeStore>,
    interval: Duration,
}

impl KnowledgeSweep {
    pub fn new(knowledge: Arc<KnowledgeStore>, interval: Duration) -> Self {
        Self { knowledge, interval }
    }
}

impl MaintenanceTask for KnowledgeSweep {
    fn name(&self) -> &'static str {
        "knowledge_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self) -> MaintenanceOutcome {
        match self.knowledge.sweep() {
            0 => MaintenanceOutcome::Idle,
            n => MaintenanceOutcome::Evicted(n),
        }
    }
}

pub struct ThresholdRecompute {
    knowledge: Arc<KnowledgeStore>,
    interval: Duration,
}

impl ThresholdRecompute {
    pub fn new(knowledge: Arc<KnowledgeStore>, interval: Duration) -> Self {
        Self { knowledge, interval }
    }
}

impl MaintenanceTask for ThresholdRecompute {
    fn name(&self) -> &'static str {
        "threshold_recompute"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self) -> MaintenanceOutcome {
        let before = self.knowledge.thresholds();
        let after = self.knowledge.recompute_thresholds();
        if *before == after {
            MaintenanceOutcome::Idle
        } else {
            MaintenanceOutcome::Retuned {
                warning_sigma: after.warning_sigma,
            }
        }
    }
}

pub struct ProposalSweep {
    governance: Arc<GovernanceLedger>,
    interval: Duration,
}

impl ProposalSweep {
    pub fn new(governance: Arc<GovernanceLedger>, interval: Duration) -> Self {
        Self { governance, interval }
    }
}

impl MaintenanceTask for ProposalSweep {
    fn name(&self) -> &'static str {
        "proposal_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self) -> MaintenanceOutcome {
        match self.governance.sweep() {
            0 => MaintenanceOutcome::Idle,
            n => MaintenanceOutcome::Evicted(n),
        }
    }
}

/// Runs registered tasks until cancelled.
pub struct Maintainer {
    tasks: Vec<Box<dyn MaintenanceTask>>,
}

impl Maintainer {
    pub fn new(tasks: Vec<Box<dyn MaintenanceTask>>) -> Self {
        Self { tasks }
    }

    /// The standard task set for one node.
    pub fn standard(
        knowledge: Arc<KnowledgeStore>,
        governance: Arc<GovernanceLedger>,
        knowledge_config: &KnowledgeConfig,
        governance_config: &GovernanceConfig,
    ) -> Self {
        // proposals are swept at least once a minute even with a long retention
        let proposal_interval = Duration::from_secs(governance_config.retention_secs.clamp(1, 60));
        Self::new(vec![
            Box::new(KnowledgeSweep::new(
                Arc::clone(&knowledge),
                Duration::from_secs(knowledge_config.sweep_interval_secs),
            )),
            Box::new(ThresholdRecompute::new(
                knowledge,
                Duration::from_secs(knowledge_config.recompute_interval_secs),
            )),
            Box::new(ProposalSweep::new(governance, proposal_interval)),
        ])
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run every task once, regardless of schedule.
    pub fn run_all(&self) -> Vec<(&'static str, MaintenanceOutcome)> {
        self.tasks.iter().map(|t| (t.name(), Self::run_task(t.as_ref()))).collect()
    }

    fn run_task(task: &dyn MaintenanceTask) -> MaintenanceOutcome {
        let outcome = task.run();
        match &outcome {
            MaintenanceOutcome::Idle => debug!(task = task.name(), "Maintenance idle"),
            other => info!(task = task.name(), outcome = %other, "Maintenance ran"),
        }
        outcome
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(tasks = ?self.task_names(), "Maintainer started");
        let mut next_due: Vec<Instant> = self.tasks.iter().map(|t| Instant::now() + t.interval()).collect();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Maintainer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for (task, due) in self.tasks.iter().zip(next_due.iter_mut()) {
                        if now >= *due {
                            Self::run_task(task.as_ref());
                            *due = now + task.interval().max(POLL_INTERVAL);
                        }
                    }
                }
            }
        }
    }
}
