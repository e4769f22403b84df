//! Node runtime - one MAPE-K loop per process
//!
//! Owns every component exactly once and wires them together:
//!
//! ```text
//! telemetry -> detector -> gate ─┬─ AutoExecute ──────────────► consensus.propose
//!                                ├─ Emergency/Standard ─► ledger ─(passed)─┘
//!                                └─ LogOnly
//! consensus (committed entries) -> applier ─┬─ actions -> executor -> knowledge
//!                                           └─ proposals, ballots -> ledger
//! ```
//!
//! Proposals and ballots go through the replicated log like actions do, so
//! every node's ledger holds the same proposals with the same votes.
//!
//! Four services run per node: the consensus tick driver, the committed-entry
//! applier, the control cycle and the maintainer. All stop on the runtime's
//! cancellation token.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::status::StatusSnapshot;
use super::telemetry::{StaticTelemetry, TelemetrySource};
use crate::background::Maintainer;
use crate::config::NodeConfig;
use crate::consensus::{CommittedEntry, ConsensusCoordinator, ConsensusError, EntryPayload};
use crate::decision::{Decision, DecisionGate, RemediationPlanner};
use crate::detector::{shared, AnomalyDetector, FallbackDetector, FeatureThresholds};
use crate::executor::{ExecutionError, RecoveryExecutor, RemediationHandler, SimulatedRemediation};
use crate::governance::{GovernanceLedger, GovernanceOp, ProposalKind, VoteChoice};
use crate::knowledge::KnowledgeStore;
use crate::storage::{open_store, StateStore};
use crate::transport::Transport;
use crate::types::{ActionOrigin, ActionType, AnomalyEvent, IssueKind, NodeId, RecoveryAction};

/// Long-running services of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Consensus,
    Applier,
    ControlCycle,
    Maintenance,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Consensus => write!(f, "Consensus"),
            Service::Applier => write!(f, "Applier"),
            Service::ControlCycle => write!(f, "ControlCycle"),
            Service::Maintenance => write!(f, "Maintenance"),
        }
    }
}

/// What one cycle (or one submitted event) led to
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Telemetry had no reading for this node
    NoTelemetry,
    Nominal,
    LogOnly,
    /// Anomaly worth acting on, but no live leader
    ObserveOnly,
    /// A proposal or commit for the target is already outstanding
    RemediationPending { target: NodeId },
    Committed { action_id: Uuid, index: u64 },
    ProposalOpened { proposal_id: Uuid },
    /// The route was chosen but could not be taken this cycle
    Deferred { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Commit,
    Proposal,
}

/// This node's outstanding remediation for one target.
#[derive(Debug, Clone, Copy)]
struct PendingRemediation {
    claim: Uuid,
    kind: PendingKind,
    since: Instant,
}

pub struct NodeRuntimeBuilder {
    config: NodeConfig,
    transport: Option<Arc<dyn Transport>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    remediation: Option<Arc<dyn RemediationHandler>>,
    store: Option<Arc<dyn StateStore>>,
    cancel: Option<CancellationToken>,
}

impl NodeRuntimeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            transport: None,
            telemetry: None,
            remediation: None,
            store: None,
            cancel: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn remediation(mut self, handler: Arc<dyn RemediationHandler>) -> Self {
        self.remediation = Some(handler);
        self
    }

    /// Use this store instead of the one `[storage]` describes.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Result<Arc<NodeRuntime>> {
        let config = self.config;
        config.validate()?;
        let node_id = config.node.id.clone();
        let transport = self.transport.context("a transport is required")?;
        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.storage, &node_id)
                .with_context(|| format!("opening state store for {node_id}"))?,
        };

        let thresholds = shared(FeatureThresholds::from_config(&config.detector));
        let knowledge = Arc::new(KnowledgeStore::new(config.knowledge.clone(), thresholds.clone()));
        let detector: Arc<dyn AnomalyDetector> = Arc::new(FallbackDetector::from_config(&config.detector, thresholds));

        // the same electorate on every node: each member at its stake, then operators
        let governance = Arc::new(GovernanceLedger::new(Duration::from_secs(config.governance.retention_secs)));
        if config.governance.node_tokens > 0 {
            let mut members: Vec<&NodeId> = config.node.peers.iter().chain(std::iter::once(&node_id)).collect();
            members.sort();
            members.dedup();
            for member in members {
                governance.register_voter(member, config.governance.node_tokens)?;
            }
        }
        for (voter, balance) in &config.governance.voters {
            governance.register_voter(voter, *balance)?;
        }

        let consensus = ConsensusCoordinator::new(
            &node_id,
            &config.node.peers,
            config.consensus.clone(),
            transport,
            Some(Arc::clone(&store)),
        );

        let remediation: Arc<dyn RemediationHandler> = match self.remediation {
            Some(handler) => handler,
            None => Arc::new(SimulatedRemediation::default()),
        };
        let executor = Arc::new(
            RecoveryExecutor::new(&node_id, config.executor.clone(), config.breaker.clone(), remediation)
                .with_knowledge(Arc::clone(&knowledge))
                .with_store(Arc::clone(&store)),
        );

        let telemetry: Arc<dyn TelemetrySource> = match self.telemetry {
            Some(source) => source,
            None => Arc::new(StaticTelemetry::default()),
        };
        let observe_only_after = Duration::from_millis(config.consensus.observe_only_after_ms);

        info!(
            node = %node_id,
            peers = config.node.peers.len(),
            detector = ?config.detector.backend,
            storage = store.backend_name(),
            telemetry = telemetry.source_name(),
            remediation = executor.handler_name(),
            "Node runtime assembled"
        );

        Ok(Arc::new_cyclic(|me| NodeRuntime {
            node_id,
            gate: DecisionGate::new(config.decision.clone()),
            planner: RemediationPlanner::new(Some(Arc::clone(&knowledge))),
            detector,
            knowledge,
            governance,
            consensus,
            executor,
            telemetry,
            pending: DashMap::new(),
            // a commit that has not been applied within twice the leaderless
            // window is assumed lost
            commit_wait: observe_only_after * 2,
            observe_only_after,
            observe_only: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
            last_cycle_at: Mutex::new(None),
            cancel: self.cancel.unwrap_or_else(CancellationToken::new),
            config,
            me: me.clone(),
        }))
    }
}

pub struct NodeRuntime {
    node_id: NodeId,
    config: NodeConfig,
    detector: Arc<dyn AnomalyDetector>,
    gate: DecisionGate,
    planner: RemediationPlanner,
    knowledge: Arc<KnowledgeStore>,
    governance: Arc<GovernanceLedger>,
    consensus: Arc<ConsensusCoordinator>,
    executor: Arc<RecoveryExecutor>,
    telemetry: Arc<dyn TelemetrySource>,
    /// target -> this node's outstanding proposal or commit
    pending: DashMap<NodeId, PendingRemediation>,
    commit_wait: Duration,
    observe_only_after: Duration,
    observe_only: AtomicBool,
    cycles: AtomicU64,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
    me: Weak<NodeRuntime>,
}

impl NodeRuntime {
    pub fn builder(config: NodeConfig) -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn consensus(&self) -> &Arc<ConsensusCoordinator> {
        &self.consensus
    }

    pub fn governance(&self) -> &Arc<GovernanceLedger> {
        &self.governance
    }

    pub fn executor(&self) -> &Arc<RecoveryExecutor> {
        &self.executor
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_observe_only(&self) -> bool {
        self.observe_only.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Control cycle
    // ========================================================================

    /// Monitor, analyze and decide once for this node.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let snapshot = self.telemetry.collect().await.context("collecting telemetry")?;
        let outcome = match snapshot.get(&self.node_id) {
            None => {
                debug!(node = %self.node_id, "No telemetry for this node");
                CycleOutcome::NoTelemetry
            }
            Some(features) => {
                let event = self.detector.predict(&self.node_id, features);
                if event.is_anomaly {
                    self.submit(event).await
                } else {
                    self.detector.observe(&self.node_id, features);
                    self.refresh_observe_only();
                    CycleOutcome::Nominal
                }
            }
        };
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut at) = self.last_cycle_at.lock() {
            *at = Some(Utc::now());
        }
        Ok(outcome)
    }

    /// Route one scored event through the decision gate.
    pub async fn submit(&self, event: AnomalyEvent) -> CycleOutcome {
        if event.is_anomaly {
            self.knowledge.record_anomaly(&event);
        }
        let decision = self.gate.decide_event(&event);
        let observe_only = self.refresh_observe_only();

        if decision == Decision::LogOnly {
            if event.is_anomaly {
                info!(
                    node = %event.node_id,
                    score = event.score,
                    confidence = event.confidence,
                    "Anomaly below action confidence, logging only"
                );
            }
            return CycleOutcome::LogOnly;
        }
        if observe_only {
            warn!(
                node = %event.node_id,
                decision = decision.label(),
                "No live leader, observing only"
            );
            return CycleOutcome::ObserveOnly;
        }

        let target = event.node_id.clone();
        let (issue, action_type) = self.planner.plan(&event);
        info!(
            node = %target,
            %issue,
            action = %action_type,
            decision = decision.label(),
            score = event.score,
            confidence = event.confidence,
            "Anomaly detected"
        );

        match decision {
            Decision::AutoExecute => {
                self.commit(RecoveryAction::new(action_type, &target, issue, ActionOrigin::AutoExecute))
                    .await
            }
            Decision::EmergencyProposal { expiry } => {
                self.open_proposal(ProposalKind::Emergency, expiry, &event, issue, action_type)
                    .await
            }
            Decision::StandardProposal { expiry } => {
                self.open_proposal(ProposalKind::Standard, expiry, &event, issue, action_type)
                    .await
            }
            Decision::LogOnly => CycleOutcome::LogOnly,
        }
    }

    fn refresh_observe_only(&self) -> bool {
        let observe_only = !self.consensus.has_live_leader(self.observe_only_after);
        let was = self.observe_only.swap(observe_only, Ordering::SeqCst);
        if observe_only != was {
            if observe_only {
                warn!(node = %self.node_id, "Leader lost, entering observe-only mode");
            } else {
                info!(node = %self.node_id, leader = ?self.consensus.leader_id(), "Leader available, execution enabled");
            }
        }
        observe_only
    }

    /// Reserve `target` for one outstanding remediation from this node.
    fn claim(&self, target: &str, claim: Uuid, kind: PendingKind) -> bool {
        let fresh = PendingRemediation {
            claim,
            kind,
            since: Instant::now(),
        };
        match self.pending.entry(target.to_string()) {
            Entry::Occupied(mut held) => {
                let stale = held.get().kind == PendingKind::Commit && held.get().since.elapsed() > self.commit_wait;
                if stale {
                    debug!(target = %target, "Dropping stale commit claim");
                    held.insert(fresh);
                }
                stale
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
        }
    }

    fn release_claim(&self, target: &str, claim: Uuid) {
        self.pending.remove_if(target, |_, p| p.claim == claim);
    }

    async fn commit(&self, action: RecoveryAction) -> CycleOutcome {
        let (action_id, target) = (action.id, action.target_node.clone());
        if !self.claim(&target, action_id, PendingKind::Commit) {
            return CycleOutcome::RemediationPending { target };
        }
        match self.consensus.propose(action).await {
            Ok(index) => {
                info!(action = %action_id, target = %target, index, "Recovery action proposed");
                CycleOutcome::Committed { action_id, index }
            }
            Err(e) => {
                self.release_claim(&target, action_id);
                match &e {
                    ConsensusError::TargetPending(_) => {
                        debug!(target = %target, "Leader already has an action open for target")
                    }
                    _ => warn!(action = %action_id, target = %target, error = %e, "Could not propose recovery action"),
                }
                CycleOutcome::Deferred { reason: e.to_string() }
            }
        }
    }

    /// Draft a proposal and replicate it. Every node inserts it when the entry
    /// applies; this node also watches it and commits the action if it passes.
    async fn open_proposal(
        &self,
        kind: ProposalKind,
        expiry: Duration,
        event: &AnomalyEvent,
        issue: IssueKind,
        action_type: ActionType,
    ) -> CycleOutcome {
        let target = event.node_id.clone();
        let Some(runtime) = self.me.upgrade() else {
            return CycleOutcome::Deferred {
                reason: "runtime shutting down".into(),
            };
        };
        let claim = Uuid::new_v4();
        if !self.claim(&target, claim, PendingKind::Proposal) {
            return CycleOutcome::RemediationPending { target };
        }

        let gov = &self.config.governance;
        let title = format!("{action_type} on {target}");
        let description = format!(
            "{issue} detected by {} (score {:.2}, confidence {:.2})",
            event.detector, event.score, event.confidence
        );
        let draft = match self.governance.draft_proposal(
            kind,
            &title,
            &description,
            expiry,
            gov.quorum_fraction,
            gov.pass_threshold,
        ) {
            Ok(draft) => draft,
            Err(e) => {
                self.release_claim(&target, claim);
                warn!(target = %target, error = %e, "Could not open proposal");
                return CycleOutcome::Deferred { reason: e.to_string() };
            }
        };
        let proposal_id = draft.id;
        if let Err(e) = self.consensus.propose_governance(GovernanceOp::Open(draft)).await {
            self.release_claim(&target, claim);
            warn!(proposal = %proposal_id, target = %target, error = %e, "Could not replicate proposal");
            return CycleOutcome::Deferred { reason: e.to_string() };
        }

        tokio::spawn(runtime.watch_proposal(proposal_id, claim, target, issue, action_type));
        CycleOutcome::ProposalOpened { proposal_id }
    }

    /// Cast a ballot on any node. It is checked against the local replica of
    /// the ledger, then replicated; returns the log index of the ballot.
    pub async fn cast_vote(&self, proposal_id: Uuid, voter_id: &str, choice: VoteChoice, tokens: u64) -> Result<u64> {
        self.governance.check_ballot(proposal_id, voter_id, tokens)?;
        let index = self
            .consensus
            .propose_governance(GovernanceOp::vote(proposal_id, voter_id, choice, tokens))
            .await
            .with_context(|| format!("replicating vote by {voter_id} on {proposal_id}"))?;
        debug!(proposal = %proposal_id, voter = %voter_id, %choice, index, "Vote submitted");
        Ok(index)
    }

    /// Wait for a proposal to resolve and commit its action if it passed.
    async fn watch_proposal(
        self: Arc<Self>,
        proposal_id: Uuid,
        claim: Uuid,
        target: NodeId,
        issue: IssueKind,
        action_type: ActionType,
    ) {
        let present = tokio::select! {
            _ = self.cancel.cancelled() => false,
            present = self.governance.await_present(proposal_id, self.commit_wait) => present,
        };
        if !present {
            if !self.cancel.is_cancelled() {
                warn!(proposal = %proposal_id, target = %target, "Proposal never applied, giving up on it");
            }
            self.release_claim(&target, claim);
            return;
        }
        let resolved = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.release_claim(&target, claim);
                return;
            }
            resolved = self.governance.await_resolution(proposal_id) => resolved,
        };
        self.release_claim(&target, claim);

        let proposal = match resolved {
            Ok(p) => p,
            Err(e) => {
                warn!(proposal = %proposal_id, error = %e, "Lost track of proposal");
                return;
            }
        };
        if let Err(reason) = proposal.outcome() {
            info!(proposal = %proposal_id, target = %target, %reason, "Proposal did not pass, no action taken");
            return;
        }
        let action = RecoveryAction::new(action_type, &target, issue, ActionOrigin::Proposal(proposal_id));
        let outcome = self.commit(action).await;
        debug!(proposal = %proposal_id, ?outcome, "Passed proposal handed to consensus");
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Drive election and replication timers.
    pub async fn run_consensus(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.consensus.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.consensus.tick().await,
            }
        }
        if let Err(e) = self.consensus.save_state() {
            warn!(node = %self.node_id, error = %e, "Final consensus save failed");
        }
        Ok(())
    }

    /// Hand committed actions assigned to this node to the executor, and
    /// committed governance ops to the ledger.
    pub async fn run_applier(self: Arc<Self>) -> Result<()> {
        let mut committed = self
            .consensus
            .take_applied_receiver()
            .context("committed-entry stream already taken")?;
        loop {
            let entry = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = committed.recv() => match next {
                    Some(entry) => entry,
                    None => break,
                },
            };
            self.apply(entry);
        }
        Ok(())
    }

    fn apply(&self, entry: CommittedEntry) {
        match entry.payload {
            EntryPayload::Action(action) => self.apply_action(entry.index, entry.term, action),
            EntryPayload::Governance(op) => self.apply_governance(entry.index, op),
            EntryPayload::Noop => {}
        }
    }

    fn apply_governance(&self, index: u64, op: GovernanceOp) {
        match self.governance.apply(&op) {
            Ok(Some(receipt)) => debug!(
                proposal = %op.proposal_id(),
                index,
                status = %receipt.status,
                "Replicated vote applied"
            ),
            Ok(None) => {
                if let GovernanceOp::Open(proposal) = &op {
                    if proposal.kind == ProposalKind::Emergency {
                        self.vote_for_emergency(proposal.id);
                    }
                }
            }
            // every replica rejects the same ballot the same way
            Err(e) => debug!(proposal = %op.proposal_id(), index, error = %e, "Replicated governance op not applied"),
        }
    }

    /// Each member backs an emergency proposal with its own stake, unless it
    /// has no live leader to replicate through.
    fn vote_for_emergency(&self, proposal_id: Uuid) {
        let tokens = self.config.governance.node_tokens;
        if tokens == 0 || !self.consensus.has_live_leader(self.observe_only_after) {
            return;
        }
        let Some(runtime) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = runtime.cast_vote(proposal_id, &runtime.node_id, VoteChoice::Yes, tokens).await {
                warn!(proposal = %proposal_id, error = %e, "Own vote on emergency proposal not recorded");
            }
        });
    }

    fn apply_action(&self, index: u64, term: u64, action: RecoveryAction) {
        self.release_claim(&action.target_node, action.id);

        if action.assigned_executor.as_deref() != Some(self.node_id.as_str()) {
            debug!(action = %action.id, executor = ?action.assigned_executor, "Committed action runs elsewhere");
            return;
        }
        if let Err(e) = self.consensus.ensure_leader_for(term) {
            warn!(action = %action.id, index, error = %e, "Leadership changed since commit, not executing");
            return;
        }

        let executor = Arc::clone(&self.executor);
        let consensus = Arc::clone(&self.consensus);
        tokio::spawn(async move {
            let (action_id, target) = (action.id, action.target_node.clone());
            match executor.execute(action).await {
                Ok(done) => info!(
                    action = %action_id,
                    target = %target,
                    attempts = done.attempt_count,
                    recovery_secs = done.recovery_secs().unwrap_or(0.0),
                    "Recovery action succeeded"
                ),
                Err(ExecutionError::AlreadyExecuted(_)) => {
                    debug!(action = %action_id, "Action already executed")
                }
                Err(e) => warn!(action = %action_id, target = %target, error = %e, "Recovery action not completed"),
            }
            consensus.release_target(&target, action_id);
        });
    }

    /// Run control cycles until cancelled, or until `max_cycles` have run.
    /// A cycle over its budget is aborted; errors never end the loop.
    pub async fn run_cycles(self: Arc<Self>, max_cycles: Option<u64>) -> Result<()> {
        let budget = Duration::from_millis(self.config.cycle.budget_ms);
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.cycle.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ran = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match tokio::time::timeout(budget, self.run_cycle()).await {
                Ok(Ok(outcome)) => debug!(node = %self.node_id, cycle = ran, ?outcome, "Cycle complete"),
                Ok(Err(e)) => warn!(node = %self.node_id, error = %e, "Control cycle failed"),
                Err(_) => warn!(node = %self.node_id, budget_ms = budget.as_millis() as u64, "Control cycle over budget, aborted"),
            }
            ran += 1;
            if max_cycles.is_some_and(|max| ran >= max) {
                info!(node = %self.node_id, cycles = ran, "Cycle limit reached");
                break;
            }
        }
        Ok(())
    }

    pub fn maintainer(&self) -> Maintainer {
        Maintainer::standard(
            Arc::clone(&self.knowledge),
            Arc::clone(&self.governance),
            &self.config.knowledge,
            &self.config.governance,
        )
    }

    /// Spawn all four services into `tasks`.
    pub fn start(self: &Arc<Self>, tasks: &mut JoinSet<Result<Service>>, max_cycles: Option<u64>) {
        let rt = Arc::clone(self);
        tasks.spawn(async move { rt.run_consensus().await.map(|()| Service::Consensus) });
        let rt = Arc::clone(self);
        tasks.spawn(async move { rt.run_applier().await.map(|()| Service::Applier) });
        let rt = Arc::clone(self);
        tasks.spawn(async move { rt.run_cycles(max_cycles).await.map(|()| Service::ControlCycle) });
        let maintainer = self.maintainer();
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            maintainer.run(cancel).await;
            Ok(Service::Maintenance)
        });
    }

    /// Stop every service and persist consensus state.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = self.consensus.save_state() {
            warn!(node = %self.node_id, error = %e, "Consensus save on shutdown failed");
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let consensus = self.consensus.status();
        StatusSnapshot {
            node_id: self.node_id.clone(),
            role: consensus.role,
            term: consensus.term,
            leader_id: consensus.leader_id,
            commit_index: consensus.commit_index,
            last_cycle_at: self.last_cycle_at.lock().ok().and_then(|at| *at),
            cycles_completed: self.cycles.load(Ordering::Relaxed),
            observe_only: self.is_observe_only(),
            breakers: self.executor.breaker_states(),
            proposals: self.governance.summaries(),
            executor_success_rate: self.executor.success_rate(),
            actions_in_flight: self.executor.in_flight(),
            knowledge: self.knowledge.stats(),
        }
    }
}
