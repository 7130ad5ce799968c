// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Core facade.
//!
//! [`CovenantCore`] wires the five components onto one event bus and exposes
//! the transport-agnostic operations an HTTP or CLI adapter would map onto.
//! Collaborators default to the in-process adapters; any of them can be
//! swapped through [`CovenantCoreBuilder`].
//!
//! The audit engine is subscribed while building, so building requires a
//! running Tokio runtime. Every event published afterwards lands in the
//! trace chain.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::audit::AuditTraceEngine;
use crate::application::consensus::{CastVote, ConsensusEngine, ConsensusReaper, ProposeRequest};
use crate::application::lifecycle::{AgentLifecycleManager, ExecuteRequest};
use crate::application::memory_trace::MemoryTraceStore;
use crate::domain::agent::{
    Agent, AgentConstraints, AgentId, AgentSnapshot, ExecutionOutcome, PluginId, SnapshotId,
};
use crate::domain::agreement::{AgreementRef, PolicyAuthority};
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::config::{CoreConfigManifest, TraceStoreConfig};
use crate::domain::consensus::{
    Commitment, CommitmentId, CommitmentVerification, ConsensusProposal, ProposalId, Tally,
};
use crate::domain::error::CoreResult;
use crate::domain::events::EventFilter;
use crate::domain::hashing::ContentHash;
use crate::domain::kernel::{ExecutionKernel, PluginCapabilities, PluginSandbox};
use crate::domain::memory::{CompactionReport, MemoryNode, NewMemoryNode, NodeId, PathVerification};
use crate::domain::proof::ProofSystem;
use crate::domain::trace::{Checkpoint, TimeRange, TraceEntry, TraceId, TraceStore, TraceVerification};
use crate::infrastructure::event_bus::{EventBus, SubscriptionId};
use crate::infrastructure::kernel::{InMemoryKernel, InMemoryPluginSandbox};
use crate::infrastructure::policy::AgreementRegistry;
use crate::infrastructure::proof::Ed25519ProofSystem;
use crate::infrastructure::trace_store::{InMemoryTraceStore, SledTraceStore};

pub struct CovenantCoreBuilder {
    config: CoreConfigManifest,
    kernel: Option<Arc<dyn ExecutionKernel>>,
    sandbox: Option<Arc<dyn PluginSandbox>>,
    policy: Option<Arc<dyn PolicyAuthority>>,
    proof_system: Option<Arc<dyn ProofSystem>>,
    trace_store: Option<Arc<dyn TraceStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CovenantCoreBuilder {
    pub fn new(config: CoreConfigManifest) -> Self {
        Self {
            config,
            kernel: None,
            sandbox: None,
            policy: None,
            proof_system: None,
            trace_store: None,
            clock: None,
        }
    }

    pub fn kernel(mut self, kernel: Arc<dyn ExecutionKernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn PluginSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyAuthority>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn proof_system(mut self, proof_system: Arc<dyn ProofSystem>) -> Self {
        self.proof_system = Some(proof_system);
        self
    }

    /// Overrides `spec.audit.store`.
    pub fn trace_store(mut self, trace_store: Arc<dyn TraceStore>) -> Self {
        self.trace_store = Some(trace_store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> anyhow::Result<CovenantCore> {
        self.config
            .validate()
            .context("Configuration validation failed")?;
        let spec = &self.config.spec;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let kernel = self
            .kernel
            .unwrap_or_else(|| Arc::new(InMemoryKernel::new()));
        let sandbox = self
            .sandbox
            .unwrap_or_else(|| Arc::new(InMemoryPluginSandbox::new()));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(AgreementRegistry::with_clock(clock.clone())));
        let proof_system = self
            .proof_system
            .unwrap_or_else(|| Arc::new(Ed25519ProofSystem::generate()));
        let trace_store: Arc<dyn TraceStore> = match self.trace_store {
            Some(store) => store,
            None => match &spec.audit.store {
                TraceStoreConfig::Memory => Arc::new(InMemoryTraceStore::new()),
                TraceStoreConfig::Sled { path } => Arc::new(
                    SledTraceStore::open(path).with_context(|| {
                        format!("Failed to open trace store at {}", path.display())
                    })?,
                ),
            },
        };

        let event_bus = EventBus::new(spec.event_bus.observer_capacity);
        let audit = Arc::new(
            AuditTraceEngine::new(trace_store, event_bus.clone(), clock.clone(), &spec.audit)
                .context("Failed to open trace chain")?,
        );
        let audit_subscription = event_bus
            .subscribe(EventFilter::All, audit.clone())
            .context("Failed to subscribe audit engine")?;

        let lifecycle = Arc::new(AgentLifecycleManager::new(
            kernel,
            sandbox,
            policy.clone(),
            event_bus.clone(),
            clock.clone(),
        ));
        let memory = Arc::new(MemoryTraceStore::new(
            event_bus.clone(),
            clock.clone(),
            spec.memory.clone(),
        ));
        let consensus = Arc::new(ConsensusEngine::new(
            proof_system,
            policy,
            event_bus.clone(),
            clock,
            spec.consensus.clone(),
        ));

        info!(name = %self.config.metadata.name, "Covenant core initialized");
        Ok(CovenantCore {
            config: self.config,
            event_bus,
            lifecycle,
            memory,
            consensus,
            audit,
            audit_subscription,
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct CovenantCore {
    config: CoreConfigManifest,
    event_bus: EventBus,
    lifecycle: Arc<AgentLifecycleManager>,
    memory: Arc<MemoryTraceStore>,
    consensus: Arc<ConsensusEngine>,
    audit: Arc<AuditTraceEngine>,
    audit_subscription: SubscriptionId,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CovenantCore {
    pub fn builder(config: CoreConfigManifest) -> CovenantCoreBuilder {
        CovenantCoreBuilder::new(config)
    }

    /// Core with default configuration and in-process collaborators.
    pub fn in_memory() -> anyhow::Result<Self> {
        Self::builder(CoreConfigManifest::default()).build()
    }

    /// Launches background tasks (the consensus reaper, when enabled).
    pub fn start(&self) {
        let consensus = &self.config.spec.consensus;
        if !consensus.reaper_enabled {
            return;
        }
        let reaper = ConsensusReaper::new(
            self.consensus.clone(),
            consensus.reaper_interval,
            self.shutdown_token.child_token(),
        );
        self.tasks.lock().push(reaper.start());
    }

    /// Cancels background tasks and waits for them to stop.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Covenant core shut down");
    }

    pub fn config(&self) -> &CoreConfigManifest {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }

    pub fn memory(&self) -> &Arc<MemoryTraceStore> {
        &self.memory
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn audit(&self) -> &Arc<AuditTraceEngine> {
        &self.audit
    }

    // ---- Agents ----

    pub async fn spawn_agent(&self, constraints: AgentConstraints) -> CoreResult<AgentId> {
        self.lifecycle.spawn(constraints).await
    }

    pub async fn attach_plugin(
        &self,
        agent_id: &AgentId,
        plugin_id: PluginId,
    ) -> CoreResult<PluginCapabilities> {
        self.lifecycle.attach(agent_id, plugin_id).await
    }

    pub async fn execute_intent(
        &self,
        agent_id: &AgentId,
        request: ExecuteRequest,
    ) -> CoreResult<ExecutionOutcome> {
        self.lifecycle.execute(agent_id, request).await
    }

    pub async fn snapshot_agent(&self, agent_id: &AgentId) -> CoreResult<SnapshotId> {
        self.lifecycle.snapshot(agent_id).await
    }

    pub async fn recover_agent(&self, snapshot_id: &SnapshotId) -> CoreResult<AgentId> {
        self.lifecycle.recover(snapshot_id).await
    }

    pub async fn terminate_agent(&self, agent_id: &AgentId) -> CoreResult<()> {
        self.lifecycle.terminate(agent_id).await
    }

    pub fn pause_agent(&self, agent_id: &AgentId) -> CoreResult<()> {
        self.lifecycle.pause(agent_id)
    }

    pub fn resume_agent(&self, agent_id: &AgentId) -> CoreResult<()> {
        self.lifecycle.resume(agent_id)
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> CoreResult<Agent> {
        self.lifecycle.get(agent_id)
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.lifecycle.list()
    }

    pub fn get_snapshot(&self, snapshot_id: &SnapshotId) -> CoreResult<AgentSnapshot> {
        self.lifecycle.get_snapshot(snapshot_id)
    }

    // ---- Memory ----
    // Memory is keyed by the agent's memory reference, which a recovered
    // agent inherits from its snapshot.

    /// Archived agents keep their memory readable but accept no new nodes.
    pub fn insert_memory(&self, agent_id: &AgentId, node: NewMemoryNode) -> CoreResult<NodeId> {
        let agent = self.lifecycle.get(agent_id)?;
        agent.ensure_not_archived()?;
        self.memory.insert(agent.memory_ref, node)
    }

    pub fn query_memory(&self, agent_id: &AgentId, key_prefix: &str) -> CoreResult<Vec<MemoryNode>> {
        let agent = self.lifecycle.get(agent_id)?;
        Ok(self.memory.query(&agent.memory_ref, key_prefix))
    }

    pub fn get_memory_node(&self, node_id: &NodeId) -> CoreResult<MemoryNode> {
        self.memory.get(node_id)
    }

    pub fn verify_memory_path(&self, node_id: &NodeId) -> CoreResult<PathVerification> {
        self.memory.verify_path(node_id)
    }

    pub fn compact_memory(&self, agent_id: &AgentId) -> CoreResult<CompactionReport> {
        let agent = self.lifecycle.get(agent_id)?;
        if self.memory.len(&agent.memory_ref) == 0 {
            return Ok(CompactionReport {
                agent_id: agent.memory_ref,
                retained: 0,
                pruned: 0,
                horizon: None,
            });
        }
        self.memory.compact(&agent.memory_ref)
    }

    // ---- Consensus ----

    pub fn propose_consensus(&self, request: ProposeRequest) -> CoreResult<ProposalId> {
        self.lifecycle.get(&request.agent_id)?;
        self.consensus.propose(request)
    }

    pub fn cast_vote(&self, proposal_id: &ProposalId, vote: CastVote) -> CoreResult<Tally> {
        self.consensus.vote(proposal_id, vote)
    }

    pub async fn commit_consensus(
        &self,
        proposal_id: &ProposalId,
        agreement_ref: Option<AgreementRef>,
        deadline: Option<Instant>,
    ) -> CoreResult<Commitment> {
        self.consensus
            .commit(proposal_id, agreement_ref, deadline)
            .await
    }

    pub fn verify_commitment(&self, commitment_id: &CommitmentId) -> CoreResult<CommitmentVerification> {
        self.consensus.verify(commitment_id)
    }

    pub fn get_proposal(&self, proposal_id: &ProposalId) -> CoreResult<ConsensusProposal> {
        self.consensus.get(proposal_id)
    }

    // ---- Trace ----

    pub fn get_trace(&self, trace_id: TraceId) -> CoreResult<TraceEntry> {
        self.audit.get_trace(trace_id)
    }

    pub fn verify_trace(&self, trace_id: TraceId) -> CoreResult<TraceVerification> {
        self.audit.verify_trace(trace_id)
    }

    pub fn export_trace(&self, range: TimeRange) -> CoreResult<Vec<TraceEntry>> {
        self.audit.export(range)
    }

    pub fn replay_trace(&self, entries: &[TraceEntry]) -> CoreResult<ContentHash> {
        self.audit.replay(entries)
    }

    pub fn trace_head(&self) -> Checkpoint {
        self.audit.head()
    }

    /// Waits until the trace chain holds at least `count` entries.
    pub async fn wait_for_trace(&self, count: u64, deadline: Option<Instant>) -> CoreResult<()> {
        self.audit.wait_for(count, deadline).await
    }
}

impl Drop for CovenantCore {
    // The audit worker holds the engine, which holds the bus; dropping the
    // subscription lets the worker drain and release the trace store.
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        self.event_bus.unsubscribe(self.audit_subscription);
    }
}
