// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent Lifecycle Application Service
//!
//! Sole mutator of [`Agent`] aggregates. Every operation follows the same
//! shape:
//!
//! 1. read and validate the agent (short map access, no lock kept)
//! 2. call the kernel, sandbox or policy authority with no lock held
//! 3. re-validate and apply the mutation
//! 4. publish the matching `agent.*` event
//!
//! A failure in steps 1-3 leaves the agent untouched and publishes nothing.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::deadline::within_deadline;
use crate::domain::agent::{
    Agent, AgentConstraints, AgentId, AgentSnapshot, ExecutionId, ExecutionOutcome, PluginId,
    SnapshotId,
};
use crate::domain::agreement::{AgreementRef, PolicyAuthority};
use crate::domain::clock::Clock;
use crate::domain::error::{CoreError, CoreResult, ResourceKind};
use crate::domain::events::{Event, EventType};
use crate::domain::hashing::ContentHash;
use crate::domain::kernel::{ExecutionKernel, KernelError, PluginCapabilities, PluginSandbox};
use crate::infrastructure::event_bus::EventBus;

const SOURCE: &str = "lifecycle";

/// Parameters of one `execute` call.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub intent: String,
    pub params: serde_json::Value,
    /// Overrides the agent's constraint-level agreement.
    pub agreement_ref: Option<AgreementRef>,
    pub deadline: Option<Instant>,
}

impl ExecuteRequest {
    pub fn new(intent: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            intent: intent.into(),
            params,
            agreement_ref: None,
            deadline: None,
        }
    }

    pub fn with_agreement(mut self, agreement_ref: AgreementRef) -> Self {
        self.agreement_ref = Some(agreement_ref);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Policy action name checked for an execution of `intent`.
pub fn execute_action(intent: &str) -> String {
    format!("agent.execute:{intent}")
}

pub struct AgentLifecycleManager {
    agents: DashMap<AgentId, Agent>,
    snapshots: DashMap<SnapshotId, AgentSnapshot>,
    kernel: Arc<dyn ExecutionKernel>,
    sandbox: Arc<dyn PluginSandbox>,
    policy: Arc<dyn PolicyAuthority>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl AgentLifecycleManager {
    pub fn new(
        kernel: Arc<dyn ExecutionKernel>,
        sandbox: Arc<dyn PluginSandbox>,
        policy: Arc<dyn PolicyAuthority>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents: DashMap::new(),
            snapshots: DashMap::new(),
            kernel,
            sandbox,
            policy,
            event_bus,
            clock,
        }
    }

    pub fn get(&self, agent_id: &AgentId) -> CoreResult<Agent> {
        self.agents
            .get(agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| CoreError::not_found(ResourceKind::Agent, agent_id))
    }

    pub fn list(&self) -> Vec<Agent> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    pub fn get_snapshot(&self, snapshot_id: &SnapshotId) -> CoreResult<AgentSnapshot> {
        self.snapshots
            .get(snapshot_id)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::not_found(ResourceKind::Snapshot, snapshot_id))
    }

    /// Applies `mutate` to the stored agent under its map entry lock.
    fn update<T>(
        &self,
        agent_id: &AgentId,
        mutate: impl FnOnce(&mut Agent) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::not_found(ResourceKind::Agent, agent_id))?;
        mutate(&mut agent)
    }

    fn publish(&self, event_type: EventType, agent_id: &AgentId, payload: serde_json::Value) {
        self.event_bus.publish(Event::new(
            event_type,
            SOURCE,
            Some(agent_id.to_string()),
            payload,
        ));
    }

    pub async fn spawn(&self, constraints: AgentConstraints) -> CoreResult<AgentId> {
        let handle = self.kernel.spawn(&constraints).await?;
        let agent = Agent::new(handle, constraints, self.clock.now());
        let agent_id = agent.id;
        let payload = json!({
            "agent_id": agent_id,
            "kernel_handle": agent.kernel_handle,
            "constraints": agent.constraints,
        });
        self.agents.insert(agent_id, agent);

        info!(agent_id = %agent_id, "Agent spawned");
        metrics::counter!("covenant_agents_spawned_total").increment(1);
        self.publish(EventType::AgentSpawned, &agent_id, payload);
        Ok(agent_id)
    }

    /// Attaches a plugin through the sandbox. Attaching an already attached
    /// plugin succeeds without publishing a second event.
    pub async fn attach(
        &self,
        agent_id: &AgentId,
        plugin_id: PluginId,
    ) -> CoreResult<PluginCapabilities> {
        let agent = self.get(agent_id)?;
        agent.ensure_not_archived()?;

        let capabilities = self.sandbox.attach(&agent.kernel_handle, &plugin_id).await?;

        let now = self.clock.now();
        let newly_attached =
            self.update(agent_id, |a| a.attach_plugin(plugin_id.clone(), now))?;
        if newly_attached {
            debug!(agent_id = %agent_id, plugin_id = %plugin_id, "Plugin attached");
            self.publish(
                EventType::AgentPluginAttached,
                agent_id,
                json!({
                    "agent_id": agent_id,
                    "plugin_id": plugin_id,
                    "capabilities": capabilities,
                }),
            );
        }
        Ok(capabilities)
    }

    /// Runs an intent on an active agent. The agreement check (explicit or
    /// from the agent's constraints) and the kernel call both run under the
    /// request deadline; nothing is recorded unless both succeed in time.
    pub async fn execute(
        &self,
        agent_id: &AgentId,
        request: ExecuteRequest,
    ) -> CoreResult<ExecutionOutcome> {
        let agent = self.get(agent_id)?;
        agent.ensure_active()?;
        if !agent.constraints.permits_intent(&request.intent) {
            return Err(CoreError::ConstraintViolation(format!(
                "intent '{}' is not allowed for agent {}",
                request.intent, agent_id
            )));
        }
        let agreement = request
            .agreement_ref
            .clone()
            .or_else(|| agent.constraints.agreement_ref.clone());

        let result = within_deadline(request.deadline, "execute", async {
            if let Some(agreement_ref) = &agreement {
                let decision = self
                    .policy
                    .check_compliance(agreement_ref, &execute_action(&request.intent))
                    .await?;
                if !decision.compliant {
                    return Err(CoreError::ConstraintViolation(decision.reason));
                }
            }
            let result = self
                .kernel
                .execute(&agent.kernel_handle, &request.intent, &request.params)
                .await?;
            Ok::<_, CoreError>(result)
        })
        .await?;

        let now = self.clock.now();
        self.update(agent_id, |a| a.record_execution(now))?;

        let outcome = ExecutionOutcome {
            execution_id: ExecutionId::new(),
            agent_id: *agent_id,
            result,
        };
        debug!(agent_id = %agent_id, execution_id = %outcome.execution_id, intent = %request.intent, "Intent executed");
        metrics::counter!("covenant_agent_executions_total").increment(1);
        self.publish(
            EventType::AgentExecuted,
            agent_id,
            json!({
                "agent_id": agent_id,
                "execution_id": outcome.execution_id,
                "intent": request.intent,
                "agreement_ref": agreement,
                "result_hash": ContentHash::of_json(&outcome.result),
            }),
        );
        Ok(outcome)
    }

    pub async fn snapshot(&self, agent_id: &AgentId) -> CoreResult<SnapshotId> {
        let agent = self.get(agent_id)?;
        agent.ensure_not_archived()?;

        let kernel_snapshot = self.kernel.snapshot(&agent.kernel_handle).await?;

        // Re-read so the snapshot reflects plugins attached meanwhile.
        let current = self.get(agent_id)?;
        current.ensure_not_archived()?;
        let snapshot = AgentSnapshot {
            id: SnapshotId::new(),
            agent_id: *agent_id,
            kernel_snapshot,
            plugin_ids: current.plugin_ids,
            memory_ref: current.memory_ref,
            constraints: current.constraints,
            taken_at: self.clock.now(),
        };
        let snapshot_id = snapshot.id;
        self.snapshots.insert(snapshot_id, snapshot);

        info!(agent_id = %agent_id, snapshot_id = %snapshot_id, "Agent snapshotted");
        self.publish(
            EventType::AgentSnapshotted,
            agent_id,
            json!({ "agent_id": agent_id, "snapshot_id": snapshot_id }),
        );
        Ok(snapshot_id)
    }

    /// Creates a new agent identity from a snapshot. The original agent is
    /// left as it is; the new one shares its memory forest.
    pub async fn recover(&self, snapshot_id: &SnapshotId) -> CoreResult<AgentId> {
        let snapshot = self.get_snapshot(snapshot_id)?;
        let handle = self.kernel.recover(&snapshot.kernel_snapshot).await?;
        let agent = Agent::recovered(handle, &snapshot, self.clock.now());
        let agent_id = agent.id;
        self.agents.insert(agent_id, agent);

        info!(
            agent_id = %agent_id,
            snapshot_id = %snapshot_id,
            original_agent_id = %snapshot.agent_id,
            "Agent recovered"
        );
        self.publish(
            EventType::AgentRecovered,
            &agent_id,
            json!({
                "agent_id": agent_id,
                "snapshot_id": snapshot_id,
                "original_agent_id": snapshot.agent_id,
                "memory_ref": snapshot.memory_ref,
            }),
        );
        Ok(agent_id)
    }

    /// Archives the agent after terminating its kernel instance. Terminating
    /// an archived agent succeeds without publishing anything.
    pub async fn terminate(&self, agent_id: &AgentId) -> CoreResult<()> {
        let agent = self.get(agent_id)?;
        if agent.ensure_not_archived().is_err() {
            debug!(agent_id = %agent_id, "Agent already archived");
            return Ok(());
        }

        match self.kernel.terminate(&agent.kernel_handle).await {
            Ok(()) => {}
            Err(KernelError::HandleNotFound(handle)) => {
                warn!(agent_id = %agent_id, handle = %handle, "Kernel instance already gone");
            }
            Err(e) => return Err(e.into()),
        }

        let now = self.clock.now();
        let archived = self.update(agent_id, |a| Ok(a.archive(now)))?;
        if archived {
            info!(agent_id = %agent_id, "Agent terminated");
            self.publish(
                EventType::AgentTerminated,
                agent_id,
                json!({ "agent_id": agent_id }),
            );
        }
        Ok(())
    }

    pub fn pause(&self, agent_id: &AgentId) -> CoreResult<()> {
        let now = self.clock.now();
        self.update(agent_id, |a| a.pause(now))?;
        info!(agent_id = %agent_id, "Agent paused");
        self.publish(EventType::AgentPaused, agent_id, json!({ "agent_id": agent_id }));
        Ok(())
    }

    pub fn resume(&self, agent_id: &AgentId) -> CoreResult<()> {
        let now = self.clock.now();
        self.update(agent_id, |a| a.resume(now))?;
        info!(agent_id = %agent_id, "Agent resumed");
        self.publish(EventType::AgentResumed, agent_id, json!({ "agent_id": agent_id }));
        Ok(())
    }
}
