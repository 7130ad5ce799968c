// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Agent Aggregate
//!
//! An [`Agent`] is created by spawn, mutated by attach/execute/snapshot/recover
//! and archived by terminate. The lifecycle manager is its sole mutator; the
//! transition methods here only enforce which status changes are legal.
//!
//! ```text
//! spawn ──▶ Active ◀──▶ Paused
//!             │            │
//!             └─terminate──┴──▶ Archived (terminal)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agreement::AgreementRef;
use crate::domain::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle the execution kernel returned for a spawned or recovered agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelHandle(pub String);

impl KernelHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Kernel-side snapshot reference, paired with our own [`SnapshotId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelSnapshotRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Paused,
    Archived,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Resource and policy constraints an agent is spawned with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// Intents this agent may execute. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_intents: Vec<String>,

    /// Agreement checked on every execution that does not name its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_ref: Option<AgreementRef>,
}

impl AgentConstraints {
    pub fn permits_intent(&self, intent: &str) -> bool {
        self.allowed_intents.is_empty() || self.allowed_intents.iter().any(|i| i == intent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub status: AgentStatus,
    pub plugin_ids: Vec<PluginId>,
    /// Owner of the memory forest this agent reads and writes.
    pub memory_ref: AgentId,
    pub kernel_handle: KernelHandle,
    pub constraints: AgentConstraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered_from: Option<SnapshotId>,
    pub execution_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        kernel_handle: KernelHandle,
        constraints: AgentConstraints,
        now: DateTime<Utc>,
    ) -> Self {
        let id = AgentId::new();
        Self {
            id,
            status: AgentStatus::Active,
            plugin_ids: Vec::new(),
            memory_ref: id,
            kernel_handle,
            constraints,
            recovered_from: None,
            execution_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// New identity seeded from a snapshot. Never reuses the snapshotted id.
    pub fn recovered(
        kernel_handle: KernelHandle,
        snapshot: &AgentSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        let mut agent = Self::new(kernel_handle, snapshot.constraints.clone(), now);
        agent.plugin_ids = snapshot.plugin_ids.clone();
        agent.memory_ref = snapshot.memory_ref;
        agent.recovered_from = Some(snapshot.id);
        agent
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::InvalidState(format!(
                "agent {} is {}, expected active",
                self.id, self.status
            )))
        }
    }

    pub fn ensure_not_archived(&self) -> CoreResult<()> {
        if self.status == AgentStatus::Archived {
            Err(CoreError::InvalidState(format!("agent {} is archived", self.id)))
        } else {
            Ok(())
        }
    }

    /// Returns `false` if the plugin was already attached.
    pub fn attach_plugin(&mut self, plugin_id: PluginId, now: DateTime<Utc>) -> CoreResult<bool> {
        self.ensure_not_archived()?;
        if self.plugin_ids.contains(&plugin_id) {
            return Ok(false);
        }
        self.plugin_ids.push(plugin_id);
        self.updated_at = now;
        Ok(true)
    }

    pub fn record_execution(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.ensure_active()?;
        self.execution_count += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.ensure_active()?;
        self.status = AgentStatus::Paused;
        self.updated_at = now;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != AgentStatus::Paused {
            return Err(CoreError::InvalidState(format!(
                "agent {} is {}, expected paused",
                self.id, self.status
            )));
        }
        self.status = AgentStatus::Active;
        self.updated_at = now;
        Ok(())
    }

    /// Returns `false` when the agent was already archived.
    pub fn archive(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == AgentStatus::Archived {
            return false;
        }
        self.status = AgentStatus::Archived;
        self.updated_at = now;
        true
    }
}

/// Everything `recover` needs to seed a new agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: SnapshotId,
    pub agent_id: AgentId,
    pub kernel_snapshot: KernelSnapshotRef,
    pub plugin_ids: Vec<PluginId>,
    pub memory_ref: AgentId,
    pub constraints: AgentConstraints,
    pub taken_at: DateTime<Utc>,
}

/// Result of a successful `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub result: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new(KernelHandle::new("k-1"), AgentConstraints::default(), Utc::now())
    }

    #[test]
    fn test_new_agent_is_active_and_owns_its_memory() {
        let agent = agent();
        assert!(agent.is_active());
        assert_eq!(agent.memory_ref, agent.id);
    }

    #[test]
    fn test_archived_agent_rejects_execution_and_attach() {
        let mut agent = agent();
        assert!(agent.archive(Utc::now()));
        assert!(!agent.archive(Utc::now()));
        assert!(matches!(agent.record_execution(Utc::now()), Err(CoreError::InvalidState(_))));
        assert!(matches!(
            agent.attach_plugin(PluginId::new("p"), Utc::now()),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut agent = agent();
        let paused_at = agent.created_at + chrono::Duration::seconds(5);
        agent.pause(paused_at).unwrap();
        assert_eq!(agent.updated_at, paused_at);
        assert!(agent.ensure_active().is_err());
        assert!(agent.pause(paused_at).is_err());
        agent.resume(paused_at).unwrap();
        assert!(agent.is_active());
        assert!(agent.resume(paused_at).is_err());
    }

    #[test]
    fn test_attach_plugin_is_deduplicated() {
        let mut agent = agent();
        assert!(agent.attach_plugin(PluginId::new("search"), Utc::now()).unwrap());
        assert!(!agent.attach_plugin(PluginId::new("search"), Utc::now()).unwrap());
        assert_eq!(agent.plugin_ids.len(), 1);
    }

    #[test]
    fn test_recovered_agent_gets_fresh_identity() {
        let mut original = agent();
        original.attach_plugin(PluginId::new("search"), Utc::now()).unwrap();
        let snapshot = AgentSnapshot {
            id: SnapshotId::new(),
            agent_id: original.id,
            kernel_snapshot: KernelSnapshotRef("ks-1".to_string()),
            plugin_ids: original.plugin_ids.clone(),
            memory_ref: original.memory_ref,
            constraints: original.constraints.clone(),
            taken_at: Utc::now(),
        };
        let recovered = Agent::recovered(KernelHandle::new("k-2"), &snapshot, Utc::now());
        assert_ne!(recovered.id, original.id);
        assert_eq!(recovered.memory_ref, original.id);
        assert_eq!(recovered.plugin_ids, original.plugin_ids);
        assert_eq!(recovered.recovered_from, Some(snapshot.id));
    }

    #[test]
    fn test_constraints_permit_intent() {
        let open = AgentConstraints::default();
        assert!(open.permits_intent("anything"));
        let closed = AgentConstraints {
            allowed_intents: vec!["summarize".to_string()],
            ..Default::default()
        };
        assert!(closed.permits_intent("summarize"));
        assert!(!closed.permits_intent("delete"));
    }
}
