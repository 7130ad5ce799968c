// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Domain Events
//!
//! Every component communicates through immutable [`Event`]s published on the
//! event bus. Event types are drawn from a closed taxonomy with dotted wire
//! names (`agent.*`, `consensus.*`, `memory.*`, `audit.*`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    #[serde(rename = "agent.plugin.attached")]
    AgentPluginAttached,
    #[serde(rename = "agent.executed")]
    AgentExecuted,
    #[serde(rename = "agent.snapshotted")]
    AgentSnapshotted,
    #[serde(rename = "agent.recovered")]
    AgentRecovered,
    #[serde(rename = "agent.terminated")]
    AgentTerminated,
    #[serde(rename = "agent.paused")]
    AgentPaused,
    #[serde(rename = "agent.resumed")]
    AgentResumed,
    #[serde(rename = "consensus.proposed")]
    ConsensusProposed,
    #[serde(rename = "consensus.voted")]
    ConsensusVoted,
    #[serde(rename = "consensus.committed")]
    ConsensusCommitted,
    #[serde(rename = "consensus.rejected")]
    ConsensusRejected,
    #[serde(rename = "consensus.expired")]
    ConsensusExpired,
    #[serde(rename = "memory.inserted")]
    MemoryInserted,
    #[serde(rename = "memory.compacted")]
    MemoryCompacted,
    #[serde(rename = "audit.integrity_violation")]
    AuditIntegrityViolation,
}

impl EventType {
    pub const ALL: [EventType; 16] = [
        EventType::AgentSpawned,
        EventType::AgentPluginAttached,
        EventType::AgentExecuted,
        EventType::AgentSnapshotted,
        EventType::AgentRecovered,
        EventType::AgentTerminated,
        EventType::AgentPaused,
        EventType::AgentResumed,
        EventType::ConsensusProposed,
        EventType::ConsensusVoted,
        EventType::ConsensusCommitted,
        EventType::ConsensusRejected,
        EventType::ConsensusExpired,
        EventType::MemoryInserted,
        EventType::MemoryCompacted,
        EventType::AuditIntegrityViolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentSpawned => "agent.spawned",
            EventType::AgentPluginAttached => "agent.plugin.attached",
            EventType::AgentExecuted => "agent.executed",
            EventType::AgentSnapshotted => "agent.snapshotted",
            EventType::AgentRecovered => "agent.recovered",
            EventType::AgentTerminated => "agent.terminated",
            EventType::AgentPaused => "agent.paused",
            EventType::AgentResumed => "agent.resumed",
            EventType::ConsensusProposed => "consensus.proposed",
            EventType::ConsensusVoted => "consensus.voted",
            EventType::ConsensusCommitted => "consensus.committed",
            EventType::ConsensusRejected => "consensus.rejected",
            EventType::ConsensusExpired => "consensus.expired",
            EventType::MemoryInserted => "memory.inserted",
            EventType::MemoryCompacted => "memory.compacted",
            EventType::AuditIntegrityViolation => "audit.integrity_violation",
        }
    }

    /// Parses a dotted wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable once published; subscribers receive it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Publishing component, e.g. `lifecycle` or `consensus`.
    pub source: String,
    /// Entity the event is about (agent, proposal, node id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        target: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            source: source.into(),
            target,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Only(EventType),
    All,
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::Only(t) => *t == event_type,
            EventFilter::All => true,
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(event_type: EventType) -> Self {
        EventFilter::Only(event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_serde() {
        for t in EventType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_filter_matching() {
        assert!(EventFilter::All.matches(EventType::MemoryInserted));
        assert!(EventFilter::from(EventType::AgentSpawned).matches(EventType::AgentSpawned));
        assert!(!EventFilter::from(EventType::AgentSpawned).matches(EventType::AgentExecuted));
    }
}
