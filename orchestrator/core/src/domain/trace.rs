// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Trace Chain
//!
//! A single, global, append-only hash chain over every event the audit engine
//! has observed. Entry `n` stores `prev_hash = hash(n - 1)`; the first entry
//! links to [`ContentHash::genesis`]. Trace ids start at 1 and increase by one.
//!
//! The chain order is arrival order at the audit engine, not causal order of
//! the originating operations.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::error::{CoreError, CoreResult};
use crate::domain::events::EventType;
use crate::domain::hashing::ContentHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub u64);

impl TraceId {
    pub const FIRST: TraceId = TraceId(1);

    pub fn next(self) -> TraceId {
        TraceId(self.0 + 1)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub trace_id: TraceId,
    pub event_type: EventType,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub payload_hash: ContentHash,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
    pub timestamp: DateTime<Utc>,
}

impl TraceEntry {
    pub fn seal(
        trace_id: TraceId,
        event_type: EventType,
        source: String,
        target: Option<String>,
        payload_hash: ContentHash,
        prev_hash: ContentHash,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let hash = Self::compute_hash(
            trace_id,
            event_type,
            &source,
            target.as_deref(),
            &payload_hash,
            &prev_hash,
            timestamp,
        );
        Self {
            trace_id,
            event_type,
            source,
            target,
            payload_hash,
            prev_hash,
            hash,
            timestamp,
        }
    }

    pub fn compute_hash(
        trace_id: TraceId,
        event_type: EventType,
        source: &str,
        target: Option<&str>,
        payload_hash: &ContentHash,
        prev_hash: &ContentHash,
        timestamp: DateTime<Utc>,
    ) -> ContentHash {
        let ts = timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        ContentHash::of_fields(&[
            &trace_id.0.to_be_bytes(),
            event_type.as_str().as_bytes(),
            source.as_bytes(),
            target.unwrap_or("").as_bytes(),
            payload_hash.as_str().as_bytes(),
            prev_hash.as_str().as_bytes(),
            ts.as_bytes(),
        ])
    }

    pub fn recompute_hash(&self) -> ContentHash {
        Self::compute_hash(
            self.trace_id,
            self.event_type,
            &self.source,
            self.target.as_deref(),
            &self.payload_hash,
            &self.prev_hash,
            self.timestamp,
        )
    }
}

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// A verified `(trace_id, hash)` pair that later verifications may start from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub trace_id: TraceId,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceVerification {
    pub trace_id: TraceId,
    pub valid: bool,
    /// Trace id the recomputation started from (exclusive); 0 means genesis.
    pub anchored_at: u64,
    pub entries_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_divergence: Option<TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TraceVerification {
    pub fn into_result(self) -> CoreResult<Self> {
        if self.valid {
            return Ok(self);
        }
        Err(CoreError::IntegrityViolation {
            first_divergence: self
                .first_divergence
                .unwrap_or(self.trace_id)
                .to_string(),
            reason: self.reason.unwrap_or_default(),
        })
    }
}

/// Checks one entry against the hash it must link to.
/// Returns the reason for the first failed check.
pub fn check_link(entry: &TraceEntry, expected_id: TraceId, expected_prev: &ContentHash) -> Option<String> {
    if entry.trace_id != expected_id {
        return Some(format!(
            "expected trace id {}, found {}",
            expected_id, entry.trace_id
        ));
    }
    if &entry.prev_hash != expected_prev {
        return Some(format!(
            "prev_hash {} does not match predecessor hash {}",
            entry.prev_hash, expected_prev
        ));
    }
    let recomputed = entry.recompute_hash();
    if recomputed != entry.hash {
        return Some(format!(
            "stored hash {} does not match recomputed {}",
            entry.hash, recomputed
        ));
    }
    None
}

/// Replays an exported, contiguous segment of the chain on its own and
/// returns the reconstructed tail hash. A segment starting at trace id 1 must
/// link to genesis; later segments are anchored at their first `prev_hash`.
pub fn replay_chain(entries: &[TraceEntry]) -> CoreResult<ContentHash> {
    let Some(first) = entries.first() else {
        return Ok(ContentHash::genesis());
    };
    let mut expected_prev = if first.trace_id == TraceId::FIRST {
        ContentHash::genesis()
    } else {
        first.prev_hash.clone()
    };
    let mut expected_id = first.trace_id;
    for entry in entries {
        if let Some(reason) = check_link(entry, expected_id, &expected_prev) {
            return Err(CoreError::IntegrityViolation {
                first_divergence: expected_id.to_string(),
                reason,
            });
        }
        expected_prev = entry.hash.clone();
        expected_id = expected_id.next();
    }
    Ok(expected_prev)
}

#[derive(Debug, Error)]
pub enum TraceStoreError {
    #[error("Trace store I/O failure: {0}")]
    Io(String),
    #[error("Trace entry could not be decoded: {0}")]
    Codec(String),
    #[error("Out-of-order append: expected trace id {expected}, got {actual}")]
    OutOfOrder { expected: TraceId, actual: TraceId },
}

impl From<TraceStoreError> for CoreError {
    fn from(err: TraceStoreError) -> Self {
        CoreError::Storage(err.to_string())
    }
}

/// Append-only storage for the trace chain, keyed by monotonically
/// increasing trace id. The audit engine is its only writer.
pub trait TraceStore: Send + Sync {
    fn append(&self, entry: &TraceEntry) -> Result<(), TraceStoreError>;

    fn get(&self, trace_id: TraceId) -> Result<Option<TraceEntry>, TraceStoreError>;

    fn last(&self) -> Result<Option<TraceEntry>, TraceStoreError>;

    /// Entries with ids in `from..=to`, ascending.
    fn range(&self, from: TraceId, to: TraceId) -> Result<Vec<TraceEntry>, TraceStoreError>;

    fn len(&self) -> Result<u64, TraceStoreError>;

    fn is_empty(&self) -> Result<bool, TraceStoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: u64) -> Vec<TraceEntry> {
        let mut prev = ContentHash::genesis();
        let mut out = Vec::new();
        for i in 1..=n {
            let entry = TraceEntry::seal(
                TraceId(i),
                EventType::AgentSpawned,
                "lifecycle".to_string(),
                Some(format!("agent-{i}")),
                ContentHash::of(format!("payload-{i}").as_bytes()),
                prev.clone(),
                Utc::now(),
            );
            prev = entry.hash.clone();
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_replay_full_chain_returns_tail() {
        let entries = chain(5);
        assert_eq!(replay_chain(&entries).unwrap(), entries[4].hash);
    }

    #[test]
    fn test_replay_segment_is_anchored_at_first_prev_hash() {
        let entries = chain(6);
        assert_eq!(replay_chain(&entries[2..]).unwrap(), entries[5].hash);
    }

    #[test]
    fn test_replay_reports_first_divergent_entry() {
        let mut entries = chain(4);
        entries[2].source = "forged".to_string();
        match replay_chain(&entries) {
            Err(CoreError::IntegrityViolation { first_divergence, .. }) => {
                assert_eq!(first_divergence, "3");
            }
            other => panic!("expected integrity violation, got {other:?}"),
        }
    }

    #[test]
    fn test_replay_rejects_gaps() {
        let mut entries = chain(4);
        entries.remove(1);
        assert!(replay_chain(&entries).is_err());
    }

    #[test]
    fn test_time_range_is_half_open() {
        let now = Utc::now();
        let range = TimeRange::new(now, now + chrono::Duration::seconds(1));
        assert!(range.contains(now));
        assert!(!range.contains(range.to));
    }
}
