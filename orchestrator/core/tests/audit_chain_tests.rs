// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the audit trace chain.
//!
//! Every event published by the core must land in the chain, in arrival
//! order, linked by hash. Tampering with the persisted chain is detected
//! with the first divergent trace id, and an exported chain replays to the
//! live head.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use covenant_core::application::{CastVote, ExecuteRequest, ProposeRequest};
use covenant_core::domain::agent::AgentConstraints;
use covenant_core::domain::clock::ManualClock;
use covenant_core::domain::config::{CoreConfigManifest, TraceStoreConfig};
use covenant_core::domain::consensus::VoteDecision;
use covenant_core::domain::events::{Event, EventType};
use covenant_core::domain::hashing::ContentHash;
use covenant_core::domain::memory::NewMemoryNode;
use covenant_core::domain::trace::{
    TimeRange, TraceEntry, TraceId, TraceStore, TraceStoreError,
};
use covenant_core::infrastructure::InMemoryTraceStore;
use covenant_core::{CoreError, CovenantCore};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

/// Trace store whose reads can be forged after the fact, standing in for
/// someone editing the persisted log.
#[derive(Default)]
struct ForgeableStore {
    inner: InMemoryTraceStore,
    forged: Mutex<HashMap<TraceId, TraceEntry>>,
}

impl ForgeableStore {
    fn forge(&self, trace_id: TraceId, mutate: impl FnOnce(&mut TraceEntry)) {
        if let Ok(Some(mut entry)) = self.inner.get(trace_id) {
            mutate(&mut entry);
            self.forged.lock().insert(trace_id, entry);
        }
    }

    fn overlay(&self, entry: TraceEntry) -> TraceEntry {
        self.forged
            .lock()
            .get(&entry.trace_id)
            .cloned()
            .unwrap_or(entry)
    }
}

impl TraceStore for ForgeableStore {
    fn append(&self, entry: &TraceEntry) -> Result<(), TraceStoreError> {
        self.inner.append(entry)
    }

    fn get(&self, trace_id: TraceId) -> Result<Option<TraceEntry>, TraceStoreError> {
        Ok(self.inner.get(trace_id)?.map(|e| self.overlay(e)))
    }

    fn last(&self) -> Result<Option<TraceEntry>, TraceStoreError> {
        self.inner.last()
    }

    fn range(&self, from: TraceId, to: TraceId) -> Result<Vec<TraceEntry>, TraceStoreError> {
        Ok(self
            .inner
            .range(from, to)?
            .into_iter()
            .map(|e| self.overlay(e))
            .collect())
    }

    fn len(&self) -> Result<u64, TraceStoreError> {
        self.inner.len()
    }
}

fn deadline() -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(5))
}

fn all_time() -> TimeRange {
    TimeRange::new(
        Utc::now() - chrono::Duration::days(1),
        Utc::now() + chrono::Duration::days(1),
    )
}

/// Drives one operation of every component; returns the event types they
/// publish, in order.
async fn run_workload(core: &CovenantCore) -> Vec<EventType> {
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    core.execute_intent(&agent, ExecuteRequest::new("plan", json!({ "step": 1 })))
        .await
        .unwrap();
    core.insert_memory(&agent, NewMemoryNode::root("plan ready", "note"))
        .unwrap();
    let proposal = core
        .propose_consensus(ProposeRequest::new(agent, "deploy", 1))
        .unwrap();
    core.cast_vote(&proposal, CastVote::new("v1", VoteDecision::Approve, 1))
        .unwrap();
    core.commit_consensus(&proposal, None, None).await.unwrap();

    vec![
        EventType::AgentSpawned,
        EventType::AgentExecuted,
        EventType::MemoryInserted,
        EventType::ConsensusProposed,
        EventType::ConsensusVoted,
        EventType::ConsensusCommitted,
    ]
}

#[tokio::test]
async fn every_event_is_chained_in_arrival_order() {
    let core = CovenantCore::in_memory().unwrap();
    let expected = run_workload(&core).await;
    core.wait_for_trace(expected.len() as u64, deadline())
        .await
        .unwrap();

    let entries = core.export_trace(all_time()).unwrap();
    let types: Vec<EventType> = entries.iter().map(|e| e.event_type).collect();
    assert_eq!(types, expected);

    assert_eq!(entries[0].prev_hash, ContentHash::genesis());
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
        assert_eq!(pair[1].trace_id, pair[0].trace_id.next());
    }
    assert_eq!(entries[0].source, "lifecycle");
    assert_eq!(entries[5].source, "consensus");

    let last = TraceId(expected.len() as u64);
    assert!(core.verify_trace(last).unwrap().valid);
    assert_eq!(core.get_trace(last).unwrap(), entries[5]);
}

#[tokio::test]
async fn export_replay_reconstructs_live_head() {
    let core = CovenantCore::in_memory().unwrap();
    let expected = run_workload(&core).await;
    core.wait_for_trace(expected.len() as u64, deadline())
        .await
        .unwrap();

    let exported = core.export_trace(all_time()).unwrap();
    let replayed = core.replay_trace(&exported).unwrap();
    assert_eq!(replayed, core.trace_head().hash);
}

#[tokio::test]
async fn partial_export_replays_despite_out_of_order_publish_times() {
    let t0 = Utc::now();
    let clock = ManualClock::new(t0);
    let core = CovenantCore::builder(CoreConfigManifest::default())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    // Publish times run 10ms, 0ms, 20ms, 5ms after t0; arrival is 0, 10, 20, 30
    let publish_offsets = [10, 0, 20, 5];
    for (n, offset) in publish_offsets.iter().enumerate() {
        let mut event = Event::new(
            EventType::AgentExecuted,
            "lifecycle",
            Some(format!("agent-{n}")),
            json!({ "n": n }),
        );
        event.timestamp = t0 + chrono::Duration::milliseconds(*offset);
        core.event_bus().publish(event);
        core.wait_for_trace(n as u64 + 1, deadline()).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(10));
    }

    let segment = core
        .export_trace(TimeRange::new(
            t0 + chrono::Duration::milliseconds(5),
            t0 + chrono::Duration::milliseconds(25),
        ))
        .unwrap();
    let ids: Vec<TraceId> = segment.iter().map(|e| e.trace_id).collect();
    assert_eq!(ids, vec![TraceId(2), TraceId(3)]);
    assert_eq!(
        core.replay_trace(&segment).unwrap(),
        core.get_trace(TraceId(3)).unwrap().hash
    );

    let rest = core
        .export_trace(TimeRange::new(
            t0 + chrono::Duration::milliseconds(5),
            t0 + chrono::Duration::hours(1),
        ))
        .unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(core.replay_trace(&rest).unwrap(), core.trace_head().hash);
}

#[tokio::test]
async fn forged_entry_reports_first_divergence() {
    let store = Arc::new(ForgeableStore::default());
    let core = CovenantCore::builder(CoreConfigManifest::default())
        .trace_store(store.clone())
        .build()
        .unwrap();
    let mut events = core.event_bus().watch();

    let expected = run_workload(&core).await;
    let count = expected.len() as u64;
    core.wait_for_trace(count, deadline()).await.unwrap();
    assert!(core.verify_trace(TraceId(count)).unwrap().valid);

    store.forge(TraceId(3), |e| {
        e.payload_hash = ContentHash::of_json(&json!({ "rewritten": true }))
    });
    let verification = core.verify_trace(TraceId(count)).unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.first_divergence, Some(TraceId(3)));
    assert!(matches!(
        verification.into_result(),
        Err(CoreError::IntegrityViolation { first_divergence, .. }) if first_divergence == "3"
    ));

    // The violation is itself an event and gets chained after the workload
    let violation = loop {
        let event = events.recv().await.unwrap();
        if event.event_type == EventType::AuditIntegrityViolation {
            break event;
        }
    };
    assert_eq!(violation.source, "audit");
    core.wait_for_trace(count + 1, deadline()).await.unwrap();
    assert_eq!(
        core.get_trace(TraceId(count + 1)).unwrap().event_type,
        EventType::AuditIntegrityViolation
    );

    let exported = core.export_trace(all_time()).unwrap();
    assert!(matches!(
        core.replay_trace(&exported),
        Err(CoreError::IntegrityViolation { .. })
    ));
}

#[tokio::test]
async fn sled_chain_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CoreConfigManifest::default();
    config.spec.audit.store = TraceStoreConfig::Sled {
        path: dir.path().join("trace"),
    };
    let config_path = dir.path().join("covenant-config.yaml");
    config.save_file(&config_path).unwrap();

    let head = {
        let loaded = CoreConfigManifest::load(Some(&config_path)).unwrap();
        let core = CovenantCore::builder(loaded).build().unwrap();
        let expected = run_workload(&core).await;
        core.wait_for_trace(expected.len() as u64, deadline())
            .await
            .unwrap();
        core.trace_head()
    };
    // Let the dropped subscription worker release its handle on the store
    tokio::time::sleep(Duration::from_millis(50)).await;

    let loaded = CoreConfigManifest::load(Some(&config_path)).unwrap();
    let core = CovenantCore::builder(loaded).build().unwrap();
    assert_eq!(core.trace_head(), head);

    core.spawn_agent(AgentConstraints::default()).await.unwrap();
    core.wait_for_trace(head.trace_id.0 + 1, deadline())
        .await
        .unwrap();
    let appended = core.get_trace(head.trace_id.next()).unwrap();
    assert_eq!(appended.prev_hash, head.hash);
    assert!(core.verify_trace(appended.trace_id).unwrap().valid);
}
