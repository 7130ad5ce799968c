// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Audit/Trace Engine
//
// Subscribes to every event on the bus and appends one hash-chained
// TraceEntry per event. The chain tail sits behind a single mutex; this is
// the only point in the core where all components serialize. The store
// append happens under that mutex so ids and prev hashes can never
// interleave.
//
// Chain order is arrival order at this engine, not the causal order of the
// operations that produced the events. Entries are stamped with their arrival
// time from the engine clock, never earlier than their predecessor, so a
// time range always selects a contiguous segment of the chain.
//
// The chain is eventually consistent with the event stream: `progress()` /
// `wait_for()` let callers wait for it to catch up.
//
// Checkpoints are kept in memory only. After a restart the tail is resumed
// from the store and verification starts from genesis until new
// checkpoints accumulate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::deadline::within_deadline;
use crate::domain::clock::Clock;
use crate::domain::config::AuditConfig;
use crate::domain::error::{CoreError, CoreResult, ResourceKind};
use crate::domain::events::{Event, EventType};
use crate::domain::hashing::ContentHash;
use crate::domain::trace::{
    check_link, replay_chain, Checkpoint, TimeRange, TraceEntry, TraceId, TraceStore,
    TraceVerification,
};
use crate::infrastructure::event_bus::{EventBus, EventHandler};

const SOURCE: &str = "audit";

struct ChainTail {
    last: Option<TraceId>,
    hash: ContentHash,
    stamped_at: Option<DateTime<Utc>>,
}

impl ChainTail {
    fn next_id(&self) -> TraceId {
        self.last.map(TraceId::next).unwrap_or(TraceId::FIRST)
    }

    fn next_stamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.stamped_at {
            Some(previous) if previous > now => previous,
            _ => now,
        }
    }
}

pub struct AuditTraceEngine {
    store: Arc<dyn TraceStore>,
    tail: Mutex<ChainTail>,
    checkpoints: RwLock<BTreeMap<TraceId, ContentHash>>,
    checkpoint_interval: u64,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    progress: watch::Sender<u64>,
}

impl AuditTraceEngine {
    /// Opens the engine over `store`, resuming the tail from its last entry.
    pub fn new(
        store: Arc<dyn TraceStore>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: &AuditConfig,
    ) -> CoreResult<Self> {
        let tail = match store.last()? {
            Some(entry) => ChainTail {
                last: Some(entry.trace_id),
                hash: entry.hash,
                stamped_at: Some(entry.timestamp),
            },
            None => ChainTail {
                last: None,
                hash: ContentHash::genesis(),
                stamped_at: None,
            },
        };
        let appended = tail.last.map(|id| id.0).unwrap_or(0);
        if appended > 0 {
            info!(trace_id = appended, "Resumed trace chain from store");
        }
        let (progress, _) = watch::channel(appended);
        Ok(Self {
            store,
            tail: Mutex::new(tail),
            checkpoints: RwLock::new(BTreeMap::new()),
            checkpoint_interval: config.checkpoint_interval,
            event_bus,
            clock,
            progress,
        })
    }

    /// Appends one entry for `event` and advances the tail. The entry is
    /// stamped on arrival, not with the event's publish time.
    pub fn record(&self, event: &Event) -> CoreResult<TraceEntry> {
        let payload_hash = ContentHash::of_json(&event.payload);

        let entry = {
            let mut tail = self.tail.lock();
            let stamp = tail.next_stamp(self.clock.now());
            let entry = TraceEntry::seal(
                tail.next_id(),
                event.event_type,
                event.source.clone(),
                event.target.clone(),
                payload_hash,
                tail.hash.clone(),
                stamp,
            );
            self.store.append(&entry)?;
            tail.last = Some(entry.trace_id);
            tail.hash = entry.hash.clone();
            tail.stamped_at = Some(stamp);

            if self.checkpoint_interval > 0 && entry.trace_id.0 % self.checkpoint_interval == 0 {
                self.checkpoints
                    .write()
                    .insert(entry.trace_id, entry.hash.clone());
                debug!(trace_id = %entry.trace_id, "Trace checkpoint recorded");
            }
            entry
        };

        self.progress.send_replace(entry.trace_id.0);
        metrics::counter!("covenant_trace_entries_appended_total").increment(1);
        Ok(entry)
    }

    pub fn get_trace(&self, trace_id: TraceId) -> CoreResult<TraceEntry> {
        self.store
            .get(trace_id)?
            .ok_or_else(|| CoreError::not_found(ResourceKind::TraceEntry, trace_id))
    }

    /// Live tail of the chain. An empty chain reports trace id 0 and the
    /// genesis hash.
    pub fn head(&self) -> Checkpoint {
        let tail = self.tail.lock();
        Checkpoint {
            trace_id: tail.last.unwrap_or(TraceId(0)),
            hash: tail.hash.clone(),
        }
    }

    pub fn len(&self) -> u64 {
        self.tail.lock().last.map(|id| id.0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints
            .read()
            .iter()
            .map(|(trace_id, hash)| Checkpoint {
                trace_id: *trace_id,
                hash: hash.clone(),
            })
            .collect()
    }

    /// Recomputes the chain up to `trace_id`, starting from the nearest
    /// checkpoint below it (or genesis). A broken link reports the first
    /// divergent trace id and publishes `audit.integrity_violation`.
    pub fn verify_trace(&self, trace_id: TraceId) -> CoreResult<TraceVerification> {
        if trace_id.0 == 0 || trace_id.0 > self.len() {
            return Err(CoreError::not_found(ResourceKind::TraceEntry, trace_id));
        }

        let (anchored_at, anchor_hash) = self
            .checkpoints
            .read()
            .range(..trace_id)
            .next_back()
            .map(|(id, hash)| (id.0, hash.clone()))
            .unwrap_or_else(|| (0, ContentHash::genesis()));

        let entries = self.store.range(TraceId(anchored_at + 1), trace_id)?;
        let mut expected_id = TraceId(anchored_at + 1);
        let mut expected_prev = anchor_hash;
        let mut divergence = None;
        for entry in &entries {
            if let Some(reason) = check_link(entry, expected_id, &expected_prev) {
                divergence = Some((expected_id, reason));
                break;
            }
            expected_prev = entry.hash.clone();
            expected_id = expected_id.next();
        }
        if divergence.is_none() && expected_id != trace_id.next() {
            divergence = Some((expected_id, format!("trace entry {expected_id} is missing")));
        }

        let entries_checked = match &divergence {
            Some((id, _)) => id.0 - anchored_at,
            None => trace_id.0 - anchored_at,
        };
        let verification = TraceVerification {
            trace_id,
            valid: divergence.is_none(),
            anchored_at,
            entries_checked,
            first_divergence: divergence.as_ref().map(|(id, _)| *id),
            reason: divergence.map(|(_, reason)| reason),
        };

        if !verification.valid {
            warn!(
                trace_id = %trace_id,
                first_divergence = ?verification.first_divergence,
                reason = ?verification.reason,
                "Trace chain verification failed"
            );
            metrics::counter!("covenant_integrity_violations_total", "component" => SOURCE)
                .increment(1);
            self.event_bus.publish(Event::new(
                EventType::AuditIntegrityViolation,
                SOURCE,
                Some(trace_id.to_string()),
                json!({
                    "trace_id": trace_id,
                    "first_divergence": verification.first_divergence,
                    "reason": verification.reason,
                }),
            ));
        }
        Ok(verification)
    }

    /// Entries stamped within `range`, in chain order. Stamps never decrease
    /// along the chain, so the result is a contiguous segment that replays on
    /// its own.
    pub fn export(&self, range: TimeRange) -> CoreResult<Vec<TraceEntry>> {
        let head = self.len();
        if head == 0 {
            return Ok(Vec::new());
        }
        let entries = self.store.range(TraceId::FIRST, TraceId(head))?;
        Ok(entries
            .into_iter()
            .filter(|entry| range.contains(entry.timestamp))
            .collect())
    }

    /// Replays an exported, contiguous segment on its own and returns the
    /// reconstructed tail hash.
    pub fn replay(&self, entries: &[TraceEntry]) -> CoreResult<ContentHash> {
        replay_chain(entries)
    }

    /// Number of entries appended so far, updated after every append.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    /// Waits until at least `count` entries have been appended.
    pub async fn wait_for(&self, count: u64, deadline: Option<Instant>) -> CoreResult<()> {
        let mut progress = self.progress.subscribe();
        within_deadline(deadline, "wait_for_trace", async move {
            progress
                .wait_for(|appended| *appended >= count)
                .await
                .map(|_| ())
                .map_err(|_| CoreError::Storage("trace progress channel closed".to_string()))
        })
        .await
    }
}

#[async_trait]
impl EventHandler for AuditTraceEngine {
    async fn handle(&self, event: Arc<Event>) {
        if let Err(e) = self.record(&event) {
            error!(
                event_type = %event.event_type,
                error = %e,
                "Failed to append trace entry"
            );
            metrics::counter!("covenant_trace_append_failures_total").increment(1);
        }
    }
}
