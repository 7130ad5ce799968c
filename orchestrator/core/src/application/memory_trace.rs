// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Memory Trace Store Application Service
//!
//! Per-agent, hash-linked memory forests. Each forest sits behind its own
//! read-write lock holding an `Arc<ForestIndex>`:
//!
//! - readers work on the index under the read lock and return owned nodes
//! - inserts mutate through `Arc::make_mut` under the write lock; the `Arc`
//!   is shared only while a compaction holds its base snapshot, so at most
//!   the first insert racing a compaction copies the index
//! - `compact` rebuilds from a snapshot without holding the lock, then swaps
//!   the result in after folding back any inserts that raced it
//!
//! Forests of different agents never share a lock. A global node-id index
//! lets `verify_path` locate a node's forest from its id alone, which makes
//! node ids unique across all agents.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::clock::Clock;
use crate::domain::config::MemoryConfig;
use crate::domain::error::{CoreError, CoreResult, ResourceKind};
use crate::domain::events::{Event, EventType};
use crate::domain::memory::{
    CompactionReport, ForestIndex, MemoryNode, NewMemoryNode, NodeId, PathVerification,
};
use crate::infrastructure::event_bus::EventBus;

const SOURCE: &str = "memory";

#[derive(Default)]
struct AgentForest {
    index: RwLock<Arc<ForestIndex>>,
    // Serializes compactions of this forest; inserts never take it.
    compaction: Mutex<()>,
}

impl AgentForest {
    fn read<T>(&self, f: impl FnOnce(&ForestIndex) -> T) -> T {
        f(&self.index.read())
    }

    fn snapshot(&self) -> Arc<ForestIndex> {
        Arc::clone(&self.index.read())
    }
}

pub struct MemoryTraceStore {
    forests: DashMap<AgentId, Arc<AgentForest>>,
    node_owners: DashMap<NodeId, AgentId>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: MemoryConfig,
}

impl MemoryTraceStore {
    pub fn new(event_bus: EventBus, clock: Arc<dyn Clock>, config: MemoryConfig) -> Self {
        Self {
            forests: DashMap::new(),
            node_owners: DashMap::new(),
            event_bus,
            clock,
            config,
        }
    }

    fn forest(&self, agent_id: &AgentId) -> Option<Arc<AgentForest>> {
        self.forests.get(agent_id).map(|f| Arc::clone(&f))
    }

    fn forest_or_create(&self, agent_id: AgentId) -> Arc<AgentForest> {
        Arc::clone(&self.forests.entry(agent_id).or_default())
    }

    fn owner_forest(&self, node_id: &NodeId) -> CoreResult<Arc<AgentForest>> {
        let owner = self
            .node_owners
            .get(node_id)
            .map(|o| *o)
            .ok_or_else(|| CoreError::not_found(ResourceKind::MemoryNode, node_id))?;
        self.forest(&owner)
            .ok_or_else(|| CoreError::not_found(ResourceKind::MemoryNode, node_id))
    }

    /// Seals `new` and adds it to `agent_id`'s forest. The parent, if given,
    /// must already exist in the same forest.
    pub fn insert(&self, agent_id: AgentId, new: NewMemoryNode) -> CoreResult<NodeId> {
        if new.content.len() > self.config.max_content_bytes {
            return Err(CoreError::ConstraintViolation(format!(
                "memory content of {} bytes exceeds limit of {} bytes",
                new.content.len(),
                self.config.max_content_bytes
            )));
        }

        let node = MemoryNode::seal(new, self.clock.now());
        let node_id = node.node_id.clone();

        // Reserve the id globally before touching the forest.
        match self.node_owners.entry(node_id.clone()) {
            Entry::Occupied(_) => {
                return Err(CoreError::InvalidState(format!(
                    "memory node {} already exists",
                    node_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(agent_id);
            }
        }

        let forest = self.forest_or_create(agent_id);
        let derived_key = {
            let mut guard = forest.index.write();
            if let Err(e) = guard.check_insert(&node) {
                drop(guard);
                self.node_owners.remove(&node_id);
                return Err(e);
            }
            let index = Arc::make_mut(&mut *guard);
            index.insert(node.clone())?;
            index.derived_key(&node_id).unwrap_or_default().to_string()
        };

        debug!(agent_id = %agent_id, node_id = %node_id, key = %derived_key, "Memory node inserted");
        metrics::counter!("covenant_memory_nodes_inserted_total").increment(1);
        self.event_bus.publish(Event::new(
            EventType::MemoryInserted,
            SOURCE,
            Some(agent_id.to_string()),
            json!({
                "agent_id": agent_id,
                "node_id": node_id,
                "parent_id": node.parent_id,
                "node_type": node.node_type,
                "derived_key": derived_key,
                "hash": node.hash,
            }),
        ));
        Ok(node_id)
    }

    /// Nodes of `agent_id` whose derived key starts with `key_prefix`.
    /// An agent without memory yields an empty set.
    pub fn query(&self, agent_id: &AgentId, key_prefix: &str) -> Vec<MemoryNode> {
        match self.forest(agent_id) {
            Some(forest) => forest.read(|index| index.query_prefix(key_prefix)),
            None => Vec::new(),
        }
    }

    pub fn get(&self, node_id: &NodeId) -> CoreResult<MemoryNode> {
        self.owner_forest(node_id)?
            .read(|index| index.get(node_id).cloned())
            .ok_or_else(|| CoreError::not_found(ResourceKind::MemoryNode, node_id))
    }

    pub fn children(&self, node_id: &NodeId) -> CoreResult<Vec<MemoryNode>> {
        self.owner_forest(node_id)?.read(|index| {
            if index.contains(node_id) {
                Ok(index.children(node_id))
            } else {
                Err(CoreError::not_found(ResourceKind::MemoryNode, node_id))
            }
        })
    }

    pub fn len(&self, agent_id: &AgentId) -> usize {
        self.forest(agent_id).map(|f| f.read(ForestIndex::len)).unwrap_or(0)
    }

    pub fn agents(&self) -> Vec<AgentId> {
        self.forests.iter().map(|f| *f.key()).collect()
    }

    /// Walks from `node_id` to its root recomputing every hash. A failed
    /// walk is returned as `valid = false` with the first divergent node and
    /// is also published as `audit.integrity_violation`.
    pub fn verify_path(&self, node_id: &NodeId) -> CoreResult<PathVerification> {
        let report = self
            .owner_forest(node_id)?
            .read(|index| index.verify_path(node_id))?;
        if !report.valid {
            warn!(
                node_id = %node_id,
                first_divergence = ?report.first_divergence,
                reason = ?report.reason,
                "Memory path verification failed"
            );
            metrics::counter!("covenant_integrity_violations_total", "component" => SOURCE)
                .increment(1);
            self.event_bus.publish(Event::new(
                EventType::AuditIntegrityViolation,
                SOURCE,
                Some(node_id.to_string()),
                json!({
                    "node_id": node_id,
                    "first_divergence": report.first_divergence,
                    "reason": report.reason,
                }),
            ));
        }
        Ok(report)
    }

    /// Rebuilds `agent_id`'s forest, pruning subtrees entirely older than the
    /// configured retention. Stored hashes are never rewritten.
    pub fn compact(&self, agent_id: &AgentId) -> CoreResult<CompactionReport> {
        let forest = self
            .forest(agent_id)
            .ok_or_else(|| CoreError::not_found(ResourceKind::Agent, agent_id))?;
        let _serial = forest.compaction.lock();

        let horizon = self.config.retention.and_then(|retention| {
            chrono::Duration::from_std(retention)
                .ok()
                .and_then(|r| self.clock.now().checked_sub_signed(r))
        });

        let base = forest.snapshot();
        let (mut rebuilt, _) = base.compacted(horizon);

        let result = {
            let mut guard = forest.index.write();
            rebuilt.absorb_newer(&base, &guard);
            let result = Arc::new(rebuilt);
            *guard = Arc::clone(&result);
            result
        };

        let retained: HashSet<&NodeId> = result.node_ids().collect();
        let mut pruned = 0usize;
        for node_id in base.node_ids().filter(|id| !retained.contains(id)) {
            self.node_owners.remove_if(node_id, |_, owner| owner == agent_id);
            pruned += 1;
        }

        let report = CompactionReport {
            agent_id: *agent_id,
            retained: result.len(),
            pruned,
            horizon,
        };
        info!(
            agent_id = %agent_id,
            retained = report.retained,
            pruned = report.pruned,
            "Memory forest compacted"
        );
        self.event_bus.publish(Event::new(
            EventType::MemoryCompacted,
            SOURCE,
            Some(agent_id.to_string()),
            json!(report),
        ));
        Ok(report)
    }

    /// Edits a stored node in place without resealing it.
    #[cfg(test)]
    pub(crate) fn tamper(&self, node_id: &NodeId, mutate: impl FnOnce(&mut MemoryNode)) {
        if let Ok(forest) = self.owner_forest(node_id) {
            let mut guard = forest.index.write();
            if let Some(node) = Arc::make_mut(&mut *guard).node_mut(node_id) {
                mutate(node);
            }
        }
    }
}
