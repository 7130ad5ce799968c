// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Memory Forest
//!
//! Per-agent, hash-linked node storage. Each [`MemoryNode`] carries a hash over
//! its own fields (including `parent_id`), recomputed on every path
//! verification to detect tampering.
//!
//! A node's *derived key* is its materialized path of node ids from the root
//! (`root/child/grandchild`). [`ForestIndex`] keeps those keys in a sorted map,
//! so a prefix query is a single range scan and `prefix = "<id>"` returns the
//! subtree rooted at `<id>`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::error::{CoreError, CoreResult, ResourceKind};
use crate::domain::hashing::ContentHash;

pub const KEY_SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied fields of a node about to be inserted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMemoryNode {
    /// Generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub content: String,
    pub node_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
}

impl NewMemoryNode {
    pub fn root(content: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            node_type: node_type.into(),
            ..Default::default()
        }
    }

    pub fn child_of(
        parent_id: NodeId,
        content: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::root(content, node_type)
        }
    }

    pub fn with_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(NodeId::new(node_id));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNode {
    pub node_id: NodeId,
    pub content: String,
    pub node_type: String,
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    pub hash: ContentHash,
}

impl MemoryNode {
    /// Seals a new node, computing its hash.
    pub fn seal(new: NewMemoryNode, timestamp: DateTime<Utc>) -> Self {
        let node_id = new.node_id.unwrap_or_else(NodeId::generate);
        let hash = Self::compute_hash(
            &node_id,
            &new.content,
            &new.node_type,
            &new.metadata,
            new.parent_id.as_ref(),
            timestamp,
        );
        Self {
            node_id,
            content: new.content,
            node_type: new.node_type,
            metadata: new.metadata,
            parent_id: new.parent_id,
            timestamp,
            hash,
        }
    }

    /// `H(node_id ∥ content ∥ node_type ∥ metadata ∥ parent_id ∥ timestamp)`
    pub fn compute_hash(
        node_id: &NodeId,
        content: &str,
        node_type: &str,
        metadata: &BTreeMap<String, String>,
        parent_id: Option<&NodeId>,
        timestamp: DateTime<Utc>,
    ) -> ContentHash {
        let metadata = serde_json::to_vec(metadata).unwrap_or_default();
        let parent = parent_id.map(NodeId::as_str).unwrap_or("");
        let ts = timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        ContentHash::of_fields(&[
            node_id.as_str().as_bytes(),
            content.as_bytes(),
            node_type.as_bytes(),
            &metadata,
            parent.as_bytes(),
            ts.as_bytes(),
        ])
    }

    pub fn recompute_hash(&self) -> ContentHash {
        Self::compute_hash(
            &self.node_id,
            &self.content,
            &self.node_type,
            &self.metadata,
            self.parent_id.as_ref(),
            self.timestamp,
        )
    }

    pub fn hash_is_valid(&self) -> bool {
        self.recompute_hash() == self.hash
    }
}

/// Outcome of walking a node's path to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathVerification {
    pub node_id: NodeId,
    pub valid: bool,
    /// Number of nodes whose hash was recomputed.
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_divergence: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PathVerification {
    fn ok(node_id: NodeId, checked: usize) -> Self {
        Self {
            node_id,
            valid: true,
            checked,
            first_divergence: None,
            reason: None,
        }
    }

    fn diverged(node_id: NodeId, checked: usize, at: NodeId, reason: String) -> Self {
        Self {
            node_id,
            valid: false,
            checked,
            first_divergence: Some(at),
            reason: Some(reason),
        }
    }

    /// Converts a failed verification into [`CoreError::IntegrityViolation`].
    pub fn into_result(self) -> CoreResult<Self> {
        if self.valid {
            return Ok(self);
        }
        Err(CoreError::IntegrityViolation {
            first_divergence: self
                .first_divergence
                .map(|n| n.0)
                .unwrap_or_else(|| self.node_id.0.clone()),
            reason: self.reason.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub agent_id: AgentId,
    pub retained: usize,
    pub pruned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizon: Option<DateTime<Utc>>,
}

/// One agent's forest: node storage plus the sorted derived-key index.
///
/// Cloned wholesale for copy-then-swap; never mutated while shared.
#[derive(Debug, Clone, Default)]
pub struct ForestIndex {
    nodes: HashMap<NodeId, MemoryNode>,
    keys: BTreeMap<String, NodeId>,
    paths: HashMap<NodeId, String>,
    children: HashMap<NodeId, Vec<NodeId>>,
}

impl ForestIndex {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&MemoryNode> {
        self.nodes.get(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn derived_key(&self, node_id: &NodeId) -> Option<&str> {
        self.paths.get(node_id).map(String::as_str)
    }

    /// Validates placement of a sealed node without inserting it.
    pub fn check_insert(&self, node: &MemoryNode) -> CoreResult<()> {
        if node.node_id.as_str().is_empty() || node.node_id.as_str().contains(KEY_SEPARATOR) {
            return Err(CoreError::ConstraintViolation(format!(
                "node id '{}' must be non-empty and must not contain '{}'",
                node.node_id, KEY_SEPARATOR
            )));
        }
        if self.nodes.contains_key(&node.node_id) {
            return Err(CoreError::InvalidState(format!(
                "memory node {} already exists",
                node.node_id
            )));
        }
        if let Some(parent) = &node.parent_id {
            if !self.nodes.contains_key(parent) {
                return Err(CoreError::not_found(ResourceKind::MemoryNode, parent));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, node: MemoryNode) -> CoreResult<()> {
        self.check_insert(&node)?;
        let key = match &node.parent_id {
            Some(parent) => {
                let parent_key = self.paths.get(parent).cloned().unwrap_or_default();
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(node.node_id.clone());
                format!("{}{}{}", parent_key, KEY_SEPARATOR, node.node_id)
            }
            None => node.node_id.0.clone(),
        };
        self.keys.insert(key.clone(), node.node_id.clone());
        self.paths.insert(node.node_id.clone(), key);
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// All nodes whose derived key starts with `prefix`, in key order.
    pub fn query_prefix(&self, prefix: &str) -> Vec<MemoryNode> {
        self.keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(_, id)| self.nodes.get(id).cloned())
            .collect()
    }

    pub fn children(&self, node_id: &NodeId) -> Vec<MemoryNode> {
        self.children
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Walks from `node_id` to its root, recomputing each hash and resolving
    /// each parent reference. Reports the first divergence met on the way up.
    pub fn verify_path(&self, node_id: &NodeId) -> CoreResult<PathVerification> {
        let mut current = self
            .nodes
            .get(node_id)
            .ok_or_else(|| CoreError::not_found(ResourceKind::MemoryNode, node_id))?;
        let mut checked = 0usize;
        let mut seen = HashSet::new();

        loop {
            checked += 1;
            if !seen.insert(current.node_id.clone()) {
                return Ok(PathVerification::diverged(
                    node_id.clone(),
                    checked,
                    current.node_id.clone(),
                    "parent chain contains a cycle".to_string(),
                ));
            }
            if !current.hash_is_valid() {
                return Ok(PathVerification::diverged(
                    node_id.clone(),
                    checked,
                    current.node_id.clone(),
                    format!(
                        "stored hash {} does not match recomputed {}",
                        current.hash,
                        current.recompute_hash()
                    ),
                ));
            }
            match &current.parent_id {
                None => return Ok(PathVerification::ok(node_id.clone(), checked)),
                Some(parent) => match self.nodes.get(parent) {
                    Some(next) => current = next,
                    None => {
                        return Ok(PathVerification::diverged(
                            node_id.clone(),
                            checked,
                            current.node_id.clone(),
                            format!("parent {} does not resolve", parent),
                        ))
                    }
                },
            }
        }
    }

    /// Returns a rebuilt index without the subtrees that are entirely older
    /// than `horizon`, plus the number of pruned nodes. Stored hashes are
    /// copied unchanged.
    pub fn compacted(&self, horizon: Option<DateTime<Utc>>) -> (ForestIndex, usize) {
        let prunable: HashSet<NodeId> = match horizon {
            Some(h) => self.stale_subtrees(h),
            None => HashSet::new(),
        };

        let mut rebuilt = ForestIndex::default();
        for node in self.parents_first(self.nodes.values()) {
            if prunable.contains(&node.node_id) {
                continue;
            }
            // Parents are visited first and a retained node never has a
            // pruned parent, so placement cannot fail.
            let _ = rebuilt.insert(node.clone());
        }
        (rebuilt, prunable.len())
    }

    /// Copies every node of `current` that `base` lacks into `self`, along
    /// with any ancestors `self` dropped. Used to fold inserts that raced a
    /// compaction into its result.
    pub fn absorb_newer(&mut self, base: &ForestIndex, current: &ForestIndex) {
        let newer: Vec<&MemoryNode> = current
            .nodes
            .values()
            .filter(|n| !base.nodes.contains_key(&n.node_id))
            .collect();
        for node in current.parents_first(newer.into_iter()) {
            self.restore_with_ancestors(node, current);
        }
    }

    fn restore_with_ancestors(&mut self, node: &MemoryNode, source: &ForestIndex) {
        if self.nodes.contains_key(&node.node_id) {
            return;
        }
        if let Some(parent_id) = &node.parent_id {
            if !self.nodes.contains_key(parent_id) {
                if let Some(parent) = source.nodes.get(parent_id) {
                    self.restore_with_ancestors(parent, source);
                }
            }
        }
        let _ = self.insert(node.clone());
    }

    fn stale_subtrees(&self, horizon: DateTime<Utc>) -> HashSet<NodeId> {
        fn visit(
            index: &ForestIndex,
            id: &NodeId,
            horizon: DateTime<Utc>,
            out: &mut HashSet<NodeId>,
        ) -> bool {
            let mut all_children_stale = true;
            if let Some(children) = index.children.get(id) {
                for child in children {
                    if !visit(index, child, horizon, out) {
                        all_children_stale = false;
                    }
                }
            }
            let stale = all_children_stale
                && index
                    .nodes
                    .get(id)
                    .map(|n| n.timestamp < horizon)
                    .unwrap_or(false);
            if stale {
                out.insert(id.clone());
            }
            stale
        }

        let mut out = HashSet::new();
        for node in self.nodes.values().filter(|n| n.parent_id.is_none()) {
            visit(self, &node.node_id, horizon, &mut out);
        }
        out
    }

    fn parents_first<'a>(&self, nodes: impl Iterator<Item = &'a MemoryNode>) -> Vec<&'a MemoryNode> {
        let mut ordered: Vec<&MemoryNode> = nodes.collect();
        ordered.sort_by_key(|n| {
            self.paths
                .get(&n.node_id)
                .map(|p| p.matches(KEY_SEPARATOR).count())
                .unwrap_or(0)
        });
        ordered
    }

    #[cfg(test)]
    pub(crate) fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut MemoryNode> {
        self.nodes.get_mut(node_id)
    }
}
