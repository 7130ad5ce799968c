// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Trace Store Implementations
//
// InMemoryTraceStore keeps the chain in a Vec indexed by trace id.
// SledTraceStore persists it in an embedded sled tree: keys are big-endian
// u64 trace ids so the tree's byte order is chain order, values are JSON.
//
// Both reject appends that would leave a gap or rewrite an existing id.

use std::path::Path;

use parking_lot::RwLock;
use tracing::info;

use crate::domain::trace::{TraceEntry, TraceId, TraceStore, TraceStoreError};

fn expected_next(last: Option<TraceId>) -> TraceId {
    last.map(TraceId::next).unwrap_or(TraceId::FIRST)
}

#[derive(Default)]
pub struct InMemoryTraceStore {
    entries: RwLock<Vec<TraceEntry>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored entry in place, bypassing append-only checks.
    /// Lets tests simulate tampering with the persisted chain.
    #[cfg(test)]
    pub(crate) fn tamper(&self, trace_id: TraceId, mutate: impl FnOnce(&mut TraceEntry)) {
        let mut entries = self.entries.write();
        if let Some(entry) = trace_id
            .0
            .checked_sub(1)
            .and_then(|idx| entries.get_mut(idx as usize))
        {
            mutate(entry);
        }
    }
}

impl TraceStore for InMemoryTraceStore {
    fn append(&self, entry: &TraceEntry) -> Result<(), TraceStoreError> {
        let mut entries = self.entries.write();
        let expected = expected_next(entries.last().map(|e| e.trace_id));
        if entry.trace_id != expected {
            return Err(TraceStoreError::OutOfOrder {
                expected,
                actual: entry.trace_id,
            });
        }
        entries.push(entry.clone());
        Ok(())
    }

    fn get(&self, trace_id: TraceId) -> Result<Option<TraceEntry>, TraceStoreError> {
        let entries = self.entries.read();
        Ok(trace_id
            .0
            .checked_sub(1)
            .and_then(|idx| entries.get(idx as usize))
            .cloned())
    }

    fn last(&self) -> Result<Option<TraceEntry>, TraceStoreError> {
        Ok(self.entries.read().last().cloned())
    }

    fn range(&self, from: TraceId, to: TraceId) -> Result<Vec<TraceEntry>, TraceStoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let entries = self.entries.read();
        let start = from.0.saturating_sub(1) as usize;
        let end = (to.0 as usize).min(entries.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(entries[start..end].to_vec())
    }

    fn len(&self) -> Result<u64, TraceStoreError> {
        Ok(self.entries.read().len() as u64)
    }
}

pub struct SledTraceStore {
    tree: sled::Tree,
}

const TRACE_TREE: &str = "trace_chain";

impl SledTraceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceStoreError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(io_err)?;
        let tree = db.open_tree(TRACE_TREE).map_err(io_err)?;
        info!(path = %path.display(), entries = tree.len(), "Opened sled trace store");
        Ok(Self { tree })
    }

    fn decode(bytes: &[u8]) -> Result<TraceEntry, TraceStoreError> {
        serde_json::from_slice(bytes).map_err(|e| TraceStoreError::Codec(e.to_string()))
    }

    /// Overwrites a stored entry in place, bypassing append-only checks.
    #[cfg(test)]
    pub(crate) fn tamper(&self, trace_id: TraceId, mutate: impl FnOnce(&mut TraceEntry)) {
        if let Ok(Some(mut entry)) = self.get(trace_id) {
            mutate(&mut entry);
            if let Ok(value) = serde_json::to_vec(&entry) {
                let _ = self.tree.insert(trace_id.0.to_be_bytes(), value);
            }
        }
    }
}

fn io_err(e: sled::Error) -> TraceStoreError {
    TraceStoreError::Io(e.to_string())
}

impl TraceStore for SledTraceStore {
    fn append(&self, entry: &TraceEntry) -> Result<(), TraceStoreError> {
        let expected = expected_next(self.last()?.map(|e| e.trace_id));
        if entry.trace_id != expected {
            return Err(TraceStoreError::OutOfOrder {
                expected,
                actual: entry.trace_id,
            });
        }
        let value = serde_json::to_vec(entry).map_err(|e| TraceStoreError::Codec(e.to_string()))?;
        self.tree
            .insert(entry.trace_id.0.to_be_bytes(), value)
            .map_err(io_err)?;
        self.tree.flush().map_err(io_err)?;
        Ok(())
    }

    fn get(&self, trace_id: TraceId) -> Result<Option<TraceEntry>, TraceStoreError> {
        match self.tree.get(trace_id.0.to_be_bytes()).map_err(io_err)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn last(&self) -> Result<Option<TraceEntry>, TraceStoreError> {
        match self.tree.last().map_err(io_err)? {
            Some((_, bytes)) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn range(&self, from: TraceId, to: TraceId) -> Result<Vec<TraceEntry>, TraceStoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.tree
            .range(from.0.to_be_bytes()..=to.0.to_be_bytes())
            .map(|item| {
                let (_, bytes) = item.map_err(io_err)?;
                Self::decode(&bytes)
            })
            .collect()
    }

    fn len(&self) -> Result<u64, TraceStoreError> {
        Ok(self.tree.len() as u64)
    }
}
