// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Core Error Taxonomy
//!
//! Every mutating operation of the core returns [`CoreError`] synchronously to
//! its caller. Collaborator failures (kernel, sandbox, policy authority) are
//! surfaced as [`CoreError::ConstraintViolation`] or [`CoreError::Timeout`] and
//! are never treated as success.

use std::fmt;
use thiserror::Error;

/// The kind of entity a [`CoreError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Agent,
    Snapshot,
    Proposal,
    Commitment,
    MemoryNode,
    TraceEntry,
    Agreement,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Agent => "agent",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Proposal => "proposal",
            ResourceKind::Commitment => "commitment",
            ResourceKind::MemoryNode => "memory node",
            ResourceKind::TraceEntry => "trace entry",
            ResourceKind::Agreement => "agreement",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Quorum not reached: approve weight {approve_weight} < required {required_weight}")]
    QuorumNotReached {
        approve_weight: u64,
        required_weight: u64,
    },

    #[error("Proposal expired: {0}")]
    Expired(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Verification failure, reported with the first divergent node or trace id.
    #[error("Integrity violation at {first_divergence}: {reason}")]
    IntegrityViolation {
        first_divergence: String,
        reason: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Persistence failure of the trace store backend.
    #[error("Storage failure: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn not_found(kind: ResourceKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
