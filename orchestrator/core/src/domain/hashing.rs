// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! SHA-256 digests shared by the memory forest, the consensus tally and the
//! trace chain.
//!
//! Multi-field digests frame every field with its big-endian `u64` length so
//! that `("ab", "c")` and `("a", "bc")` never collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// The all-zero hash used as `prev_hash` of the first trace entry.
    pub fn genesis() -> Self {
        Self("0".repeat(64))
    }

    /// Digest of a single byte string.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Digest of several length-framed fields.
    pub fn of_fields(fields: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Digest of a JSON value.
    ///
    /// `serde_json::Value` objects are backed by a sorted map, so serialization
    /// is canonical for equal values.
    pub fn of_json(value: &serde_json::Value) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self::of(&bytes),
            // A `Value` always serializes; fall back to its display form regardless.
            Err(_) => Self::of(value.to_string().as_bytes()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
