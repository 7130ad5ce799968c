// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pluggable attestation scheme for consensus commitments.
//!
//! A proof binds an action identity (the proposal id) to a payload hash (the
//! final tally hash). It must be verifiable from those two values alone; the
//! votes themselves are not needed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::error::CoreError;
use crate::domain::hashing::ContentHash;

/// The statement a proof attests to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStatement {
    pub subject: String,
    pub payload_hash: ContentHash,
}

impl ProofStatement {
    pub fn new(subject: impl Into<String>, payload_hash: ContentHash) -> Self {
        Self {
            subject: subject.into(),
            payload_hash,
        }
    }

    /// Domain-separated message bytes that get signed.
    pub fn message(&self) -> Vec<u8> {
        let mut msg = b"covenant.commitment.v1\0".to_vec();
        msg.extend_from_slice(self.subject.as_bytes());
        msg.push(0);
        msg.extend_from_slice(self.payload_hash.as_str().as_bytes());
        msg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub scheme: String,
    /// Hex-encoded signature or MAC.
    pub value: String,
    /// Hex-encoded public key, for publicly verifiable schemes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Proof scheme failure: {0}")]
    Scheme(String),
}

impl From<ProofError> for CoreError {
    fn from(err: ProofError) -> Self {
        CoreError::ConstraintViolation(err.to_string())
    }
}

pub trait ProofSystem: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn attest(&self, statement: &ProofStatement) -> Result<Proof, ProofError>;

    fn verify(&self, statement: &ProofStatement, proof: &Proof) -> bool;
}
