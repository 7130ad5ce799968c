// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Commitment proof adapters.
//!
//! - [`Ed25519ProofSystem`]: publicly verifiable; the proof embeds the
//!   verifying key, so a third party can check it with
//!   [`verify_ed25519_proof`] given only the statement.
//! - [`HmacProofSystem`]: shared-key HMAC-SHA256, verifiable by any holder of
//!   the key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;

use crate::domain::proof::{Proof, ProofError, ProofStatement, ProofSystem};

pub const ED25519_SCHEME: &str = "ed25519";
pub const HMAC_SHA256_SCHEME: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

pub struct Ed25519ProofSystem {
    signing_key: SigningKey,
}

impl Ed25519ProofSystem {
    /// Fresh key pair from the OS RNG. Proofs do not survive a restart
    /// unless the key is persisted via [`Ed25519ProofSystem::secret_bytes`].
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }
}

impl ProofSystem for Ed25519ProofSystem {
    fn scheme(&self) -> &'static str {
        ED25519_SCHEME
    }

    fn attest(&self, statement: &ProofStatement) -> Result<Proof, ProofError> {
        let signature = self.signing_key.sign(&statement.message());
        Ok(Proof {
            scheme: ED25519_SCHEME.to_string(),
            value: hex::encode(signature.to_bytes()),
            verifier_key: Some(self.verifying_key_hex()),
        })
    }

    /// Accepts only proofs signed by this system's own key.
    fn verify(&self, statement: &ProofStatement, proof: &Proof) -> bool {
        if proof.verifier_key.as_deref() != Some(self.verifying_key_hex().as_str()) {
            return false;
        }
        verify_ed25519_proof(statement, proof).is_ok()
    }
}

/// Checks an ed25519 proof against the verifying key it carries.
pub fn verify_ed25519_proof(statement: &ProofStatement, proof: &Proof) -> Result<(), ProofError> {
    if proof.scheme != ED25519_SCHEME {
        return Err(ProofError::Scheme(format!(
            "expected scheme {}, found {}",
            ED25519_SCHEME, proof.scheme
        )));
    }
    let key_hex = proof
        .verifier_key
        .as_deref()
        .ok_or_else(|| ProofError::Scheme("proof carries no verifying key".to_string()))?;
    let key_bytes: [u8; 32] = hex::decode(key_hex)
        .map_err(|e| ProofError::Scheme(format!("invalid verifying key encoding: {e}")))?
        .try_into()
        .map_err(|_| ProofError::Scheme("invalid public key length (must be 32 bytes)".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ProofError::Scheme(format!("invalid public key: {e}")))?;

    let sig_bytes: [u8; 64] = hex::decode(&proof.value)
        .map_err(|e| ProofError::Scheme(format!("invalid signature encoding: {e}")))?
        .try_into()
        .map_err(|_| ProofError::Scheme("invalid signature length (must be 64 bytes)".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(&statement.message(), &signature)
        .map_err(|e| ProofError::Scheme(format!("signature verification failed: {e}")))
}

pub struct HmacProofSystem {
    key: Vec<u8>,
}

impl HmacProofSystem {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, ProofError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ProofError::Scheme("HMAC key must not be empty".to_string()));
        }
        Ok(Self { key })
    }

    fn mac(&self, statement: &ProofStatement) -> Result<HmacSha256, ProofError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ProofError::Scheme(format!("invalid HMAC key: {e}")))?;
        mac.update(&statement.message());
        Ok(mac)
    }
}

impl ProofSystem for HmacProofSystem {
    fn scheme(&self) -> &'static str {
        HMAC_SHA256_SCHEME
    }

    fn attest(&self, statement: &ProofStatement) -> Result<Proof, ProofError> {
        let mac = self.mac(statement)?;
        Ok(Proof {
            scheme: HMAC_SHA256_SCHEME.to_string(),
            value: hex::encode(mac.finalize().into_bytes()),
            verifier_key: None,
        })
    }

    fn verify(&self, statement: &ProofStatement, proof: &Proof) -> bool {
        if proof.scheme != HMAC_SHA256_SCHEME {
            return false;
        }
        let Ok(expected) = hex::decode(&proof.value) else {
            return false;
        };
        match self.mac(statement) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}
