// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Agreements and the Policy Authority Contract
//!
//! Agreements are issued by an external policy authority and consumed
//! read-only. The core only ever asks one question of that authority:
//! is `action` compliant under `agreement_ref`?

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::error::CoreError;
use crate::domain::hashing::ContentHash;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgreementRef(pub String);

impl AgreementRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgreementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Action patterns: exact match, `*`, or a trailing-`*` prefix such as
/// `agent.execute:*`. Denials win over allowances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementConstraints {
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub denied_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub agreement_id: AgreementRef,
    pub agreement_hash: ContentHash,
    pub ethics_rules: Vec<String>,
    pub constraints: AgreementConstraints,
    pub valid_until: DateTime<Utc>,
}

impl Agreement {
    /// Builds an agreement with its hash computed over the remaining fields.
    pub fn issue(
        agreement_id: AgreementRef,
        ethics_rules: Vec<String>,
        constraints: AgreementConstraints,
        valid_until: DateTime<Utc>,
    ) -> Self {
        let agreement_hash =
            Self::compute_hash(&agreement_id, &ethics_rules, &constraints, valid_until);
        Self {
            agreement_id,
            agreement_hash,
            ethics_rules,
            constraints,
            valid_until,
        }
    }

    pub fn compute_hash(
        agreement_id: &AgreementRef,
        ethics_rules: &[String],
        constraints: &AgreementConstraints,
        valid_until: DateTime<Utc>,
    ) -> ContentHash {
        let rules = list_hash(ethics_rules);
        let allowed = list_hash(&constraints.allowed_actions);
        let denied = list_hash(&constraints.denied_actions);
        let until = valid_until.to_rfc3339();
        ContentHash::of_fields(&[
            agreement_id.as_str().as_bytes(),
            rules.as_str().as_bytes(),
            allowed.as_str().as_bytes(),
            denied.as_str().as_bytes(),
            until.as_bytes(),
        ])
    }

    pub fn hash_is_consistent(&self) -> bool {
        Self::compute_hash(
            &self.agreement_id,
            &self.ethics_rules,
            &self.constraints,
            self.valid_until,
        ) == self.agreement_hash
    }

    /// Local evaluation of `action` at time `now`.
    pub fn evaluate(&self, action: &str, now: DateTime<Utc>) -> ComplianceDecision {
        if now >= self.valid_until {
            return ComplianceDecision::deny(format!(
                "agreement {} expired at {}",
                self.agreement_id, self.valid_until
            ));
        }
        if let Some(pattern) = self
            .constraints
            .denied_actions
            .iter()
            .find(|p| matches_action(p, action))
        {
            return ComplianceDecision::deny(format!(
                "action '{}' denied by pattern '{}' of agreement {}",
                action, pattern, self.agreement_id
            ));
        }
        let allowed = self.constraints.allowed_actions.is_empty()
            || self
                .constraints
                .allowed_actions
                .iter()
                .any(|p| matches_action(p, action));
        if allowed {
            ComplianceDecision::allow(format!(
                "action '{}' permitted by agreement {} ({} ethics rules)",
                action,
                self.agreement_id,
                self.ethics_rules.len()
            ))
        } else {
            ComplianceDecision::deny(format!(
                "action '{}' not in allowlist of agreement {}",
                action, self.agreement_id
            ))
        }
    }
}

fn list_hash(items: &[String]) -> ContentHash {
    let fields: Vec<&[u8]> = items.iter().map(|item| item.as_bytes()).collect();
    ContentHash::of_fields(&fields)
}

fn matches_action(pattern: &str, action: &str) -> bool {
    if pattern == "*" || pattern == action {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => action.starts_with(prefix),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceDecision {
    pub compliant: bool,
    pub reason: String,
}

impl ComplianceDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            compliant: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            compliant: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Unknown agreement: {0}")]
    UnknownAgreement(AgreementRef),

    #[error("Agreement hash mismatch for {0}")]
    HashMismatch(AgreementRef),

    #[error("Policy authority unavailable: {0}")]
    Unavailable(String),
}

impl From<PolicyError> for CoreError {
    fn from(err: PolicyError) -> Self {
        CoreError::ConstraintViolation(format!("policy: {err}"))
    }
}

/// External policy/agreement authority (`CheckCompliance`).
#[async_trait]
pub trait PolicyAuthority: Send + Sync {
    async fn check_compliance(
        &self,
        agreement_ref: &AgreementRef,
        action: &str,
    ) -> Result<ComplianceDecision, PolicyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agreement(allowed: &[&str], denied: &[&str]) -> Agreement {
        Agreement::issue(
            AgreementRef::new("agr-1"),
            vec!["no-harm".to_string()],
            AgreementConstraints {
                allowed_actions: allowed.iter().map(|s| s.to_string()).collect(),
                denied_actions: denied.iter().map(|s| s.to_string()).collect(),
            },
            Utc::now() + Duration::hours(1),
        )
    }

    #[test]
    fn test_issued_agreement_hash_is_consistent() {
        let mut agr = agreement(&[], &[]);
        assert!(agr.hash_is_consistent());
        agr.ethics_rules.push("tampered".to_string());
        assert!(!agr.hash_is_consistent());
    }

    #[test]
    fn test_rule_boundaries_are_part_of_the_hash() {
        let until = Utc::now() + Duration::hours(1);
        let constraints = AgreementConstraints::default();
        let id = AgreementRef::new("agr-1");
        let joined = Agreement::compute_hash(&id, &["a\nb".to_string()], &constraints, until);
        let split = Agreement::compute_hash(
            &id,
            &["a".to_string(), "b".to_string()],
            &constraints,
            until,
        );
        assert_ne!(joined, split);

        let allowed = AgreementConstraints {
            allowed_actions: vec!["x".to_string()],
            ..Default::default()
        };
        let denied = AgreementConstraints {
            denied_actions: vec!["x".to_string()],
            ..Default::default()
        };
        assert_ne!(
            Agreement::compute_hash(&id, &[], &allowed, until),
            Agreement::compute_hash(&id, &[], &denied, until)
        );
    }

    #[test]
    fn test_prefix_patterns_and_denials() {
        let agr = agreement(&["agent.execute:*"], &["agent.execute:delete"]);
        let now = Utc::now();
        assert!(agr.evaluate("agent.execute:summarize", now).compliant);
        assert!(!agr.evaluate("agent.execute:delete", now).compliant);
        assert!(!agr.evaluate("consensus.commit:deploy", now).compliant);
    }

    #[test]
    fn test_expired_agreement_denies_everything() {
        let agr = agreement(&["*"], &[]);
        let decision = agr.evaluate("agent.execute:x", agr.valid_until);
        assert!(!decision.compliant);
        assert!(decision.reason.contains("expired"));
    }
}
