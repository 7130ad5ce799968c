// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Agreement Registry
//!
//! In-process [`PolicyAuthority`] backed by a table of issued agreements.
//! Every compliance check re-verifies the agreement's hash before evaluating
//! the action, so an agreement edited after issue is refused rather than
//! silently trusted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::domain::agreement::{
    Agreement, AgreementRef, ComplianceDecision, PolicyAuthority, PolicyError,
};
use crate::domain::clock::{Clock, SystemClock};

pub struct AgreementRegistry {
    agreements: DashMap<AgreementRef, Agreement>,
    clock: Arc<dyn Clock>,
    latency: Option<Duration>,
    unavailable: AtomicBool,
}

impl AgreementRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            agreements: DashMap::new(),
            clock,
            latency: None,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Every compliance check sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Registers (or replaces) an agreement.
    pub fn register(&self, agreement: Agreement) {
        debug!(agreement = %agreement.agreement_id, "Agreement registered");
        self.agreements
            .insert(agreement.agreement_id.clone(), agreement);
    }

    pub fn revoke(&self, agreement_ref: &AgreementRef) -> bool {
        self.agreements.remove(agreement_ref).is_some()
    }

    pub fn get(&self, agreement_ref: &AgreementRef) -> Option<Agreement> {
        self.agreements.get(agreement_ref).map(|a| a.clone())
    }
}

impl Default for AgreementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyAuthority for AgreementRegistry {
    async fn check_compliance(
        &self,
        agreement_ref: &AgreementRef,
        action: &str,
    ) -> Result<ComplianceDecision, PolicyError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PolicyError::Unavailable(
                "agreement registry is offline".to_string(),
            ));
        }
        let agreement = self
            .get(agreement_ref)
            .ok_or_else(|| PolicyError::UnknownAgreement(agreement_ref.clone()))?;
        if !agreement.hash_is_consistent() {
            warn!(agreement = %agreement_ref, "Agreement hash does not match its contents");
            return Err(PolicyError::HashMismatch(agreement_ref.clone()));
        }
        let decision = agreement.evaluate(action, self.clock.now());
        debug!(
            agreement = %agreement_ref,
            action,
            compliant = decision.compliant,
            "Compliance checked"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agreement::AgreementConstraints;
    use crate::domain::clock::ManualClock;
    use chrono::{Duration as ChronoDuration, Utc};

    fn agreement(id: &str, valid_for: ChronoDuration) -> Agreement {
        Agreement::issue(
            AgreementRef::new(id),
            vec!["no-exfiltration".to_string()],
            AgreementConstraints {
                allowed_actions: vec!["agent.execute:*".to_string()],
                denied_actions: vec!["agent.execute:wipe".to_string()],
            },
            Utc::now() + valid_for,
        )
    }

    #[tokio::test]
    async fn test_known_agreement_is_evaluated() {
        let registry = AgreementRegistry::new();
        registry.register(agreement("agr-1", ChronoDuration::hours(1)));
        let agr = AgreementRef::new("agr-1");

        let ok = registry.check_compliance(&agr, "agent.execute:summarize").await.unwrap();
        assert!(ok.compliant);
        let denied = registry.check_compliance(&agr, "agent.execute:wipe").await.unwrap();
        assert!(!denied.compliant);
    }

    #[tokio::test]
    async fn test_unknown_and_tampered_agreements_error() {
        let registry = AgreementRegistry::new();
        assert!(matches!(
            registry.check_compliance(&AgreementRef::new("missing"), "x").await,
            Err(PolicyError::UnknownAgreement(_))
        ));

        let mut tampered = agreement("agr-2", ChronoDuration::hours(1));
        tampered.constraints.denied_actions.clear();
        registry.register(tampered);
        assert!(matches!(
            registry.check_compliance(&AgreementRef::new("agr-2"), "x").await,
            Err(PolicyError::HashMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_expiry_follows_registry_clock() {
        let clock = ManualClock::default();
        let registry = AgreementRegistry::with_clock(Arc::new(clock.clone()));
        registry.register(agreement("agr-3", ChronoDuration::minutes(5)));
        let agr = AgreementRef::new("agr-3");

        assert!(registry.check_compliance(&agr, "agent.execute:a").await.unwrap().compliant);
        clock.advance(ChronoDuration::minutes(10));
        assert!(!registry.check_compliance(&agr, "agent.execute:a").await.unwrap().compliant);
    }

    #[tokio::test]
    async fn test_outage_is_an_error() {
        let registry = AgreementRegistry::new();
        registry.register(agreement("agr-4", ChronoDuration::hours(1)));
        registry.set_unavailable(true);
        assert!(matches!(
            registry.check_compliance(&AgreementRef::new("agr-4"), "x").await,
            Err(PolicyError::Unavailable(_))
        ));
        assert!(registry.revoke(&AgreementRef::new("agr-4")));
    }
}
