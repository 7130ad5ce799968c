// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end scenarios through the `CovenantCore` facade.
//!
//! Covers:
//! - Memory paths verifying from child to root
//! - Weighted approvals reaching quorum and committing
//! - Commit after proposal timeout
//! - Operations on terminated agents publishing nothing

use std::sync::Arc;
use std::time::Duration;

use covenant_core::application::{CastVote, ExecuteRequest, ProposeRequest};
use covenant_core::domain::agent::{AgentConstraints, AgentStatus, PluginId};
use covenant_core::domain::agreement::{Agreement, AgreementConstraints, AgreementRef};
use covenant_core::domain::clock::{Clock, ManualClock};
use covenant_core::domain::config::CoreConfigManifest;
use covenant_core::domain::consensus::{ProposalState, VoteDecision};
use covenant_core::domain::memory::NewMemoryNode;
use covenant_core::infrastructure::event_bus::EventBusError;
use covenant_core::infrastructure::{AgreementRegistry, InMemoryKernel, InMemoryPluginSandbox};
use covenant_core::{CoreError, CovenantCore};
use serde_json::json;
use tokio::time::Instant;

fn manual_core() -> (CovenantCore, ManualClock) {
    let clock = ManualClock::default();
    let core = CovenantCore::builder(CoreConfigManifest::default())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    (core, clock)
}

fn approve(voter: &str, weight: u64) -> CastVote {
    CastVote::new(voter, VoteDecision::Approve, weight).signed(format!("{voter}-sig"))
}

#[tokio::test]
async fn memory_path_verifies_from_child_to_root() {
    let core = CovenantCore::in_memory().unwrap();
    let a1 = core.spawn_agent(AgentConstraints::default()).await.unwrap();

    let n1 = core
        .insert_memory(&a1, NewMemoryNode::root("goal: summarize", "goal").with_id("n1"))
        .unwrap();
    let n2 = core
        .insert_memory(&a1, NewMemoryNode::child_of(n1.clone(), "step 1", "step").with_id("n2"))
        .unwrap();

    let verification = core.verify_memory_path(&n2).unwrap();
    assert!(verification.valid);
    assert_eq!(verification.checked, 2);

    let keys: Vec<String> = core
        .query_memory(&a1, "n1/")
        .unwrap()
        .into_iter()
        .map(|n| n.node_id.to_string())
        .collect();
    assert_eq!(keys, vec!["n2".to_string()]);
}

#[tokio::test]
async fn memory_parent_must_belong_to_same_agent() {
    let core = CovenantCore::in_memory().unwrap();
    let a1 = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    let a2 = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    let root = core
        .insert_memory(&a1, NewMemoryNode::root("mine", "note"))
        .unwrap();

    assert!(matches!(
        core.insert_memory(&a2, NewMemoryNode::child_of(root, "theirs", "note")),
        Err(CoreError::NotFound { .. })
    ));
    assert!(core.query_memory(&a2, "").unwrap().is_empty());
}

#[tokio::test]
async fn weighted_approvals_reach_quorum_and_commit() {
    let core = CovenantCore::in_memory().unwrap();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    let p1 = core
        .propose_consensus(ProposeRequest::new(agent, "deploy", 3))
        .unwrap();

    core.cast_vote(&p1, approve("v1", 2)).unwrap();
    core.cast_vote(&p1, approve("v2", 1)).unwrap();
    let commitment = core.commit_consensus(&p1, None, None).await.unwrap();

    let proposal = core.get_proposal(&p1).unwrap();
    assert_eq!(proposal.state, ProposalState::Committed);
    assert_eq!(proposal.tally().approve_weight, 3);
    assert_eq!(commitment.tally_hash, proposal.tally_hash());
    assert!(core.verify_commitment(&commitment.commitment_id).unwrap().valid);
}

#[tokio::test]
async fn commit_after_timeout_is_expired() {
    let (core, clock) = manual_core();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    let p2 = core
        .propose_consensus(
            ProposeRequest::new(agent, "deploy", 1).with_timeout(Duration::from_secs(1)),
        )
        .unwrap();
    core.cast_vote(&p2, approve("v1", 1)).unwrap();

    clock.advance(chrono::Duration::seconds(2));
    assert!(matches!(
        core.commit_consensus(&p2, None, None).await,
        Err(CoreError::Expired(_))
    ));
    assert_eq!(core.get_proposal(&p2).unwrap().state, ProposalState::Expired);
}

#[tokio::test]
async fn execute_on_terminated_agent_is_invalid_and_silent() {
    let core = CovenantCore::in_memory().unwrap();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    core.terminate_agent(&agent).await.unwrap();
    assert_eq!(core.get_agent(&agent).unwrap().status, AgentStatus::Archived);

    let mut events = core.event_bus().watch();
    let result = core
        .execute_intent(&agent, ExecuteRequest::new("summarize", json!({})))
        .await;
    assert!(matches!(result, Err(CoreError::InvalidState(_))));
    assert!(matches!(events.try_recv(), Err(EventBusError::Empty)));
}

#[tokio::test]
async fn execute_checks_agreement_and_deadline() {
    let clock = ManualClock::default();
    let registry = Arc::new(AgreementRegistry::with_clock(Arc::new(clock.clone())));
    registry.register(Agreement::issue(
        AgreementRef::new("agr-ops"),
        vec!["no-destructive-actions".to_string()],
        AgreementConstraints {
            allowed_actions: vec!["agent.execute:*".to_string()],
            denied_actions: vec!["agent.execute:delete".to_string()],
        },
        clock.now() + chrono::Duration::hours(1),
    ));
    let core = CovenantCore::builder(CoreConfigManifest::default())
        .kernel(Arc::new(
            InMemoryKernel::new().with_execute_delay(Duration::from_millis(200)),
        ))
        .policy(registry)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();

    let denied = core
        .execute_intent(
            &agent,
            ExecuteRequest::new("delete", json!({})).with_agreement(AgreementRef::new("agr-ops")),
        )
        .await;
    assert!(matches!(denied, Err(CoreError::ConstraintViolation(_))));

    let late = core
        .execute_intent(
            &agent,
            ExecuteRequest::new("summarize", json!({}))
                .with_agreement(AgreementRef::new("agr-ops"))
                .with_deadline(Instant::now() + Duration::from_millis(10)),
        )
        .await;
    assert!(matches!(late, Err(CoreError::Timeout(_))));
    assert_eq!(core.get_agent(&agent).unwrap().execution_count, 0);

    let outcome = core
        .execute_intent(
            &agent,
            ExecuteRequest::new("summarize", json!({ "doc": 7 }))
                .with_agreement(AgreementRef::new("agr-ops")),
        )
        .await
        .unwrap();
    assert_eq!(outcome.agent_id, agent);
    assert_eq!(outcome.result["params"], json!({ "doc": 7 }));
    assert_eq!(core.get_agent(&agent).unwrap().execution_count, 1);
}

#[tokio::test]
async fn recovered_agent_is_a_new_identity_with_plugins() {
    let sandbox = Arc::new(InMemoryPluginSandbox::new());
    sandbox.register(
        PluginId::new("search"),
        vec!["web.search".to_string()],
    );
    let core = CovenantCore::builder(CoreConfigManifest::default())
        .sandbox(sandbox)
        .build()
        .unwrap();

    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    core.attach_plugin(&agent, PluginId::new("search"))
        .await
        .unwrap();
    assert!(matches!(
        core.attach_plugin(&agent, PluginId::new("unknown")).await,
        Err(CoreError::ConstraintViolation(_))
    ));

    let snapshot = core.snapshot_agent(&agent).await.unwrap();
    let recovered = core.recover_agent(&snapshot).await.unwrap();
    assert_ne!(recovered, agent);

    let restored = core.get_agent(&recovered).unwrap();
    assert_eq!(restored.status, AgentStatus::Active);
    assert_eq!(restored.plugin_ids, vec![PluginId::new("search")]);
    assert_eq!(restored.recovered_from, Some(snapshot));
    assert_eq!(core.list_agents().len(), 2);
}
