// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Property-style checks over small exhaustive grids.
//!
//! - Every inserted memory node verifies
//! - Prefix queries are stable without intervening writes
//! - Commit succeeds exactly when quorum is met before the timeout, and
//!   repeated commits return the same commitment
//! - Concurrent writers on different agents do not interfere

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use covenant_core::application::{CastVote, ProposeRequest};
use covenant_core::domain::agent::AgentConstraints;
use covenant_core::domain::clock::ManualClock;
use covenant_core::domain::config::CoreConfigManifest;
use covenant_core::domain::consensus::VoteDecision;
use covenant_core::domain::memory::{NewMemoryNode, NodeId};
use covenant_core::{CoreError, CovenantCore};

fn manual_core() -> (CovenantCore, ManualClock) {
    let clock = ManualClock::default();
    let core = CovenantCore::builder(CoreConfigManifest::default())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    (core, clock)
}

#[tokio::test]
async fn every_inserted_node_verifies() {
    let core = CovenantCore::in_memory().unwrap();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();

    // Three levels, fan-out of three
    let mut inserted: Vec<NodeId> = Vec::new();
    let mut frontier: Vec<Option<NodeId>> = vec![None];
    for depth in 0..3 {
        let mut next = Vec::new();
        for parent in &frontier {
            for i in 0..3 {
                let content = format!("depth {depth} item {i}");
                let node = match parent {
                    Some(parent) => NewMemoryNode::child_of(parent.clone(), content, "note"),
                    None => NewMemoryNode::root(content, "note"),
                };
                let id = core.insert_memory(&agent, node).unwrap();
                inserted.push(id.clone());
                next.push(Some(id));
            }
        }
        frontier = next;
    }

    assert_eq!(inserted.len(), 3 + 9 + 27);
    for id in &inserted {
        let verification = core.verify_memory_path(id).unwrap();
        assert!(verification.valid, "node {id} failed: {:?}", verification.reason);
    }
}

#[tokio::test]
async fn prefix_queries_are_stable() {
    let core = CovenantCore::in_memory().unwrap();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    let root = core
        .insert_memory(&agent, NewMemoryNode::root("root", "goal").with_id("plan"))
        .unwrap();
    for i in 0..5 {
        core.insert_memory(
            &agent,
            NewMemoryNode::child_of(root.clone(), format!("step {i}"), "step").with_id(format!("s{i}")),
        )
        .unwrap();
    }

    let ids = |prefix: &str| -> BTreeSet<NodeId> {
        core.query_memory(&agent, prefix)
            .unwrap()
            .into_iter()
            .map(|n| n.node_id)
            .collect()
    };
    let first = ids("plan/");
    assert_eq!(first.len(), 5);
    assert_eq!(first, ids("plan/"));
    assert_eq!(ids("plan").len(), 6);
    assert!(ids("nothing").is_empty());
}

#[tokio::test]
async fn commit_succeeds_iff_quorum_before_timeout() {
    for approve_weight in 0..=4u64 {
        for expired in [false, true] {
            let (core, clock) = manual_core();
            let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
            let proposal = core
                .propose_consensus(
                    ProposeRequest::new(agent, "deploy", 3).with_timeout(Duration::from_secs(10)),
                )
                .unwrap();
            if approve_weight > 0 {
                core.cast_vote(
                    &proposal,
                    CastVote::new("v1", VoteDecision::Approve, approve_weight),
                )
                .unwrap();
            }
            if expired {
                clock.advance(chrono::Duration::seconds(10));
            }

            let result = core.commit_consensus(&proposal, None, None).await;
            match (approve_weight >= 3, expired) {
                (true, false) => {
                    let first = result.unwrap();
                    let second = core.commit_consensus(&proposal, None, None).await.unwrap();
                    assert_eq!(first.commitment_id, second.commitment_id);
                    assert!(core.verify_commitment(&first.commitment_id).unwrap().valid);
                }
                (_, true) => assert!(
                    matches!(result, Err(CoreError::Expired(_))),
                    "weight {approve_weight}: {result:?}"
                ),
                (false, false) => assert!(
                    matches!(result, Err(CoreError::QuorumNotReached { .. })),
                    "weight {approve_weight}: {result:?}"
                ),
            }
        }
    }
}

#[tokio::test]
async fn committed_proposal_rejects_further_votes() {
    let core = CovenantCore::in_memory().unwrap();
    let agent = core.spawn_agent(AgentConstraints::default()).await.unwrap();
    let proposal = core
        .propose_consensus(ProposeRequest::new(agent, "deploy", 1))
        .unwrap();
    core.cast_vote(&proposal, CastVote::new("v1", VoteDecision::Approve, 1))
        .unwrap();
    core.commit_consensus(&proposal, None, None).await.unwrap();

    assert!(matches!(
        core.cast_vote(&proposal, CastVote::new("v2", VoteDecision::Approve, 1)),
        Err(CoreError::InvalidState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agents_write_memory_concurrently() {
    let core = Arc::new(CovenantCore::in_memory().unwrap());
    let mut agents = Vec::new();
    for _ in 0..4 {
        agents.push(core.spawn_agent(AgentConstraints::default()).await.unwrap());
    }

    let mut handles = Vec::new();
    for agent in agents.clone() {
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            let root = core
                .insert_memory(&agent, NewMemoryNode::root("root", "goal"))
                .unwrap();
            for i in 0..50 {
                core.insert_memory(
                    &agent,
                    NewMemoryNode::child_of(root.clone(), format!("step {i}"), "step"),
                )
                .unwrap();
                if i % 10 == 0 {
                    core.compact_memory(&agent).unwrap();
                }
            }
            root
        }));
    }

    for (agent, handle) in agents.iter().zip(handles) {
        let root = handle.await.unwrap();
        let nodes = core.query_memory(agent, "").unwrap();
        assert_eq!(nodes.len(), 51);
        assert!(core.verify_memory_path(&root).unwrap().valid);
    }
}
