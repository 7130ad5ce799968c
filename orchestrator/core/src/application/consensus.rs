// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Consensus Engine Application Service
//!
//! Runs propose / vote / commit / verify over [`ConsensusProposal`]s.
//!
//! The proposal and commitment tables share one structure-wide
//! `parking_lot::RwLock`. Reads (tallies, lookups, verification) take the
//! read side; votes, commits and expiry take the write side. The lock is
//! never held across an `.await`: `commit` consults the policy authority
//! first, then re-validates everything under the write lock before it
//! attests and records the commitment.
//!
//! Expiry is lazy (applied on the next read, vote or commit of an overdue
//! proposal). [`ConsensusReaper`] sweeps periodically so observers learn
//! about expiry without having to poke the proposal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::deadline::within_deadline;
use crate::domain::agent::AgentId;
use crate::domain::agreement::{AgreementRef, PolicyAuthority};
use crate::domain::clock::Clock;
use crate::domain::config::ConsensusConfig;
use crate::domain::consensus::{
    Commitment, CommitmentId, CommitmentVerification, ConsensusProposal, ProposalId,
    ProposalState, Tally, Vote, VoteDecision, VoterId,
};
use crate::domain::error::{CoreError, CoreResult, ResourceKind};
use crate::domain::events::{Event, EventType};
use crate::domain::proof::{ProofStatement, ProofSystem};
use crate::infrastructure::event_bus::EventBus;

const SOURCE: &str = "consensus";

/// Policy action name checked when committing a proposal of `proposal_type`.
pub fn commit_action(proposal_type: &str) -> String {
    format!("consensus.commit:{proposal_type}")
}

#[derive(Debug, Clone)]
pub struct ProposeRequest {
    pub agent_id: AgentId,
    pub proposal_type: String,
    pub required_weight: u64,
    /// Defaults to the configured proposal timeout.
    pub timeout: Option<Duration>,
    /// Defaults to the configured participation floor.
    pub participation_floor: Option<u64>,
}

impl ProposeRequest {
    pub fn new(agent_id: AgentId, proposal_type: impl Into<String>, required_weight: u64) -> Self {
        Self {
            agent_id,
            proposal_type: proposal_type.into(),
            required_weight,
            timeout: None,
            participation_floor: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_participation_floor(mut self, floor: u64) -> Self {
        self.participation_floor = Some(floor);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CastVote {
    pub voter_id: VoterId,
    pub decision: VoteDecision,
    pub weight: u64,
    /// Recorded verbatim and folded into the tally hash.
    pub signature: String,
}

impl CastVote {
    pub fn new(voter_id: impl Into<String>, decision: VoteDecision, weight: u64) -> Self {
        Self {
            voter_id: VoterId::new(voter_id),
            decision,
            weight,
            signature: String::new(),
        }
    }

    pub fn signed(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }
}

#[derive(Default)]
struct ConsensusTables {
    proposals: HashMap<ProposalId, ConsensusProposal>,
    commitments: HashMap<CommitmentId, Commitment>,
    by_proposal: HashMap<ProposalId, CommitmentId>,
}

impl ConsensusTables {
    fn existing_commitment(&self, proposal_id: &ProposalId) -> Option<Commitment> {
        self.by_proposal
            .get(proposal_id)
            .and_then(|id| self.commitments.get(id))
            .cloned()
    }
}

/// Events decided under the lock, published after it is released.
enum Outcome {
    Expired(ConsensusProposal),
    Rejected(ConsensusProposal, Tally),
}

pub struct ConsensusEngine {
    tables: RwLock<ConsensusTables>,
    proof_system: Arc<dyn ProofSystem>,
    policy: Arc<dyn PolicyAuthority>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(
        proof_system: Arc<dyn ProofSystem>,
        policy: Arc<dyn PolicyAuthority>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            tables: RwLock::new(ConsensusTables::default()),
            proof_system,
            policy,
            event_bus,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    fn publish(&self, event_type: EventType, proposal_id: &ProposalId, payload: serde_json::Value) {
        self.event_bus.publish(Event::new(
            event_type,
            SOURCE,
            Some(proposal_id.to_string()),
            payload,
        ));
    }

    fn publish_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Expired(proposal) => {
                info!(proposal_id = %proposal.proposal_id, "Proposal expired");
                self.publish(
                    EventType::ConsensusExpired,
                    &proposal.proposal_id,
                    json!({
                        "proposal_id": proposal.proposal_id,
                        "agent_id": proposal.agent_id,
                        "timeout_at": proposal.timeout_at,
                        "tally": proposal.tally(),
                    }),
                );
            }
            Outcome::Rejected(proposal, tally) => {
                info!(
                    proposal_id = %proposal.proposal_id,
                    reject_weight = tally.reject_weight,
                    "Proposal rejected"
                );
                self.publish(
                    EventType::ConsensusRejected,
                    &proposal.proposal_id,
                    json!({
                        "proposal_id": proposal.proposal_id,
                        "agent_id": proposal.agent_id,
                        "tally": tally,
                    }),
                );
            }
        }
    }

    pub fn propose(&self, request: ProposeRequest) -> CoreResult<ProposalId> {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let timeout = chrono::Duration::from_std(timeout).map_err(|_| {
            CoreError::ConstraintViolation(format!("proposal timeout {timeout:?} is out of range"))
        })?;
        let now = self.clock.now();
        let timeout_at = now.checked_add_signed(timeout).ok_or_else(|| {
            CoreError::ConstraintViolation("proposal timeout overflows the clock".to_string())
        })?;

        let mut proposal = ConsensusProposal::new(
            request.agent_id,
            request.proposal_type,
            request.required_weight,
            request
                .participation_floor
                .unwrap_or(self.config.participation_floor),
            now,
            timeout_at,
        );
        proposal.open_voting()?;
        let proposal_id = proposal.proposal_id;
        let payload = json!({
            "proposal_id": proposal_id,
            "agent_id": proposal.agent_id,
            "proposal_type": proposal.proposal_type,
            "required_weight": proposal.required_weight,
            "participation_floor": proposal.participation_floor,
            "timeout_at": proposal.timeout_at,
        });
        self.tables.write().proposals.insert(proposal_id, proposal);

        info!(proposal_id = %proposal_id, "Proposal opened for voting");
        self.publish(EventType::ConsensusProposed, &proposal_id, payload);
        Ok(proposal_id)
    }

    /// Upserts a vote and returns the recomputed tally. Publishes
    /// `consensus.voted` on every accepted vote.
    pub fn vote(&self, proposal_id: &ProposalId, cast: CastVote) -> CoreResult<Tally> {
        let now = self.clock.now();
        let vote = Vote {
            voter_id: cast.voter_id,
            proposal_id: *proposal_id,
            decision: cast.decision,
            weight: cast.weight,
            signature: cast.signature,
            cast_at: now,
        };

        let (tally, outcome) = {
            let mut tables = self.tables.write();
            let proposal = tables
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| CoreError::not_found(ResourceKind::Proposal, proposal_id))?;

            if proposal.expire_if_due(now) {
                let expired = proposal.clone();
                drop(tables);
                self.publish_outcome(Outcome::Expired(expired));
                return Err(CoreError::Expired(proposal_id.to_string()));
            }

            let tally = proposal.record_vote(vote.clone(), now)?;
            let outcome = (proposal.state == ProposalState::Rejected)
                .then(|| Outcome::Rejected(proposal.clone(), tally));
            (tally, outcome)
        };

        debug!(
            proposal_id = %proposal_id,
            voter_id = %vote.voter_id,
            approve_weight = tally.approve_weight,
            required_weight = tally.required_weight,
            "Vote recorded"
        );
        metrics::counter!("covenant_votes_cast_total").increment(1);
        self.publish(
            EventType::ConsensusVoted,
            proposal_id,
            json!({
                "proposal_id": proposal_id,
                "voter_id": vote.voter_id,
                "decision": vote.decision,
                "weight": vote.weight,
                "tally": tally,
            }),
        );
        if let Some(outcome) = outcome {
            self.publish_outcome(outcome);
        }
        Ok(tally)
    }

    /// Runs `read` against a proposal, first applying lazy expiry if the
    /// proposal is overdue.
    fn read_proposal<T>(
        &self,
        proposal_id: &ProposalId,
        read: impl FnOnce(&ConsensusProposal, &ConsensusTables) -> T,
    ) -> CoreResult<T> {
        let now = self.clock.now();
        {
            let tables = self.tables.read();
            let proposal = tables
                .proposals
                .get(proposal_id)
                .ok_or_else(|| CoreError::not_found(ResourceKind::Proposal, proposal_id))?;
            if proposal.state.is_terminal() || !proposal.is_past_timeout(now) {
                return Ok(read(proposal, &*tables));
            }
        }

        let mut tables = self.tables.write();
        let proposal = tables
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| CoreError::not_found(ResourceKind::Proposal, proposal_id))?;
        let expired = proposal.expire_if_due(now).then(|| proposal.clone());
        let out = match tables.proposals.get(proposal_id) {
            Some(proposal) => read(proposal, &*tables),
            None => return Err(CoreError::not_found(ResourceKind::Proposal, proposal_id)),
        };
        drop(tables);
        if let Some(expired) = expired {
            self.publish_outcome(Outcome::Expired(expired));
        }
        Ok(out)
    }

    pub fn get(&self, proposal_id: &ProposalId) -> CoreResult<ConsensusProposal> {
        self.read_proposal(proposal_id, |p, _| p.clone())
    }

    pub fn tally(&self, proposal_id: &ProposalId) -> CoreResult<Tally> {
        self.read_proposal(proposal_id, |p, _| p.tally())
    }

    pub fn list(&self) -> Vec<ConsensusProposal> {
        self.tables.read().proposals.values().cloned().collect()
    }

    /// Finalizes a proposal that reached quorum before its timeout.
    ///
    /// Idempotent: once committed, every later call returns the same
    /// commitment. When `agreement_ref` is given, the policy authority must
    /// find `consensus.commit:<proposal_type>` compliant first. That check
    /// runs under `deadline`; on timeout nothing is recorded.
    pub async fn commit(
        &self,
        proposal_id: &ProposalId,
        agreement_ref: Option<AgreementRef>,
        deadline: Option<Instant>,
    ) -> CoreResult<Commitment> {
        let proposal_type = match self.check_committable(proposal_id)? {
            Committable::Already(commitment) => return Ok(commitment),
            Committable::Ready { proposal_type } => proposal_type,
        };

        within_deadline(deadline, "commit", async {
            if let Some(agreement_ref) = &agreement_ref {
                let decision = self
                    .policy
                    .check_compliance(agreement_ref, &commit_action(&proposal_type))
                    .await?;
                if !decision.compliant {
                    return Err(CoreError::ConstraintViolation(decision.reason));
                }
            }
            Ok::<_, CoreError>(())
        })
        .await?;

        let now = self.clock.now();
        let commitment = {
            let mut tables = self.tables.write();
            if let Some(existing) = tables.existing_commitment(proposal_id) {
                return Ok(existing);
            }
            let proposal = tables
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| CoreError::not_found(ResourceKind::Proposal, proposal_id))?;

            if proposal.expire_if_due(now) {
                let expired = proposal.clone();
                drop(tables);
                self.publish_outcome(Outcome::Expired(expired));
                return Err(CoreError::Expired(proposal_id.to_string()));
            }
            ensure_committable(proposal)?;

            let tally_hash = proposal.tally_hash();
            let statement = ProofStatement::new(proposal_id.to_string(), tally_hash.clone());
            let proof = self.proof_system.attest(&statement)?;
            proposal.mark_committed()?;

            let commitment = Commitment {
                commitment_id: CommitmentId::new(),
                proposal_id: *proposal_id,
                timestamp: now,
                tally_hash,
                proof,
                agreement_ref,
            };
            tables
                .commitments
                .insert(commitment.commitment_id, commitment.clone());
            tables
                .by_proposal
                .insert(*proposal_id, commitment.commitment_id);
            commitment
        };

        let tally = self.tally(proposal_id)?;
        info!(
            proposal_id = %proposal_id,
            commitment_id = %commitment.commitment_id,
            approve_weight = tally.approve_weight,
            "Proposal committed"
        );
        metrics::counter!("covenant_commitments_created_total").increment(1);
        self.publish(
            EventType::ConsensusCommitted,
            proposal_id,
            json!({
                "proposal_id": proposal_id,
                "commitment_id": commitment.commitment_id,
                "tally": tally,
                "tally_hash": commitment.tally_hash,
                "proof_scheme": commitment.proof.scheme,
                "agreement_ref": commitment.agreement_ref,
            }),
        );
        Ok(commitment)
    }

    fn check_committable(&self, proposal_id: &ProposalId) -> CoreResult<Committable> {
        self.read_proposal(proposal_id, |proposal, tables| {
            if let Some(existing) = tables.existing_commitment(proposal_id) {
                return Ok(Committable::Already(existing));
            }
            if proposal.state == ProposalState::Expired {
                return Err(CoreError::Expired(proposal_id.to_string()));
            }
            ensure_committable(proposal)?;
            Ok(Committable::Ready {
                proposal_type: proposal.proposal_type.clone(),
            })
        })?
    }

    pub fn get_commitment(&self, commitment_id: &CommitmentId) -> CoreResult<Commitment> {
        self.tables
            .read()
            .commitments
            .get(commitment_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(ResourceKind::Commitment, commitment_id))
    }

    pub fn commitment_for(&self, proposal_id: &ProposalId) -> Option<Commitment> {
        self.tables.read().existing_commitment(proposal_id)
    }

    /// Recomputes the tally hash from the stored votes and re-checks the
    /// proof. A mismatch yields `valid = false` with a reason and publishes
    /// `audit.integrity_violation`.
    pub fn verify(&self, commitment_id: &CommitmentId) -> CoreResult<CommitmentVerification> {
        let verification = {
            let tables = self.tables.read();
            let commitment = tables
                .commitments
                .get(commitment_id)
                .ok_or_else(|| CoreError::not_found(ResourceKind::Commitment, commitment_id))?;
            let proposal = tables.proposals.get(&commitment.proposal_id).ok_or_else(|| {
                CoreError::not_found(ResourceKind::Proposal, commitment.proposal_id)
            })?;

            let recomputed = proposal.tally_hash();
            let tally_matches = recomputed == commitment.tally_hash;
            let statement = ProofStatement::new(
                commitment.proposal_id.to_string(),
                commitment.tally_hash.clone(),
            );
            let proof_valid = self.proof_system.verify(&statement, &commitment.proof);

            let reason = match (tally_matches, proof_valid) {
                (true, true) => None,
                (false, _) => Some(format!(
                    "tally hash {} recomputed from stored votes does not match committed {}",
                    recomputed, commitment.tally_hash
                )),
                (true, false) => Some(format!(
                    "{} proof does not verify for proposal {}",
                    commitment.proof.scheme, commitment.proposal_id
                )),
            };
            CommitmentVerification {
                commitment_id: *commitment_id,
                valid: tally_matches && proof_valid,
                tally_matches,
                proof_valid,
                reason,
            }
        };

        if !verification.valid {
            warn!(
                commitment_id = %commitment_id,
                reason = ?verification.reason,
                "Commitment verification failed"
            );
            metrics::counter!("covenant_integrity_violations_total", "component" => SOURCE)
                .increment(1);
            self.event_bus.publish(Event::new(
                EventType::AuditIntegrityViolation,
                SOURCE,
                Some(commitment_id.to_string()),
                json!({
                    "commitment_id": commitment_id,
                    "tally_matches": verification.tally_matches,
                    "proof_valid": verification.proof_valid,
                    "reason": verification.reason,
                }),
            ));
        }
        Ok(verification)
    }

    /// Expires every overdue, non-terminal proposal. Returns their ids.
    pub fn expire_overdue(&self) -> Vec<ProposalId> {
        let now = self.clock.now();
        let expired: Vec<ConsensusProposal> = {
            let mut tables = self.tables.write();
            tables
                .proposals
                .values_mut()
                .filter_map(|p| p.expire_if_due(now).then(|| p.clone()))
                .collect()
        };
        let ids = expired.iter().map(|p| p.proposal_id).collect();
        for proposal in expired {
            self.publish_outcome(Outcome::Expired(proposal));
        }
        ids
    }

    /// Mutates a recorded vote in place, bypassing the state machine.
    #[cfg(test)]
    pub(crate) fn tamper_vote(
        &self,
        proposal_id: &ProposalId,
        voter_id: &VoterId,
        mutate: impl FnOnce(&mut Vote),
    ) {
        let mut tables = self.tables.write();
        if let Some(vote) = tables
            .proposals
            .get_mut(proposal_id)
            .and_then(|p| p.votes.get_mut(voter_id))
        {
            mutate(vote);
        }
    }
}

enum Committable {
    Already(Commitment),
    Ready { proposal_type: String },
}

fn ensure_committable(proposal: &ConsensusProposal) -> CoreResult<()> {
    if proposal.state != ProposalState::Voting {
        return Err(CoreError::InvalidState(format!(
            "proposal {} is {}, only Voting proposals can be committed",
            proposal.proposal_id, proposal.state
        )));
    }
    let tally = proposal.tally();
    if !tally.quorum_reached {
        return Err(CoreError::QuorumNotReached {
            approve_weight: tally.approve_weight,
            required_weight: tally.required_weight,
        });
    }
    Ok(())
}

/// Background sweep that expires overdue proposals so `consensus.expired`
/// reaches observers without waiting for the next read.
pub struct ConsensusReaper {
    engine: Arc<ConsensusEngine>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl ConsensusReaper {
    pub fn new(engine: Arc<ConsensusEngine>, interval: Duration, shutdown_token: CancellationToken) -> Self {
        Self {
            engine,
            interval,
            shutdown_token,
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        info!(interval = ?self.interval, "Starting consensus reaper");
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let expired = self.engine.expire_overdue();
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "Consensus reaper expired proposals");
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Consensus reaper shutting down");
                    break;
                }
            }
        }
    }
}
