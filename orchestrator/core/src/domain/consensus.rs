// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Consensus Proposal Aggregate
//!
//! ```text
//! Proposed ──▶ Voting ──┬──▶ Committed
//!                       ├──▶ Rejected
//!                       └──▶ Expired
//! ```
//!
//! Transitions are monotonic: nothing leaves a terminal state. Quorum is
//! reached when the summed approve weight meets `required_weight` and the
//! summed participation weight (approve, reject and abstain) meets
//! `participation_floor`. Committing is a separate, explicit step.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::agreement::AgreementRef;
use crate::domain::error::{CoreError, CoreResult};
use crate::domain::hashing::ContentHash;
use crate::domain::proof::Proof;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitmentId(pub Uuid);

impl CommitmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommitmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommitmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(pub String);

impl VoterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalState {
    Proposed,
    Voting,
    Committed,
    Rejected,
    Expired,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalState::Committed | ProposalState::Rejected | ProposalState::Expired
        )
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
}

impl VoteDecision {
    fn as_str(&self) -> &'static str {
        match self {
            VoteDecision::Approve => "approve",
            VoteDecision::Reject => "reject",
            VoteDecision::Abstain => "abstain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: VoterId,
    pub proposal_id: ProposalId,
    pub decision: VoteDecision,
    /// Zero-weight votes are recorded but never move quorum.
    pub weight: u64,
    pub signature: String,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve_weight: u64,
    pub reject_weight: u64,
    pub abstain_weight: u64,
    pub participation_weight: u64,
    pub voter_count: usize,
    pub required_weight: u64,
    pub participation_floor: u64,
    pub quorum_reached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub proposal_id: ProposalId,
    pub agent_id: AgentId,
    pub proposal_type: String,
    pub required_weight: u64,
    pub participation_floor: u64,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub state: ProposalState,
    /// One vote per voter; later votes replace earlier ones.
    pub votes: BTreeMap<VoterId, Vote>,
}

impl ConsensusProposal {
    pub fn new(
        agent_id: AgentId,
        proposal_type: impl Into<String>,
        required_weight: u64,
        participation_floor: u64,
        created_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> Self {
        Self {
            proposal_id: ProposalId::new(),
            agent_id,
            proposal_type: proposal_type.into(),
            required_weight,
            participation_floor,
            created_at,
            timeout_at,
            state: ProposalState::Proposed,
            votes: BTreeMap::new(),
        }
    }

    pub fn open_voting(&mut self) -> CoreResult<()> {
        self.transition(ProposalState::Proposed, ProposalState::Voting)
    }

    pub fn is_past_timeout(&self, now: DateTime<Utc>) -> bool {
        now >= self.timeout_at
    }

    /// Lazily moves an overdue, non-terminal proposal to `Expired`.
    /// Returns `true` when this call performed the transition.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_terminal() && self.is_past_timeout(now) {
            self.state = ProposalState::Expired;
            return true;
        }
        false
    }

    /// Upserts a vote and returns the new tally. Moves the proposal to
    /// `Rejected` when reject weight alone meets the required weight.
    pub fn record_vote(&mut self, vote: Vote, now: DateTime<Utc>) -> CoreResult<Tally> {
        if self.state == ProposalState::Expired || self.is_past_timeout(now) {
            return Err(CoreError::Expired(self.proposal_id.to_string()));
        }
        if self.state != ProposalState::Voting {
            return Err(CoreError::InvalidState(format!(
                "proposal {} is {}, votes are only accepted while Voting",
                self.proposal_id, self.state
            )));
        }
        if vote.proposal_id != self.proposal_id {
            return Err(CoreError::InvalidState(format!(
                "vote targets proposal {}, not {}",
                vote.proposal_id, self.proposal_id
            )));
        }
        self.votes.insert(vote.voter_id.clone(), vote);
        let tally = self.tally();
        if self.required_weight > 0 && tally.reject_weight >= self.required_weight {
            self.state = ProposalState::Rejected;
        }
        Ok(tally)
    }

    pub fn tally(&self) -> Tally {
        let mut approve = 0u64;
        let mut reject = 0u64;
        let mut abstain = 0u64;
        for vote in self.votes.values() {
            match vote.decision {
                VoteDecision::Approve => approve = approve.saturating_add(vote.weight),
                VoteDecision::Reject => reject = reject.saturating_add(vote.weight),
                VoteDecision::Abstain => abstain = abstain.saturating_add(vote.weight),
            }
        }
        let participation = approve.saturating_add(reject).saturating_add(abstain);
        Tally {
            approve_weight: approve,
            reject_weight: reject,
            abstain_weight: abstain,
            participation_weight: participation,
            voter_count: self.votes.len(),
            required_weight: self.required_weight,
            participation_floor: self.participation_floor,
            quorum_reached: approve >= self.required_weight
                && participation >= self.participation_floor,
        }
    }

    /// Hash over the proposal identity, its thresholds and every recorded
    /// vote in voter order. Vote timestamps are excluded.
    pub fn tally_hash(&self) -> ContentHash {
        let mut fields: Vec<Vec<u8>> = vec![
            self.proposal_id.to_string().into_bytes(),
            self.required_weight.to_be_bytes().to_vec(),
            self.participation_floor.to_be_bytes().to_vec(),
        ];
        for vote in self.votes.values() {
            fields.push(vote.voter_id.0.as_bytes().to_vec());
            fields.push(vote.decision.as_str().as_bytes().to_vec());
            fields.push(vote.weight.to_be_bytes().to_vec());
            fields.push(vote.signature.as_bytes().to_vec());
        }
        let borrowed: Vec<&[u8]> = fields.iter().map(Vec::as_slice).collect();
        ContentHash::of_fields(&borrowed)
    }

    pub fn mark_committed(&mut self) -> CoreResult<()> {
        self.transition(ProposalState::Voting, ProposalState::Committed)
    }

    fn transition(&mut self, from: ProposalState, to: ProposalState) -> CoreResult<()> {
        if self.state != from {
            return Err(CoreError::InvalidState(format!(
                "proposal {} cannot move {} -> {} (currently {})",
                self.proposal_id, from, to, self.state
            )));
        }
        self.state = to;
        Ok(())
    }
}

/// Finalized, provable outcome of a proposal. Created exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub commitment_id: CommitmentId,
    pub proposal_id: ProposalId,
    pub timestamp: DateTime<Utc>,
    pub tally_hash: ContentHash,
    pub proof: Proof,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_ref: Option<AgreementRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentVerification {
    pub commitment_id: CommitmentId,
    pub valid: bool,
    pub tally_matches: bool,
    pub proof_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommitmentVerification {
    pub fn into_result(self) -> CoreResult<Self> {
        if self.valid {
            return Ok(self);
        }
        Err(CoreError::IntegrityViolation {
            first_divergence: self.commitment_id.to_string(),
            reason: self.reason.unwrap_or_default(),
        })
    }
}
