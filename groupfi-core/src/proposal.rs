//! Proposals: wire content, aggregate record, create-side input validation,
//! and the configurable quorum policy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{GroupId, MemberAddr, ProposalId};
use crate::vote::VoteTally;

/// Minimum title length accepted by [`ProposalInput::validate`].
pub const TITLE_MIN_LEN: usize = 3;
/// Maximum title length accepted by [`ProposalInput::validate`].
pub const TITLE_MAX_LEN: usize = 255;
/// Minimum number of options on a proposal.
pub const MIN_OPTIONS: usize = 2;
/// Maximum number of options on a proposal.
pub const MAX_OPTIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalType {
    Investment,
    Governance,
    Treasury,
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalType::Investment => f.write_str("investment"),
            ProposalType::Governance => f.write_str("governance"),
            ProposalType::Treasury => f.write_str("treasury"),
        }
    }
}

/// Proposal lifecycle status. `Active` until the deadline, then resolved
/// exactly once to a terminal status which is never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Active,
    Passed,
    Rejected,
    Expired,
}

impl ProposalStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProposalStatus::Active)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Active => f.write_str("active"),
            ProposalStatus::Passed => f.write_str("passed"),
            ProposalStatus::Rejected => f.write_str("rejected"),
            ProposalStatus::Expired => f.write_str("expired"),
        }
    }
}

/// The wire-complete proposal payload of the `(groupfi.app, proposal, 1, 0)`
/// content type. This is what the codec round-trips; group membership and
/// status live on [`Proposal`] and are derived from transport metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalContent {
    pub id: ProposalId,
    pub title: String,
    pub description: String,
    /// Ordered option strings, 2..=10 entries, distinct.
    pub options: Vec<String>,
    /// Immutable after creation.
    pub deadline: DateTime<Utc>,
    pub proposal_type: ProposalType,
}

/// A proposal as held by the aggregator and the store: the wire content plus
/// the group it belongs to, its creator, and the derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub content: ProposalContent,
    pub group_id: GroupId,
    pub created_by: MemberAddr,
    pub status: ProposalStatus,
}

impl Proposal {
    #[must_use]
    pub fn new(content: ProposalContent, group_id: GroupId, created_by: MemberAddr) -> Self {
        Self {
            content,
            group_id,
            created_by,
            status: ProposalStatus::Active,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ProposalId {
        &self.content.id
    }

    #[must_use]
    pub fn options(&self) -> &[String] {
        &self.content.options
    }

    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.content.deadline
    }

    /// Whether another event for the same id agrees on every immutable field.
    /// Status is derived and excluded from the comparison.
    #[must_use]
    pub fn immutable_fields_match(&self, other: &Proposal) -> bool {
        self.content == other.content
            && self.group_id == other.group_id
            && self.created_by == other.created_by
    }
}

/// Create-side input, validated before anything is published or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalInput {
    pub group_id: GroupId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub proposal_type: ProposalType,
    pub options: Vec<String>,
    pub voting_deadline: DateTime<Utc>,
}

impl ProposalInput {
    /// Check the proposal invariants: title length, option count and
    /// uniqueness, and a deadline strictly in the future.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule. Nothing has been published or
    /// persisted when this fails.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let title_len = self.title.chars().count();
        if !(TITLE_MIN_LEN..=TITLE_MAX_LEN).contains(&title_len) {
            return Err(ValidationError::TitleLength { length: title_len });
        }

        if self.options.len() < MIN_OPTIONS {
            return Err(ValidationError::TooFewOptions {
                count: self.options.len(),
            });
        }
        if self.options.len() > MAX_OPTIONS {
            return Err(ValidationError::TooManyOptions {
                count: self.options.len(),
            });
        }

        for (index, option) in self.options.iter().enumerate() {
            if option.trim().is_empty() {
                return Err(ValidationError::EmptyOption { index });
            }
            if self.options[..index].contains(option) {
                return Err(ValidationError::DuplicateOption {
                    option: option.clone(),
                });
            }
        }

        if self.voting_deadline <= now {
            return Err(ValidationError::DeadlineNotInFuture {
                deadline: self.voting_deadline,
            });
        }

        Ok(())
    }

    /// Build the full proposal record for a validated input.
    #[must_use]
    pub fn into_proposal(self, id: ProposalId, created_by: MemberAddr) -> Proposal {
        let content = ProposalContent {
            id,
            title: self.title,
            description: self.description,
            options: self.options,
            deadline: self.voting_deadline,
            proposal_type: self.proposal_type,
        };
        Proposal::new(content, self.group_id, created_by)
    }
}

/// Configurable quorum/majority rule applied when a proposal's deadline is
/// reached. The source system never pinned this rule down, so it is policy,
/// not a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumPolicy {
    /// Minimum number of accepted votes for the proposal to be decidable.
    pub min_votes: u64,
    /// The leading option must hold strictly more than this percentage of
    /// cast votes, and must lead alone.
    pub pass_threshold_percent: u8,
}

impl Default for QuorumPolicy {
    /// Simple majority of cast votes, at least one vote.
    fn default() -> Self {
        Self {
            min_votes: 1,
            pass_threshold_percent: 50,
        }
    }
}

impl QuorumPolicy {
    /// Resolve a proposal that has reached its deadline.
    ///
    /// Pure function of the tally: zero votes resolve to `Expired`; a sole
    /// leading option above the threshold with quorum met resolves to
    /// `Passed`; anything else to `Rejected`. Recomputation from the same
    /// tally always yields the same status.
    #[must_use]
    pub fn resolve(&self, tally: &VoteTally) -> ProposalStatus {
        if tally.total_votes == 0 {
            return ProposalStatus::Expired;
        }
        if tally.total_votes < self.min_votes {
            return ProposalStatus::Rejected;
        }

        match tally.leading_option() {
            Some(leader)
                if tally.count(leader) * 100
                    > u64::from(self.pass_threshold_percent) * tally.total_votes =>
            {
                ProposalStatus::Passed
            }
            _ => ProposalStatus::Rejected,
        }
    }
}
