//! Votes and the derived tally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{MemberAddr, ProposalId};

/// A single cast vote. Created once per voter per proposal; duplicates may
/// exist at the transport and store level but collapse to one logical vote
/// in the aggregator.
///
/// Field names follow the wire JSON shape of the `(groupfi.app, vote, 1, 0)`
/// content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub proposal_id: ProposalId,
    #[serde(rename = "selectedOption")]
    pub option_index: u32,
    #[serde(rename = "voterAddress")]
    pub voter: MemberAddr,
    /// Voting weight. Carried and persisted; the built-in tally counts one
    /// unit per accepted vote regardless.
    pub weight: f64,
    #[serde(rename = "timestamp")]
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    #[must_use]
    pub fn new(
        proposal_id: ProposalId,
        voter: MemberAddr,
        option_index: u32,
        cast_at: DateTime<Utc>,
    ) -> Self {
        Self {
            proposal_id,
            option_index,
            voter,
            weight: 1.0,
            cast_at,
        }
    }
}

/// Derived per-option vote counts. Never stored and never mutated directly:
/// always a pure function of the deduplicated accepted-vote set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    /// Count per option index.
    pub counts: Vec<u64>,
    pub total_votes: u64,
}

impl VoteTally {
    /// An empty tally for a proposal with `option_count` options.
    #[must_use]
    pub fn for_options(option_count: usize) -> Self {
        Self {
            counts: vec![0; option_count],
            total_votes: 0,
        }
    }

    /// Recompute from scratch over an accepted-vote set.
    ///
    /// Votes with an out-of-range option index are ignored; the aggregator
    /// never admits them in the first place.
    #[must_use]
    pub fn from_votes<'a>(option_count: usize, votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut tally = Self::for_options(option_count);
        for vote in votes {
            tally.record(vote.option_index);
        }
        tally
    }

    /// Incrementally count one vote for `option_index`.
    pub fn record(&mut self, option_index: u32) {
        if let Some(count) = self.counts.get_mut(option_index as usize) {
            *count += 1;
            self.total_votes += 1;
        }
    }

    #[must_use]
    pub fn count(&self, option_index: u32) -> u64 {
        self.counts.get(option_index as usize).copied().unwrap_or(0)
    }

    /// The option index holding a strict maximum of the counts, if any.
    ///
    /// Returns `None` when the tally is empty or the lead is shared.
    #[must_use]
    pub fn leading_option(&self) -> Option<u32> {
        let max = self.counts.iter().copied().max()?;
        if max == 0 {
            return None;
        }
        let mut leaders = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == max);
        let (index, _) = leaders.next()?;
        if leaders.next().is_some() {
            return None;
        }
        u32::try_from(index).ok()
    }
}

/// The aggregator's decision for one submitted vote.
///
/// Rejections are expected outcomes communicated by value, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoteOutcome {
    Accepted,
    /// The voter already has an accepted vote for this proposal.
    RejectedDuplicate,
    /// The vote was cast after the voting deadline.
    RejectedExpired,
    /// The option index is outside the proposal's option range.
    RejectedInvalidOption,
}
