//! The tally engine: merges proposal and vote events from the live stream
//! and the persisted store into one consistent view per proposal.
//!
//! The aggregator assumes at-least-once, possibly-reordered delivery from
//! either source and guarantees exactly-once application: delivery keys
//! dedup redelivery within a source, and first-writer-wins per voter makes
//! the tally a pure function of the accepted-vote set regardless of the
//! order the two sources interleave in.
//!
//! The aggregator is purely synchronous. A single owner (the coordinator
//! actor) serializes all mutation; reads hand out snapshot clones.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::ConflictError;
use crate::id::{EnvelopeId, MemberAddr, ProposalId};
use crate::proposal::{Proposal, ProposalStatus, QuorumPolicy};
use crate::vote::{Vote, VoteOutcome, VoteTally};

/// Which view of the event set delivered an envelope.
///
/// The stream and the store are treated symmetrically: whichever delivers a
/// logical event first wins, the other delivery is a confirmed duplicate.
/// `Local` marks events applied directly by the publishing coordinator so
/// the author sees its own writes without waiting for echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Stream,
    Store,
    Local,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Stream => f.write_str("stream"),
            EventSource::Store => f.write_str("store"),
            EventSource::Local => f.write_str("local"),
        }
    }
}

/// Result of applying a proposal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalApplied {
    /// First event for this id; the proposal is now tracked.
    /// `votes_applied` counts buffered early votes accepted on creation.
    Created { votes_applied: usize },
    /// The id was already tracked with matching immutable fields.
    Duplicate,
}

/// Votes buffered for a proposal the aggregator has not seen yet are capped;
/// beyond this the oldest buffered entries are dropped.
const MAX_PENDING_VOTES: usize = 1024;

struct PendingVote {
    source: EventSource,
    envelope_id: EnvelopeId,
    vote: Vote,
}

/// Per-proposal aggregation state.
struct ProposalState {
    proposal: Proposal,
    /// `(source, envelope_id)` pairs already applied.
    delivered: HashSet<(EventSource, EnvelopeId)>,
    /// Accepted votes, at most one per voter.
    accepted: HashMap<MemberAddr, Vote>,
    tally: VoteTally,
}

impl ProposalState {
    fn new(proposal: Proposal) -> Self {
        let tally = VoteTally::for_options(proposal.options().len());
        Self {
            proposal,
            delivered: HashSet::new(),
            accepted: HashMap::new(),
            tally,
        }
    }

    fn record_delivery(&mut self, source: EventSource, envelope_id: EnvelopeId) {
        self.delivered.insert((source, envelope_id));
    }

    fn decide(&self, vote: &Vote) -> VoteOutcome {
        if vote.option_index as usize >= self.proposal.options().len() {
            VoteOutcome::RejectedInvalidOption
        } else if vote.cast_at > self.proposal.deadline() {
            VoteOutcome::RejectedExpired
        } else if self.accepted.contains_key(&vote.voter) {
            VoteOutcome::RejectedDuplicate
        } else {
            VoteOutcome::Accepted
        }
    }
}

/// The authoritative per-proposal tally and status, fed from both sources.
pub struct ProposalAggregator {
    policy: QuorumPolicy,
    proposals: HashMap<ProposalId, ProposalState>,
    pending_votes: HashMap<ProposalId, Vec<PendingVote>>,
}

impl ProposalAggregator {
    #[must_use]
    pub fn new(policy: QuorumPolicy) -> Self {
        Self {
            policy,
            proposals: HashMap::new(),
            pending_votes: HashMap::new(),
        }
    }

    /// Apply one proposal event. First-writer-wins on the proposal id.
    ///
    /// Buffered votes that arrived before the proposal are drained and
    /// applied in their buffered order.
    ///
    /// # Errors
    ///
    /// [`ConflictError`] when an event for an already-tracked id disagrees
    /// on an immutable field. The delivery is still recorded and the
    /// first-seen proposal stays authoritative.
    pub fn apply_proposal_event(
        &mut self,
        source: EventSource,
        envelope_id: EnvelopeId,
        proposal: Proposal,
    ) -> Result<ProposalApplied, ConflictError> {
        let id = proposal.id().clone();

        if let Some(state) = self.proposals.get_mut(&id) {
            state.record_delivery(source, envelope_id);
            if state.proposal.immutable_fields_match(&proposal) {
                return Ok(ProposalApplied::Duplicate);
            }
            tracing::warn!(proposal_id = %id, %source, "conflicting proposal event");
            return Err(ConflictError { proposal_id: id });
        }

        let mut state = ProposalState::new(proposal);
        state.record_delivery(source, envelope_id);
        self.proposals.insert(id.clone(), state);

        let mut votes_applied = 0;
        for pending in self.pending_votes.remove(&id).unwrap_or_default() {
            if self.apply_vote_event(pending.source, pending.envelope_id, pending.vote)
                == Some(VoteOutcome::Accepted)
            {
                votes_applied += 1;
            }
        }

        Ok(ProposalApplied::Created { votes_applied })
    }

    /// Apply one vote event from any source.
    ///
    /// Returns `None` when the event carried no new information: the
    /// `(source, envelope_id)` pair was already applied, or the proposal is
    /// unknown and the vote was buffered for later.
    ///
    /// A valid vote is counted whenever it arrives, even after the proposal
    /// resolved — the tally stays a pure function of the accepted-vote set;
    /// the resolved status is never recomputed.
    pub fn apply_vote_event(
        &mut self,
        source: EventSource,
        envelope_id: EnvelopeId,
        vote: Vote,
    ) -> Option<VoteOutcome> {
        let Some(state) = self.proposals.get_mut(&vote.proposal_id) else {
            tracing::debug!(
                proposal_id = %vote.proposal_id,
                %source,
                "vote for unknown proposal, buffering"
            );
            let pending = self.pending_votes.entry(vote.proposal_id.clone()).or_default();
            if pending.len() >= MAX_PENDING_VOTES {
                pending.remove(0);
            }
            pending.push(PendingVote {
                source,
                envelope_id,
                vote,
            });
            return None;
        };

        if state.delivered.contains(&(source, envelope_id.clone())) {
            return None;
        }

        let outcome = state.decide(&vote);
        if outcome == VoteOutcome::Accepted {
            state.tally.record(vote.option_index);
            state.accepted.insert(vote.voter.clone(), vote);
        }
        // Rejections are recorded too, so redelivery is never reprocessed.
        state.record_delivery(source, envelope_id);

        Some(outcome)
    }

    /// What the aggregator would decide for this vote, without applying it.
    ///
    /// Returns `None` when the proposal is unknown.
    #[must_use]
    pub fn preflight_vote(&self, vote: &Vote) -> Option<VoteOutcome> {
        self.proposals
            .get(&vote.proposal_id)
            .map(|state| state.decide(vote))
    }

    /// Resolve every active proposal whose deadline has passed.
    ///
    /// Resolution happens at most once per proposal; terminal statuses are
    /// cached and never recomputed. Returns the proposals whose status
    /// changed.
    pub fn refresh_statuses(&mut self, now: DateTime<Utc>) -> Vec<(ProposalId, ProposalStatus)> {
        let mut changed = Vec::new();
        for (id, state) in &mut self.proposals {
            if state.proposal.status == ProposalStatus::Active && now >= state.proposal.deadline() {
                let status = self.policy.resolve(&state.tally);
                state.proposal.status = status;
                tracing::info!(proposal_id = %id, %status, "proposal resolved");
                changed.push((id.clone(), status));
            }
        }
        changed
    }

    /// Snapshot of one proposal record.
    #[must_use]
    pub fn proposal(&self, id: &ProposalId) -> Option<Proposal> {
        self.proposals.get(id).map(|s| s.proposal.clone())
    }

    /// Snapshot of one proposal's tally.
    #[must_use]
    pub fn tally(&self, id: &ProposalId) -> Option<VoteTally> {
        self.proposals.get(id).map(|s| s.tally.clone())
    }

    /// Current status of one proposal.
    #[must_use]
    pub fn status(&self, id: &ProposalId) -> Option<ProposalStatus> {
        self.proposals.get(id).map(|s| s.proposal.status)
    }

    /// Snapshots of every tracked proposal, unordered.
    #[must_use]
    pub fn proposals(&self) -> Vec<Proposal> {
        self.proposals.values().map(|s| s.proposal.clone()).collect()
    }

    /// Number of accepted votes for a proposal.
    #[must_use]
    pub fn accepted_votes(&self, id: &ProposalId) -> usize {
        self.proposals.get(id).map_or(0, |s| s.accepted.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::id::GroupId;
    use crate::proposal::{ProposalContent, ProposalType};

    fn proposal(id: &str, deadline: DateTime<Utc>) -> Proposal {
        Proposal::new(
            ProposalContent {
                id: ProposalId::from(id),
                title: "Fund the tooling budget".into(),
                description: String::new(),
                options: vec!["Yes".into(), "No".into()],
                deadline,
                proposal_type: ProposalType::Governance,
            },
            GroupId::from("g1"),
            MemberAddr::from("0xcreator"),
        )
    }

    fn vote(proposal_id: &str, voter: &str, option: u32, cast_at: DateTime<Utc>) -> Vote {
        Vote::new(
            ProposalId::from(proposal_id),
            MemberAddr::from(voter),
            option,
            cast_at,
        )
    }

    fn aggregator_with_proposal(deadline: DateTime<Utc>) -> ProposalAggregator {
        let mut agg = ProposalAggregator::new(QuorumPolicy::default());
        agg.apply_proposal_event(
            EventSource::Stream,
            EnvelopeId::from("env-p1"),
            proposal("p1", deadline),
        )
        .expect("create");
        agg
    }

    #[test]
    fn same_delivery_key_applies_at_most_once() {
        let now = Utc::now();
        let mut agg = aggregator_with_proposal(now + Duration::hours(1));

        let v = vote("p1", "0xa", 0, now);
        let first = agg.apply_vote_event(EventSource::Stream, EnvelopeId::from("m1"), v.clone());
        assert_eq!(first, Some(VoteOutcome::Accepted));

        let second = agg.apply_vote_event(EventSource::Stream, EnvelopeId::from("m1"), v);
        assert_eq!(second, None);

        let tally = agg.tally(&ProposalId::from("p1")).expect("tally");
        assert_eq!(tally.total_votes, 1);
    }

    #[test]
    fn one_voter_one_vote_across_sources() {
        let now = Utc::now();
        let mut agg = aggregator_with_proposal(now + Duration::hours(1));

        let v = vote("p1", "0xa", 0, now);
        assert_eq!(
            agg.apply_vote_event(EventSource::Stream, EnvelopeId::from("m1"), v.clone()),
            Some(VoteOutcome::Accepted)
        );
        // The same logical vote arrives again via store catch-up under a
        // different envelope id.
        assert_eq!(
            agg.apply_vote_event(EventSource::Store, EnvelopeId::from("votes/p1/0xa"), v),
            Some(VoteOutcome::RejectedDuplicate)
        );

        let tally = agg.tally(&ProposalId::from("p1")).expect("tally");
        assert_eq!(tally.counts, vec![1, 0]);
        assert_eq!(tally.total_votes, 1);
    }

    #[test]
    fn vote_after_deadline_is_never_counted() {
        let now = Utc::now();
        let deadline = now + Duration::hours(1);
        let mut agg = aggregator_with_proposal(deadline);

        let late = vote("p1", "0xa", 0, deadline + Duration::seconds(1));
        assert_eq!(
            agg.apply_vote_event(EventSource::Stream, EnvelopeId::from("m1"), late),
            Some(VoteOutcome::RejectedExpired)
        );
        assert_eq!(agg.tally(&ProposalId::from("p1")).expect("tally").total_votes, 0);

        // The rejection is recorded: redelivery is a no-op, not a retry.
        let late_again = vote("p1", "0xa", 0, deadline + Duration::seconds(1));
        assert_eq!(
            agg.apply_vote_event(EventSource::Stream, EnvelopeId::from("m1"), late_again),
            None
        );
    }

    #[test]
    fn invalid_option_rejected_tally_unchanged() {
        let now = Utc::now();
        let mut agg = aggregator_with_proposal(now + Duration::hours(1));

        assert_eq!(
            agg.apply_vote_event(
                EventSource::Stream,
                EnvelopeId::from("m1"),
                vote("p1", "0xb", 5, now)
            ),
            Some(VoteOutcome::RejectedInvalidOption)
        );
        let tally = agg.tally(&ProposalId::from("p1")).expect("tally");
        assert_eq!(tally.counts, vec![0, 0]);
    }

    #[test]
    fn dual_source_orderings_yield_identical_tallies() {
        let now = Utc::now();
        let deadline = now + Duration::hours(1);

        let events: Vec<(EventSource, &str, Vote)> = vec![
            (EventSource::Stream, "m1", vote("p1", "0xa", 0, now)),
            (EventSource::Store, "votes/p1/0xa", vote("p1", "0xa", 0, now)),
            (EventSource::Stream, "m2", vote("p1", "0xb", 1, now)),
            (EventSource::Store, "votes/p1/0xb", vote("p1", "0xb", 1, now)),
            (EventSource::Stream, "m3", vote("p1", "0xc", 0, now)),
        ];

        let run = |order: Vec<&(EventSource, &str, Vote)>| {
            let mut agg = aggregator_with_proposal(deadline);
            for (source, envelope_id, v) in order {
                agg.apply_vote_event(*source, EnvelopeId::from(*envelope_id), v.clone());
            }
            agg.tally(&ProposalId::from("p1")).expect("tally")
        };

        let store_first = run(events.iter().rev().collect());
        let stream_first = run(events.iter().collect());
        assert_eq!(store_first, stream_first);
        assert_eq!(store_first.counts, vec![2, 1]);
        assert_eq!(store_first.total_votes, 3);
    }

    #[test]
    fn votes_arriving_before_their_proposal_are_buffered() {
        let now = Utc::now();
        let mut agg = ProposalAggregator::new(QuorumPolicy::default());

        assert_eq!(
            agg.apply_vote_event(
                EventSource::Stream,
                EnvelopeId::from("m1"),
                vote("p1", "0xa", 0, now)
            ),
            None
        );

        let applied = agg
            .apply_proposal_event(
                EventSource::Store,
                EnvelopeId::from("proposals/p1"),
                proposal("p1", now + Duration::hours(1)),
            )
            .expect("create");
        assert_eq!(applied, ProposalApplied::Created { votes_applied: 1 });

        let tally = agg.tally(&ProposalId::from("p1")).expect("tally");
        assert_eq!(tally.counts, vec![1, 0]);
    }

    #[test]
    fn conflicting_proposal_event_is_reported_not_merged() {
        let now = Utc::now();
        let deadline = now + Duration::hours(1);
        let mut agg = aggregator_with_proposal(deadline);

        // Same id, duplicate event: fine.
        assert_eq!(
            agg.apply_proposal_event(
                EventSource::Store,
                EnvelopeId::from("proposals/p1"),
                proposal("p1", deadline),
            ),
            Ok(ProposalApplied::Duplicate)
        );

        // Same id, different deadline: conflict, original stays.
        let mut altered = proposal("p1", deadline + Duration::hours(2));
        altered.content.title = "Different title".into();
        assert!(
            agg.apply_proposal_event(EventSource::Stream, EnvelopeId::from("m9"), altered)
                .is_err()
        );
        let kept = agg.proposal(&ProposalId::from("p1")).expect("proposal");
        assert_eq!(kept.deadline(), deadline);
    }

    #[test]
    fn resolution_happens_once_and_sticks() {
        let now = Utc::now();
        let deadline = now + Duration::hours(1);
        let mut agg = aggregator_with_proposal(deadline);

        for (i, voter) in ["0xa", "0xb", "0xc", "0xd"].iter().enumerate() {
            let option = u32::from(i == 3);
            agg.apply_vote_event(
                EventSource::Stream,
                EnvelopeId(format!("m{i}")),
                vote("p1", voter, option, now),
            );
        }

        assert!(agg.refresh_statuses(now).is_empty());

        let changed = agg.refresh_statuses(deadline + Duration::seconds(1));
        assert_eq!(
            changed,
            vec![(ProposalId::from("p1"), ProposalStatus::Passed)]
        );

        // Later refreshes never flip a terminal status.
        assert!(agg.refresh_statuses(deadline + Duration::hours(5)).is_empty());
        assert_eq!(
            agg.status(&ProposalId::from("p1")),
            Some(ProposalStatus::Passed)
        );
    }

    #[test]
    fn zero_vote_proposal_expires() {
        let now = Utc::now();
        let deadline = now + Duration::minutes(5);
        let mut agg = aggregator_with_proposal(deadline);

        let changed = agg.refresh_statuses(deadline);
        assert_eq!(
            changed,
            vec![(ProposalId::from("p1"), ProposalStatus::Expired)]
        );
    }
}
