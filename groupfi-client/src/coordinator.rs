//! The group coordinator: one actor per joined group that owns the
//! aggregator and serializes every mutation against it.
//!
//! The actor merges three inputs over one `select!` loop: caller requests,
//! decoded stream events from the [`StreamConsumer`], and row changes from
//! the store. Because a single task applies all of them, the per-proposal
//! exclusivity the aggregator requires holds without locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use error_stack::Report;
use groupfi_core::{
    CodecRegistry, DecodeError, DecodedContent, EnvelopeId, EventSource, GroupId, MemberAddr,
    Proposal, ProposalAggregator, ProposalApplied, ProposalId, ProposalInput, ProposalStatus,
    QuorumPolicy, Vote, VoteOutcome, VoteTally, truncate_to_millis,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consumer::{ConsumerConfig, ConsumerState, StreamConsumer, StreamEvent};
use crate::error::{CoordinatorError, PersistError};
use crate::session::Session;
use crate::store::{ProposalStore, RowChange, proposal_row_id, vote_row_id};
use crate::transport::GroupChannel;

/// Coordinator tuning knobs. Defaults suit interactive use.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub quorum: QuorumPolicy,
    pub consumer: ConsumerConfig,
    /// How often active proposals are checked against their deadlines.
    pub status_interval: Duration,
    /// Capacity of the coordinator event broadcast.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            quorum: QuorumPolicy::default(),
            consumer: ConsumerConfig::default(),
            status_interval: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

/// Notifications emitted by the coordinator. Informational; applications
/// are not required to consume them and old events are dropped when the
/// subscriber lags.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ProposalAdded(Proposal),
    TallyChanged {
        proposal_id: ProposalId,
        tally: VoteTally,
    },
    StatusChanged {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },
    /// An event for a known proposal id disagreed on an immutable field.
    /// The first-seen proposal stays authoritative.
    ProposalConflict {
        proposal_id: ProposalId,
        source: EventSource,
    },
    /// An envelope no registered codec could decode.
    Unrecognized {
        envelope_id: EnvelopeId,
        sender: MemberAddr,
        reason: DecodeError,
    },
}

/// A proposal together with its current tally.
#[derive(Debug, Clone)]
pub struct TallySnapshot {
    pub proposal: Proposal,
    pub tally: VoteTally,
}

enum CoordinatorRequest {
    CreateProposal {
        input: ProposalInput,
        reply: oneshot::Sender<Result<Proposal, CoordinatorError>>,
    },
    CastVote {
        proposal_id: ProposalId,
        option_index: u32,
        reply: oneshot::Sender<Result<VoteOutcome, CoordinatorError>>,
    },
    GetProposal {
        id: ProposalId,
        reply: oneshot::Sender<Option<Proposal>>,
    },
    ListProposals {
        reply: oneshot::Sender<Vec<Proposal>>,
    },
    Tally {
        id: ProposalId,
        reply: oneshot::Sender<Option<TallySnapshot>>,
    },
}

/// Handle to a running coordinator actor. Dropping the handle stops the
/// actor and its stream consumer.
pub struct GroupCoordinator {
    request_tx: mpsc::Sender<CoordinatorRequest>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    consumer_state: watch::Receiver<ConsumerState>,
    cancel_token: CancellationToken,
    _cancel_guard: tokio_util::sync::DropGuard,
    actor_handle: Option<JoinHandle<()>>,
    consumer_handle: Option<JoinHandle<()>>,
    group_id: GroupId,
}

impl GroupCoordinator {
    /// Hydrate from the store and start the actor and its stream consumer.
    ///
    /// Persisted proposals are applied before their votes so no vote has to
    /// take the pending-buffer path during hydration.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] when reading persisted state fails. Nothing
    /// is running on failure.
    pub async fn spawn<T: GroupChannel, S: ProposalStore>(
        session: Session,
        group_id: GroupId,
        channel: T,
        store: S,
        config: CoordinatorConfig,
    ) -> Result<Self, Report<PersistError>> {
        let registry = Arc::new(CodecRegistry::with_builtins());
        let mut aggregator = ProposalAggregator::new(config.quorum);

        // Subscribe before the scan so a row written by another store clone
        // mid-hydration still arrives on the feed. Rows seen by both paths
        // dedup on the row-scoped envelope id.
        let store_rx = store.subscribe_changes();

        for proposal in store.list_proposals(&group_id).await? {
            let id = proposal.id().clone();
            let row_id = proposal_row_id(&id);
            if aggregator
                .apply_proposal_event(EventSource::Store, row_id, proposal)
                .is_err()
            {
                tracing::warn!(proposal_id = %id, "conflicting proposal row during hydration");
            }

            for vote in store.list_votes(&id).await? {
                let row_id = vote_row_id(&id, &vote.voter);
                aggregator.apply_vote_event(EventSource::Store, row_id, vote);
            }
        }

        let cancel_token = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel(64);
        let (stream_tx, stream_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let (consumer, consumer_state) = StreamConsumer::new(
            channel.clone(),
            Arc::clone(&registry),
            session.identity().clone(),
            Some(group_id.clone()),
            stream_tx,
            cancel_token.child_token(),
            config.consumer,
        );
        let consumer_handle = tokio::spawn(consumer.run());

        let actor = CoordinatorActor {
            session,
            group_id: group_id.clone(),
            channel,
            store,
            registry,
            aggregator,
            request_rx,
            stream_rx,
            store_rx,
            event_tx: event_tx.clone(),
            cancel_token: cancel_token.clone(),
            status_interval: config.status_interval,
        };
        let actor_handle = tokio::spawn(actor.run());

        let cancel_guard = cancel_token.clone().drop_guard();

        Ok(Self {
            request_tx,
            event_tx,
            consumer_state,
            cancel_token,
            _cancel_guard: cancel_guard,
            actor_handle: Some(actor_handle),
            consumer_handle: Some(consumer_handle),
            group_id,
        })
    }

    /// Validate, publish, and persist a new proposal.
    ///
    /// Blocks until the proposal is on the channel and in the store. The
    /// returned record is already visible to local reads.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::Validation`] before anything was published;
    /// [`CoordinatorError::Persist`] after the proposal was published and
    /// applied locally but the store write failed.
    pub async fn create_proposal(
        &self,
        input: ProposalInput,
    ) -> Result<Proposal, Report<CoordinatorError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(CoordinatorRequest::CreateProposal {
                input,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?;

        reply_rx
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?
            .map_err(Report::new)
    }

    /// Cast the session's vote on a proposal.
    ///
    /// Rejections (duplicate, expired, invalid option) come back as an `Ok`
    /// outcome and publish nothing.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownProposal`] when the proposal is not
    /// tracked, or the publish/persist failure classes.
    pub async fn cast_vote(
        &self,
        proposal_id: ProposalId,
        option_index: u32,
    ) -> Result<VoteOutcome, Report<CoordinatorError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(CoordinatorRequest::CastVote {
                proposal_id,
                option_index,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?;

        reply_rx
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?
            .map_err(Report::new)
    }

    /// Snapshot of one tracked proposal.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the actor has shut down.
    pub async fn proposal(
        &self,
        id: ProposalId,
    ) -> Result<Option<Proposal>, Report<CoordinatorError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(CoordinatorRequest::GetProposal { id, reply: reply_tx })
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?;
        reply_rx
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))
    }

    /// Snapshots of every tracked proposal, unordered.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the actor has shut down.
    pub async fn proposals(&self) -> Result<Vec<Proposal>, Report<CoordinatorError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(CoordinatorRequest::ListProposals { reply: reply_tx })
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?;
        reply_rx
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))
    }

    /// A proposal together with its current tally.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Closed`] if the actor has shut down.
    pub async fn tally(
        &self,
        id: ProposalId,
    ) -> Result<Option<TallySnapshot>, Report<CoordinatorError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(CoordinatorRequest::Tally { id, reply: reply_tx })
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))?;
        reply_rx
            .await
            .map_err(|_| Report::new(CoordinatorError::Closed))
    }

    /// Informational only; not required to consume.
    ///
    /// Events cover the whole group; callers watching a single proposal
    /// filter on the event's `proposal_id`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the stream consumer's connection state.
    #[must_use]
    pub fn consumer_state(&self) -> watch::Receiver<ConsumerState> {
        self.consumer_state.clone()
    }

    #[must_use]
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Unlike `Drop`, this waits for the actor and consumer to complete.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.actor_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.consumer_handle.take() {
            let _ = handle.await;
        }
    }
}

struct CoordinatorActor<T: GroupChannel, S: ProposalStore> {
    session: Session,
    group_id: GroupId,
    channel: T,
    store: S,
    registry: Arc<CodecRegistry>,
    aggregator: ProposalAggregator,
    request_rx: mpsc::Receiver<CoordinatorRequest>,
    stream_rx: mpsc::Receiver<StreamEvent>,
    store_rx: broadcast::Receiver<RowChange>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    cancel_token: CancellationToken,
    status_interval: Duration,
}

impl<T: GroupChannel, S: ProposalStore> CoordinatorActor<T, S> {
    async fn run(mut self) {
        let mut status_check = tokio::time::interval(self.status_interval);
        status_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    tracing::debug!(group_id = %self.group_id, "coordinator actor cancelled");
                    break;
                }

                Some(request) = self.request_rx.recv() => {
                    self.handle_request(request).await;
                }

                Some(event) = self.stream_rx.recv() => {
                    self.handle_stream_event(event).await;
                }

                change = self.store_rx.recv() => {
                    match change {
                        Ok(change) => self.handle_store_change(change),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Hydration already covered old rows; only rows
                            // written in the lag window can be missed, and
                            // the stream path redelivers those.
                            tracing::warn!(missed, "store change feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::error!("store change feed closed");
                            break;
                        }
                    }
                }

                _ = status_check.tick() => {
                    self.refresh_statuses().await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: CoordinatorRequest) {
        match request {
            CoordinatorRequest::CreateProposal { input, reply } => {
                let result = self.create_proposal(input).await;
                let _ = reply.send(result);
            }
            CoordinatorRequest::CastVote {
                proposal_id,
                option_index,
                reply,
            } => {
                let result = self.cast_vote(proposal_id, option_index).await;
                let _ = reply.send(result);
            }
            CoordinatorRequest::GetProposal { id, reply } => {
                let _ = reply.send(self.aggregator.proposal(&id));
            }
            CoordinatorRequest::ListProposals { reply } => {
                let _ = reply.send(self.aggregator.proposals());
            }
            CoordinatorRequest::Tally { id, reply } => {
                let snapshot = self.aggregator.proposal(&id).and_then(|proposal| {
                    let tally = self.aggregator.tally(&id)?;
                    Some(TallySnapshot { proposal, tally })
                });
                let _ = reply.send(snapshot);
            }
        }
    }

    async fn create_proposal(
        &mut self,
        mut input: ProposalInput,
    ) -> Result<Proposal, CoordinatorError> {
        let now = Utc::now();
        input.validate(now).map_err(CoordinatorError::Validation)?;

        // Keep the local record at wire resolution so it matches what
        // remote members decode.
        input.voting_deadline = truncate_to_millis(input.voting_deadline);

        let proposal = input.into_proposal(
            ProposalId::generate(),
            self.session.identity().clone(),
        );

        let envelope = self
            .registry
            .encode(&DecodedContent::Proposal(proposal.content.clone()))
            .map_err(CoordinatorError::Encode)?;

        let envelope_id = self
            .channel
            .publish(&self.group_id, envelope)
            .await
            .map_err(|e| {
                tracing::warn!(?e, "proposal publish failed");
                CoordinatorError::Publish
            })?;

        if self
            .aggregator
            .apply_proposal_event(EventSource::Local, envelope_id, proposal.clone())
            .is_err()
        {
            // Freshly generated id, cannot collide with a tracked one.
            tracing::error!(proposal_id = %proposal.id(), "local proposal apply conflicted");
        }

        self.emit(CoordinatorEvent::ProposalAdded(proposal.clone()));

        if let Err(e) = self.store.insert_proposal(proposal.clone()).await {
            tracing::error!(?e, proposal_id = %proposal.id(), "proposal persist failed");
            return Err(CoordinatorError::Persist);
        }

        Ok(proposal)
    }

    async fn cast_vote(
        &mut self,
        proposal_id: ProposalId,
        option_index: u32,
    ) -> Result<VoteOutcome, CoordinatorError> {
        let vote = Vote::new(
            proposal_id.clone(),
            self.session.identity().clone(),
            option_index,
            truncate_to_millis(Utc::now()),
        );

        // Nothing is published for a vote the aggregator would reject.
        match self.aggregator.preflight_vote(&vote) {
            None => return Err(CoordinatorError::UnknownProposal(proposal_id)),
            Some(VoteOutcome::Accepted) => {}
            Some(rejection) => return Ok(rejection),
        }

        let envelope = self
            .registry
            .encode(&DecodedContent::Vote(vote.clone()))
            .map_err(CoordinatorError::Encode)?;

        let envelope_id = self
            .channel
            .publish(&self.group_id, envelope)
            .await
            .map_err(|e| {
                tracing::warn!(?e, "vote publish failed");
                CoordinatorError::Publish
            })?;

        let outcome = self
            .aggregator
            .apply_vote_event(EventSource::Local, envelope_id, vote.clone())
            .unwrap_or(VoteOutcome::Accepted);

        if outcome == VoteOutcome::Accepted {
            self.emit_tally_changed(&proposal_id);
            if let Err(e) = self.store.insert_vote(proposal_id.clone(), vote).await {
                tracing::error!(?e, proposal_id = %proposal_id, "vote persist failed");
                return Err(CoordinatorError::Persist);
            }
        }

        Ok(outcome)
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Content {
                envelope_id,
                group_id,
                sender,
                content,
            } => {
                if group_id != self.group_id {
                    tracing::debug!(%group_id, "ignoring event for another group");
                    return;
                }
                match content {
                    DecodedContent::Proposal(content) => {
                        let proposal = Proposal::new(content, group_id, sender);
                        self.apply_remote_proposal(envelope_id, proposal).await;
                    }
                    DecodedContent::Vote(vote) => {
                        self.apply_remote_vote(envelope_id, vote).await;
                    }
                }
            }
            StreamEvent::Unrecognized {
                envelope_id,
                sender,
                reason,
                ..
            } => {
                self.emit(CoordinatorEvent::Unrecognized {
                    envelope_id,
                    sender,
                    reason,
                });
            }
        }
    }

    fn handle_store_change(&mut self, change: RowChange) {
        match change {
            RowChange::Proposal {
                envelope_id,
                proposal,
            } => {
                if proposal.group_id != self.group_id {
                    return;
                }
                let id = proposal.id().clone();
                match self
                    .aggregator
                    .apply_proposal_event(EventSource::Store, envelope_id, proposal.clone())
                {
                    Ok(ProposalApplied::Created { votes_applied }) => {
                        self.emit(CoordinatorEvent::ProposalAdded(proposal));
                        if votes_applied > 0 {
                            self.emit_tally_changed(&id);
                        }
                    }
                    Ok(ProposalApplied::Duplicate) => {}
                    Err(conflict) => {
                        self.emit(CoordinatorEvent::ProposalConflict {
                            proposal_id: conflict.proposal_id,
                            source: EventSource::Store,
                        });
                    }
                }
            }
            RowChange::Vote {
                envelope_id,
                proposal_id,
                vote,
            } => {
                if self
                    .aggregator
                    .apply_vote_event(EventSource::Store, envelope_id, vote)
                    == Some(VoteOutcome::Accepted)
                {
                    self.emit_tally_changed(&proposal_id);
                }
            }
        }
    }

    /// Apply a proposal learned from the stream, persisting it so it
    /// survives restarts.
    async fn apply_remote_proposal(&mut self, envelope_id: EnvelopeId, proposal: Proposal) {
        let id = proposal.id().clone();
        match self
            .aggregator
            .apply_proposal_event(EventSource::Stream, envelope_id, proposal.clone())
        {
            Ok(ProposalApplied::Created { votes_applied }) => {
                self.emit(CoordinatorEvent::ProposalAdded(proposal.clone()));
                if votes_applied > 0 {
                    self.emit_tally_changed(&id);
                }
                if let Err(e) = self.store.insert_proposal(proposal).await {
                    tracing::error!(?e, proposal_id = %id, "proposal persist failed");
                }
            }
            Ok(ProposalApplied::Duplicate) => {}
            Err(conflict) => {
                self.emit(CoordinatorEvent::ProposalConflict {
                    proposal_id: conflict.proposal_id,
                    source: EventSource::Stream,
                });
            }
        }
    }

    async fn apply_remote_vote(&mut self, envelope_id: EnvelopeId, vote: Vote) {
        let proposal_id = vote.proposal_id.clone();
        if self
            .aggregator
            .apply_vote_event(EventSource::Stream, envelope_id, vote.clone())
            == Some(VoteOutcome::Accepted)
        {
            self.emit_tally_changed(&proposal_id);
            if let Err(e) = self.store.insert_vote(proposal_id.clone(), vote).await {
                tracing::error!(?e, proposal_id = %proposal_id, "vote persist failed");
            }
        }
    }

    async fn refresh_statuses(&mut self) {
        for (proposal_id, status) in self.aggregator.refresh_statuses(Utc::now()) {
            self.emit(CoordinatorEvent::StatusChanged {
                proposal_id: proposal_id.clone(),
                status,
            });
            if let Some(proposal) = self.aggregator.proposal(&proposal_id)
                && let Err(e) = self.store.update_proposal(proposal).await
            {
                tracing::error!(?e, %proposal_id, "status persist failed");
            }
        }
    }

    fn emit_tally_changed(&self, proposal_id: &ProposalId) {
        if let Some(tally) = self.aggregator.tally(proposal_id) {
            self.emit(CoordinatorEvent::TallyChanged {
                proposal_id: proposal_id.clone(),
                tally,
            });
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.event_tx.send(event);
    }
}
