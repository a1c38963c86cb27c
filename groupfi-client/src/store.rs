//! Durable proposal and vote storage.
//!
//! The store is the catch-up path: rows written by one task are replayed
//! into the aggregator on startup and broadcast to live subscribers, so a
//! client that missed stream traffic converges from disk. Row identifiers
//! are stable across hydration and live change notifications, which lets
//! the aggregator treat both as redeliveries of the same event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use groupfi_core::{EnvelopeId, GroupId, MemberAddr, Proposal, ProposalId, Vote};
use tokio::sync::broadcast;

use crate::error::PersistError;

/// A row mutation fanned out to change subscribers.
#[derive(Debug, Clone)]
pub enum RowChange {
    Proposal {
        envelope_id: EnvelopeId,
        proposal: Proposal,
    },
    Vote {
        envelope_id: EnvelopeId,
        proposal_id: ProposalId,
        vote: Vote,
    },
}

/// Stable row identifier for a proposal, shared by hydration and change
/// notifications so both dedupe as one delivery.
#[must_use]
pub fn proposal_row_id(id: &ProposalId) -> EnvelopeId {
    EnvelopeId::from(format!("proposals/{id}"))
}

/// Stable row identifier for a vote. One row per (proposal, voter).
#[must_use]
pub fn vote_row_id(proposal_id: &ProposalId, voter: &MemberAddr) -> EnvelopeId {
    EnvelopeId::from(format!("votes/{proposal_id}/{voter}"))
}

/// Persistence seam for proposals and votes.
///
/// Inserts are idempotent at the row level: writing a row that already
/// exists returns `Ok(false)` and leaves the stored value untouched.
#[expect(async_fn_in_trait)]
pub trait ProposalStore: Clone + Send + Sync + 'static {
    /// Insert a proposal row. Returns whether the row was newly created.
    ///
    /// # Errors
    /// If the write could not be made durable.
    fn insert_proposal(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<bool, Report<PersistError>>> + Send;

    /// Overwrite an existing proposal row, for status transitions.
    ///
    /// # Errors
    /// If the write could not be made durable.
    fn update_proposal(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<(), Report<PersistError>>> + Send;

    /// Insert a vote row, unique per (proposal, voter). Returns whether the
    /// row was newly created.
    ///
    /// # Errors
    /// If the write could not be made durable.
    fn insert_vote(
        &self,
        proposal_id: ProposalId,
        vote: Vote,
    ) -> impl Future<Output = Result<bool, Report<PersistError>>> + Send;

    /// # Errors
    /// If the row could not be read.
    async fn get_proposal(
        &self,
        id: &ProposalId,
    ) -> Result<Option<Proposal>, Report<PersistError>>;

    /// All stored proposals for a group, in unspecified order.
    ///
    /// # Errors
    /// If the scan could not complete.
    async fn list_proposals(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<Proposal>, Report<PersistError>>;

    /// All stored votes for a proposal, in unspecified order.
    ///
    /// # Errors
    /// If the scan could not complete.
    async fn list_votes(&self, proposal_id: &ProposalId)
    -> Result<Vec<Vote>, Report<PersistError>>;

    /// Row changes applied after this call, including writes made through
    /// other clones of this store.
    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange>;
}

const VOTE_KEY_SEP: u8 = 0;

fn vote_key(proposal_id: &ProposalId, voter: &MemberAddr) -> Vec<u8> {
    let mut key = Vec::with_capacity(proposal_id.as_str().len() + voter.as_str().len() + 1);
    key.extend_from_slice(proposal_id.as_str().as_bytes());
    key.push(VOTE_KEY_SEP);
    key.extend_from_slice(voter.as_str().as_bytes());
    key
}

fn vote_prefix(proposal_id: &ProposalId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(proposal_id.as_str().len() + 1);
    prefix.extend_from_slice(proposal_id.as_str().as_bytes());
    prefix.push(VOTE_KEY_SEP);
    prefix
}

struct FjallInner {
    db: Database,
    proposals: Keyspace,
    votes: Keyspace,
    changes: broadcast::Sender<RowChange>,
    /// Serializes read-modify-write on insert so two clones cannot both
    /// observe a missing row and claim the same first write.
    write_lock: RwLock<()>,
}

/// [`ProposalStore`] backed by an on-disk fjall database.
#[derive(Clone)]
pub struct FjallStore {
    inner: Arc<FjallInner>,
}

impl FjallStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    /// If the database or its keyspaces could not be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Report<PersistError>> {
        let path = path.as_ref().to_owned();
        let inner = tokio::task::spawn_blocking(move || {
            let db = Database::builder(path)
                .open()
                .change_context(PersistError)?;
            let proposals = db
                .keyspace("proposals", KeyspaceCreateOptions::default)
                .change_context(PersistError)?;
            let votes = db
                .keyspace("votes", KeyspaceCreateOptions::default)
                .change_context(PersistError)?;
            Ok::<_, Report<PersistError>>(FjallInner {
                db,
                proposals,
                votes,
                changes: broadcast::channel(256).0,
                write_lock: RwLock::new(()),
            })
        })
        .await
        .change_context(PersistError)??;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, Report<PersistError>>
    where
        F: FnOnce(&FjallInner) -> Result<R, Report<PersistError>> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .change_context(PersistError)?
    }
}

impl ProposalStore for FjallStore {
    async fn insert_proposal(&self, proposal: Proposal) -> Result<bool, Report<PersistError>> {
        self.run_blocking(move |inner| {
            let key = proposal.id().as_str().as_bytes().to_vec();

            let guard = inner.write_lock.write().unwrap_or_else(|e| e.into_inner());
            if inner
                .proposals
                .get(&key)
                .change_context(PersistError)?
                .is_some()
            {
                return Ok(false);
            }

            let value = postcard::to_allocvec(&proposal).change_context(PersistError)?;
            inner
                .proposals
                .insert(key, &value)
                .change_context(PersistError)?;
            inner
                .db
                .persist(PersistMode::SyncAll)
                .change_context(PersistError)?;
            drop(guard);

            let _ = inner.changes.send(RowChange::Proposal {
                envelope_id: proposal_row_id(proposal.id()),
                proposal,
            });
            Ok(true)
        })
        .await
    }

    async fn update_proposal(&self, proposal: Proposal) -> Result<(), Report<PersistError>> {
        self.run_blocking(move |inner| {
            let key = proposal.id().as_str().as_bytes().to_vec();
            let value = postcard::to_allocvec(&proposal).change_context(PersistError)?;

            let guard = inner.write_lock.write().unwrap_or_else(|e| e.into_inner());
            inner
                .proposals
                .insert(key, &value)
                .change_context(PersistError)?;
            inner
                .db
                .persist(PersistMode::SyncAll)
                .change_context(PersistError)?;
            drop(guard);

            let _ = inner.changes.send(RowChange::Proposal {
                envelope_id: proposal_row_id(proposal.id()),
                proposal,
            });
            Ok(())
        })
        .await
    }

    async fn insert_vote(
        &self,
        proposal_id: ProposalId,
        vote: Vote,
    ) -> Result<bool, Report<PersistError>> {
        self.run_blocking(move |inner| {
            let key = vote_key(&proposal_id, &vote.voter);

            let guard = inner.write_lock.write().unwrap_or_else(|e| e.into_inner());
            if inner
                .votes
                .get(&key)
                .change_context(PersistError)?
                .is_some()
            {
                return Ok(false);
            }

            let value = postcard::to_allocvec(&vote).change_context(PersistError)?;
            inner
                .votes
                .insert(key, &value)
                .change_context(PersistError)?;
            inner
                .db
                .persist(PersistMode::SyncAll)
                .change_context(PersistError)?;
            drop(guard);

            let _ = inner.changes.send(RowChange::Vote {
                envelope_id: vote_row_id(&proposal_id, &vote.voter),
                proposal_id,
                vote,
            });
            Ok(true)
        })
        .await
    }

    async fn get_proposal(
        &self,
        id: &ProposalId,
    ) -> Result<Option<Proposal>, Report<PersistError>> {
        let key = id.as_str().as_bytes().to_vec();
        self.run_blocking(move |inner| {
            inner
                .proposals
                .get(&key)
                .change_context(PersistError)?
                .map(|value| postcard::from_bytes(&value).change_context(PersistError))
                .transpose()
        })
        .await
    }

    async fn list_proposals(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<Proposal>, Report<PersistError>> {
        let group_id = group_id.clone();
        self.run_blocking(move |inner| {
            let mut proposals = Vec::new();
            for guard in inner.proposals.iter() {
                let (_, value) = guard.into_inner().change_context(PersistError)?;
                let proposal: Proposal =
                    postcard::from_bytes(&value).change_context(PersistError)?;
                if proposal.group_id == group_id {
                    proposals.push(proposal);
                }
            }
            Ok(proposals)
        })
        .await
    }

    async fn list_votes(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Vec<Vote>, Report<PersistError>> {
        let prefix = vote_prefix(proposal_id);
        self.run_blocking(move |inner| {
            let mut votes = Vec::new();
            for guard in inner.votes.range(prefix.as_slice()..) {
                let (key, value) = guard.into_inner().change_context(PersistError)?;
                if !key.starts_with(&prefix) {
                    break;
                }
                votes.push(postcard::from_bytes(&value).change_context(PersistError)?);
            }
            Ok(votes)
        })
        .await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.inner.changes.subscribe()
    }
}

/// [`ProposalStore`] held entirely in memory, for tests and ephemeral
/// sessions.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    proposals: RwLock<HashMap<ProposalId, Proposal>>,
    votes: RwLock<HashMap<(ProposalId, MemberAddr), Vote>>,
    changes: broadcast::Sender<RowChange>,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            proposals: RwLock::new(HashMap::new()),
            votes: RwLock::new(HashMap::new()),
            changes: broadcast::channel(256).0,
        }
    }
}

impl ProposalStore for MemoryStore {
    async fn insert_proposal(&self, proposal: Proposal) -> Result<bool, Report<PersistError>> {
        let inserted = {
            let mut proposals = self
                .inner
                .proposals
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if proposals.contains_key(proposal.id()) {
                false
            } else {
                proposals.insert(proposal.id().clone(), proposal.clone());
                true
            }
        };
        if inserted {
            let _ = self.inner.changes.send(RowChange::Proposal {
                envelope_id: proposal_row_id(proposal.id()),
                proposal,
            });
        }
        Ok(inserted)
    }

    async fn update_proposal(&self, proposal: Proposal) -> Result<(), Report<PersistError>> {
        self.inner
            .proposals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(proposal.id().clone(), proposal.clone());
        let _ = self.inner.changes.send(RowChange::Proposal {
            envelope_id: proposal_row_id(proposal.id()),
            proposal,
        });
        Ok(())
    }

    async fn insert_vote(
        &self,
        proposal_id: ProposalId,
        vote: Vote,
    ) -> Result<bool, Report<PersistError>> {
        let key = (proposal_id.clone(), vote.voter.clone());
        let inserted = {
            let mut votes = self.inner.votes.write().unwrap_or_else(|e| e.into_inner());
            if votes.contains_key(&key) {
                false
            } else {
                votes.insert(key, vote.clone());
                true
            }
        };
        if inserted {
            let _ = self.inner.changes.send(RowChange::Vote {
                envelope_id: vote_row_id(&proposal_id, &vote.voter),
                proposal_id,
                vote,
            });
        }
        Ok(inserted)
    }

    async fn get_proposal(
        &self,
        id: &ProposalId,
    ) -> Result<Option<Proposal>, Report<PersistError>> {
        Ok(self
            .inner
            .proposals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn list_proposals(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<Proposal>, Report<PersistError>> {
        Ok(self
            .inner
            .proposals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| p.group_id == *group_id)
            .cloned()
            .collect())
    }

    async fn list_votes(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Vec<Vote>, Report<PersistError>> {
        Ok(self
            .inner
            .votes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((pid, _), _)| pid == proposal_id)
            .map(|(_, vote)| vote.clone())
            .collect())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use groupfi_core::{ProposalInput, ProposalType};

    use super::*;

    fn sample_proposal(title: &str) -> Proposal {
        let input = ProposalInput {
            group_id: GroupId::from("g1"),
            title: title.to_owned(),
            description: "pick one".to_owned(),
            proposal_type: ProposalType::Governance,
            options: vec!["yes".to_owned(), "no".to_owned()],
            voting_deadline: Utc::now() + Duration::hours(1),
        };
        input.into_proposal(ProposalId::generate(), MemberAddr::from("alice"))
    }

    #[tokio::test]
    async fn proposal_insert_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();

        let proposal = sample_proposal("lunch");
        assert!(store.insert_proposal(proposal.clone()).await.unwrap());
        assert!(!store.insert_proposal(proposal.clone()).await.unwrap());

        let loaded = store.get_proposal(proposal.id()).await.unwrap().unwrap();
        assert_eq!(loaded.content.title, "lunch");
    }

    #[tokio::test]
    async fn vote_rows_unique_per_voter() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();

        let pid = ProposalId::generate();
        let vote = Vote::new(pid.clone(), MemberAddr::from("bob"), 0, Utc::now());
        assert!(store.insert_vote(pid.clone(), vote.clone()).await.unwrap());
        assert!(!store.insert_vote(pid.clone(), vote).await.unwrap());

        let other = Vote::new(pid.clone(), MemberAddr::from("carol"), 1, Utc::now());
        assert!(store.insert_vote(pid.clone(), other).await.unwrap());

        assert_eq!(store.list_votes(&pid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn votes_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid = ProposalId::generate();

        {
            let store = FjallStore::open(dir.path()).await.unwrap();
            let vote = Vote::new(pid.clone(), MemberAddr::from("bob"), 0, Utc::now());
            store.insert_vote(pid.clone(), vote).await.unwrap();
        }

        let store = FjallStore::open(dir.path()).await.unwrap();
        assert_eq!(store.list_votes(&pid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn change_feed_carries_row_ids() {
        let store = MemoryStore::default();
        let mut changes = store.subscribe_changes();

        let proposal = sample_proposal("dinner");
        let expected = proposal_row_id(proposal.id());
        store.insert_proposal(proposal).await.unwrap();

        match changes.recv().await.unwrap() {
            RowChange::Proposal { envelope_id, .. } => assert_eq!(envelope_id, expected),
            RowChange::Vote { .. } => panic!("expected proposal change"),
        }
    }

    #[tokio::test]
    async fn list_proposals_filters_by_group() {
        let store = MemoryStore::default();
        store.insert_proposal(sample_proposal("a")).await.unwrap();

        let mut other = sample_proposal("b");
        other.group_id = GroupId::from("g2");
        store.insert_proposal(other).await.unwrap();

        let listed = store.list_proposals(&GroupId::from("g1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content.title, "a");
    }
}
