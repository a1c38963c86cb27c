//! Test utilities: an in-memory group channel and helpers for spinning up
//! coordinators in integration tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use error_stack::Report;
use groupfi_client::{ChannelMessage, ConnectError, GroupChannel, PublishError, Session};
use groupfi_core::{
    Envelope, EnvelopeId, GroupId, MemberAddr, ProposalInput, ProposalType,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize tracing for tests.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("groupfi=debug")),
        )
        .with_test_writer()
        .try_init();
}

struct Subscriber {
    identity: MemberAddr,
    group_id: Option<GroupId>,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

struct HubInner {
    subscribers: Mutex<Vec<Subscriber>>,
}

/// An in-memory stand-in for the encrypted group-messaging transport.
///
/// Every published message is delivered to every live subscriber of the
/// group, including the author's own subscription, which is how the real
/// transport behaves.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A channel handle bound to one member identity.
    #[must_use]
    pub fn client(&self, identity: MemberAddr) -> HubChannel {
        HubChannel {
            inner: Arc::clone(&self.inner),
            identity,
        }
    }

    /// Sever every live subscription held by `identity`, ending its message
    /// streams. The member's channel handle stays valid and can resubscribe.
    pub fn disconnect(&self, identity: &MemberAddr) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|sub| sub.identity != *identity);
    }
}

/// One member's connection to a [`MemoryHub`].
#[derive(Clone)]
pub struct HubChannel {
    inner: Arc<HubInner>,
    identity: MemberAddr,
}

impl GroupChannel for HubChannel {
    type Messages = UnboundedReceiverStream<ChannelMessage>;

    async fn publish(
        &self,
        group_id: &GroupId,
        envelope: Envelope,
    ) -> Result<EnvelopeId, Report<PublishError>> {
        let envelope_id = EnvelopeId::generate();
        let message = ChannelMessage {
            envelope_id: envelope_id.clone(),
            group_id: group_id.clone(),
            sender: self.identity.clone(),
            sent_at: Utc::now(),
            envelope,
        };

        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            let wants = sub
                .group_id
                .as_ref()
                .is_none_or(|wanted| wanted == group_id);
            if !wants {
                return true;
            }
            sub.tx.send(message.clone()).is_ok()
        });

        Ok(envelope_id)
    }

    async fn subscribe(
        &self,
        group_id: Option<&GroupId>,
    ) -> Result<Self::Messages, Report<ConnectError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                identity: self.identity.clone(),
                group_id: group_id.cloned(),
                tx,
            });
        Ok(UnboundedReceiverStream::new(rx))
    }
}

/// A session acting as `name`.
#[must_use]
pub fn test_session(name: &str) -> Session {
    Session::new(MemberAddr::from(name))
}

/// A well-formed two-option proposal input.
#[must_use]
pub fn test_input(group_id: &GroupId, title: &str, deadline: DateTime<Utc>) -> ProposalInput {
    ProposalInput {
        group_id: group_id.clone(),
        title: title.to_owned(),
        description: "integration test proposal".to_owned(),
        proposal_type: ProposalType::Governance,
        options: vec!["Yes".to_owned(), "No".to_owned()],
        voting_deadline: deadline,
    }
}
