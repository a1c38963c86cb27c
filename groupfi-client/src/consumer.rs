//! Stream consumption state machine.
//!
//! Attaches to a group channel, pulls envelopes in delivery order, decodes
//! them through the codec registry and forwards domain events. Owns the
//! reconnect policy: a lost stream re-enters `Connecting` with exponential
//! backoff and jitter until the consumer is explicitly stopped. Gaps left
//! by a disconnect are closed by the coordinator's store catch-up, so the
//! consumer retries indefinitely rather than giving up.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use groupfi_core::{
    CodecRegistry, DecodeError, DecodedContent, Envelope, EnvelopeId, GroupId, MemberAddr,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::transport::GroupChannel;

/// Observable consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Streaming,
    Disconnected,
    /// Terminal; entered only through explicit stop.
    Closed,
}

/// A decoded (or undecodable) event forwarded to the aggregator side.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An envelope decoded by a registered codec.
    Content {
        envelope_id: EnvelopeId,
        group_id: GroupId,
        sender: MemberAddr,
        content: DecodedContent,
    },
    /// Unknown content type or bytes that do not match the declared schema.
    /// Never dropped: surfaced with the raw envelope for presentation.
    Unrecognized {
        envelope_id: EnvelopeId,
        group_id: GroupId,
        sender: MemberAddr,
        envelope: Envelope,
        reason: DecodeError,
    },
}

/// Reconnect and handshake timing.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// A connect attempt that has not reached `Streaming` within this bound
    /// is treated as a failure and follows the backoff path.
    pub connect_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

fn backoff_duration(attempt: u32, config: &ConsumerConfig) -> Duration {
    const MAX_EXPONENT: u32 = 16;
    let base_ms = u64::try_from(config.base_reconnect_delay.as_millis()).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(MAX_EXPONENT));
    let jitter = rand::random::<u64>() % (delay_ms / 2 + 1);
    Duration::from_millis(delay_ms + jitter).min(config.max_reconnect_delay)
}

enum StreamOutcome {
    Cancelled,
    Disconnected,
}

/// Pulls envelopes from one group channel subscription and forwards
/// [`StreamEvent`]s until stopped.
pub struct StreamConsumer<T: GroupChannel> {
    channel: T,
    registry: Arc<CodecRegistry>,
    /// Local identity; messages from this sender are echo-suppressed.
    identity: MemberAddr,
    /// `None` subscribes to every group of the session.
    group_id: Option<GroupId>,
    event_tx: mpsc::Sender<StreamEvent>,
    state_tx: watch::Sender<ConsumerState>,
    cancel_token: CancellationToken,
    config: ConsumerConfig,
}

impl<T: GroupChannel> StreamConsumer<T> {
    #[must_use]
    pub fn new(
        channel: T,
        registry: Arc<CodecRegistry>,
        identity: MemberAddr,
        group_id: Option<GroupId>,
        event_tx: mpsc::Sender<StreamEvent>,
        cancel_token: CancellationToken,
        config: ConsumerConfig,
    ) -> (Self, watch::Receiver<ConsumerState>) {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        (
            Self {
                channel,
                registry,
                identity,
                group_id,
                event_tx,
                state_tx,
                cancel_token,
                config,
            },
            state_rx,
        )
    }

    /// Drive the consumer until the cancellation token fires.
    pub async fn run(mut self) {
        let mut attempt = 0u32;

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            self.set_state(ConsumerState::Connecting);

            let subscribe = self.channel.subscribe(self.group_id.as_ref());
            let stream = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout, subscribe) => result,
            };

            match stream {
                Ok(Ok(messages)) => {
                    self.set_state(ConsumerState::Streaming);
                    attempt = 0;
                    match self.run_stream(messages).await {
                        StreamOutcome::Cancelled => break,
                        StreamOutcome::Disconnected => {}
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(?e, "group channel handshake failed");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.connect_timeout.as_millis(),
                        "group channel handshake timed out"
                    );
                }
            }

            self.set_state(ConsumerState::Disconnected);

            let delay = backoff_duration(attempt, &self.config);
            attempt = attempt.saturating_add(1);
            tracing::debug!(attempt, delay_ms = delay.as_millis(), "reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel_token.cancelled() => break,
            }
        }

        self.set_state(ConsumerState::Closed);
    }

    async fn run_stream(&mut self, mut messages: T::Messages) -> StreamOutcome {
        loop {
            let message = tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => return StreamOutcome::Cancelled,
                message = messages.next() => message,
            };

            let Some(message) = message else {
                tracing::debug!("message stream closed by transport");
                return StreamOutcome::Disconnected;
            };

            if message.sender == self.identity {
                tracing::trace!(envelope_id = %message.envelope_id, "suppressing own echo");
                continue;
            }

            let event = match self.registry.decode(&message.envelope) {
                Ok(content) => StreamEvent::Content {
                    envelope_id: message.envelope_id,
                    group_id: message.group_id,
                    sender: message.sender,
                    content,
                },
                Err(reason) => {
                    tracing::debug!(
                        envelope_id = %message.envelope_id,
                        content_type = %message.envelope.content_type,
                        %reason,
                        "undecodable envelope, forwarding as unrecognized"
                    );
                    StreamEvent::Unrecognized {
                        envelope_id: message.envelope_id,
                        group_id: message.group_id,
                        sender: message.sender,
                        envelope: message.envelope,
                        reason,
                    }
                }
            };

            if self.event_tx.send(event).await.is_err() {
                // Receiver gone: the coordinator shut down without us.
                return StreamOutcome::Cancelled;
            }
        }
    }

    fn set_state(&mut self, state: ConsumerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ConsumerConfig::default();

        let first = backoff_duration(0, &config);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(150));

        // Far past the cap exponent, the delay pins to the configured max.
        let capped = backoff_duration(30, &config);
        assert_eq!(capped, config.max_reconnect_delay);
    }
}
