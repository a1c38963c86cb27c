//! Async client for group decision-making over an encrypted messaging
//! transport.
//!
//! A [`GroupCoordinator`] actor per joined group merges the live message
//! stream and the persisted store into one aggregated view, and handles
//! publish-side validation for proposals and votes. The transport and the
//! store are trait seams ([`GroupChannel`], [`ProposalStore`]); this crate
//! ships a [`FjallStore`] on-disk implementation and an in-memory one.

#![warn(clippy::pedantic)]

pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;

pub use consumer::{ConsumerConfig, ConsumerState, StreamConsumer, StreamEvent};
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, GroupCoordinator, TallySnapshot};
pub use error::{ConnectError, CoordinatorError, PersistError, PublishError};
pub use session::Session;
pub use store::{FjallStore, MemoryStore, ProposalStore, RowChange};
pub use transport::{ChannelMessage, GroupChannel};
