//! Groupfi Core - shared types for group decision-making
//!
//! This crate provides the pure, I/O-free heart of the system:
//!
//! - [`Envelope`] / [`ContentTypeId`] - the typed wire unit
//! - [`CodecRegistry`] - encodes/decodes domain objects to/from envelopes
//! - [`ProposalAggregator`] - the deduplicating vote tally engine
//!
//! The async transport, store and coordinator live in `groupfi-client`.

#![warn(clippy::pedantic)]

pub mod aggregator;
pub mod codec;
pub mod content_type;
pub mod error;
pub mod id;
pub mod proposal;
pub mod vote;

pub use aggregator::{EventSource, ProposalAggregator, ProposalApplied};
pub use codec::{Codec, CodecRegistry, DecodedContent, PROPOSAL_CODEC, VOTE_CODEC, truncate_to_millis};
pub use content_type::{CodecKey, ContentTypeId, Envelope, GROUPFI_AUTHORITY};
pub use error::{ConflictError, DecodeError, EncodeError, ValidationError};
pub use id::{EnvelopeId, GroupId, MemberAddr, ProposalId};
pub use proposal::{
    Proposal, ProposalContent, ProposalInput, ProposalStatus, ProposalType, QuorumPolicy,
    MAX_OPTIONS, MIN_OPTIONS, TITLE_MAX_LEN, TITLE_MIN_LEN,
};
pub use vote::{Vote, VoteOutcome, VoteTally};
