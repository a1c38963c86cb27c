//! Error contexts for client operations.
//!
//! Marker types are used as `error_stack` contexts with attachments for
//! detail; [`CoordinatorError`] is the public context of coordinator
//! operations and distinguishes the failure classes callers branch on.

use std::fmt;

use groupfi_core::{EncodeError, ProposalId, ValidationError};

/// Subscribing to the group channel failed.
#[derive(Debug)]
pub struct ConnectError;

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to connect to the group channel")
    }
}

impl std::error::Error for ConnectError {}

/// Publishing an envelope on the group channel failed.
///
/// A failed publish must not be assumed to have reached the store either;
/// the caller decides whether to retry the whole operation.
#[derive(Debug)]
pub struct PublishError;

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to publish on the group channel")
    }
}

impl std::error::Error for PublishError {}

/// A store read or write failed.
#[derive(Debug)]
pub struct PersistError;

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("store operation failed")
    }
}

impl std::error::Error for PersistError {}

/// Failure class of a coordinator operation.
#[derive(Debug)]
pub enum CoordinatorError {
    /// Input rejected before any publish or persist took place.
    Validation(ValidationError),
    /// The referenced proposal is not known to the aggregator.
    UnknownProposal(ProposalId),
    /// Encoding the domain object into an envelope failed.
    Encode(EncodeError),
    /// The group channel rejected the publish.
    Publish,
    /// The store write failed. The event was already published and applied
    /// locally; it may still reach other members via the stream.
    Persist,
    /// The coordinator actor has shut down.
    Closed,
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::Validation(e) => write!(f, "invalid input: {e}"),
            CoordinatorError::UnknownProposal(id) => write!(f, "unknown proposal {id}"),
            CoordinatorError::Encode(e) => write!(f, "encoding failed: {e}"),
            CoordinatorError::Publish => f.write_str("publish failed"),
            CoordinatorError::Persist => f.write_str("persist failed"),
            CoordinatorError::Closed => f.write_str("coordinator is shut down"),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Validation(e) => Some(e),
            CoordinatorError::Encode(e) => Some(e),
            _ => None,
        }
    }
}
