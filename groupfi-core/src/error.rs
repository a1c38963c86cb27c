//! Matchable error types for the core.
//!
//! These are plain value errors: callers branch on them, so they carry their
//! detail in variants rather than behind a `Report`. The client crate wraps
//! them in `error_stack` contexts at its operation boundaries.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::content_type::ContentTypeId;
use crate::id::ProposalId;

/// Input rejected before any publish or persist took place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Title length outside the accepted 3..=255 range.
    TitleLength { length: usize },
    /// Fewer than two options.
    TooFewOptions { count: usize },
    /// More than ten options.
    TooManyOptions { count: usize },
    /// The same option string appears twice.
    DuplicateOption { option: String },
    /// An option is empty or whitespace-only.
    EmptyOption { index: usize },
    /// The voting deadline is not in the future.
    DeadlineNotInFuture { deadline: DateTime<Utc> },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::TitleLength { length } => {
                write!(f, "title must be 3 to 255 characters, got {length}")
            }
            ValidationError::TooFewOptions { count } => {
                write!(f, "at least 2 options required, got {count}")
            }
            ValidationError::TooManyOptions { count } => {
                write!(f, "at most 10 options allowed, got {count}")
            }
            ValidationError::DuplicateOption { option } => {
                write!(f, "duplicate option {option:?}")
            }
            ValidationError::EmptyOption { index } => {
                write!(f, "option {index} is empty")
            }
            ValidationError::DeadlineNotInFuture { deadline } => {
                write!(f, "voting deadline {deadline} is not in the future")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Encoding a domain object into an envelope failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// No codec is registered for this content type.
    UnknownType(ContentTypeId),
    /// The content could not be serialized.
    Content(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::UnknownType(ct) => write!(f, "no codec registered for {ct}"),
            EncodeError::Content(msg) => write!(f, "content encoding failed: {msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// An envelope's bytes do not match the declared type's schema.
///
/// Decode failures never affect any tally; the consumer surfaces the
/// envelope as an unrecognized event instead of dropping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No codec is registered for this content type.
    UnknownType(ContentTypeId),
    /// The bytes are not valid for the declared schema.
    Malformed(String),
    /// The bytes parsed but violate a schema constraint.
    Schema(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownType(ct) => write!(f, "no codec registered for {ct}"),
            DecodeError::Malformed(msg) => write!(f, "malformed content: {msg}"),
            DecodeError::Schema(msg) => write!(f, "schema violation: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A proposal event for an existing id with differing immutable fields.
///
/// Reported, never silently merged; the first-seen proposal stays in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictError {
    pub proposal_id: ProposalId,
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proposal {} already exists with different immutable fields",
            self.proposal_id
        )
    }
}

impl std::error::Error for ConflictError {}
