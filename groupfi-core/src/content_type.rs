//! Typed envelope wire units.
//!
//! An [`Envelope`] is the unit exchanged over the group channel: a versioned
//! [`ContentTypeId`] tag, an optional string parameter map, and raw content
//! bytes. Envelopes carry no logic; the codec registry interprets them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Authority under which the built-in content types are registered.
pub const GROUPFI_AUTHORITY: &str = "groupfi.app";

/// A stable, versioned tag identifying how to interpret an envelope's bytes.
///
/// Codec lookup is exact on `(authority_id, type_id, version_major)`; the
/// minor version is informational and never affects dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTypeId {
    pub authority_id: String,
    pub type_id: String,
    pub version_major: u32,
    pub version_minor: u32,
}

impl ContentTypeId {
    #[must_use]
    pub fn new(
        authority_id: impl Into<String>,
        type_id: impl Into<String>,
        version_major: u32,
        version_minor: u32,
    ) -> Self {
        Self {
            authority_id: authority_id.into(),
            type_id: type_id.into(),
            version_major,
            version_minor,
        }
    }

    /// `(groupfi.app, proposal, 1, 0)`
    #[must_use]
    pub fn proposal() -> Self {
        Self::new(GROUPFI_AUTHORITY, "proposal", 1, 0)
    }

    /// `(groupfi.app, vote, 1, 0)`
    #[must_use]
    pub fn vote() -> Self {
        Self::new(GROUPFI_AUTHORITY, "vote", 1, 0)
    }

    /// The codec lookup key: authority, type and major version only.
    #[must_use]
    pub fn codec_key(&self) -> CodecKey {
        CodecKey {
            authority_id: self.authority_id.clone(),
            type_id: self.type_id.clone(),
            version_major: self.version_major,
        }
    }
}

impl fmt::Display for ContentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}.{}",
            self.authority_id, self.type_id, self.version_major, self.version_minor
        )
    }
}

/// Exact-match key used by the codec registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecKey {
    pub authority_id: String,
    pub type_id: String,
    pub version_major: u32,
}

/// Immutable wire unit: a content type tag, parameters and raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Which codec interprets `content`.
    #[serde(rename = "type")]
    pub content_type: ContentTypeId,
    /// Free-form string parameters (may be empty).
    pub parameters: BTreeMap<String, String>,
    /// The serialized payload. UTF-8 JSON for the built-in content types.
    pub content: Vec<u8>,
}

impl Envelope {
    #[must_use]
    pub fn new(content_type: ContentTypeId, content: Vec<u8>) -> Self {
        Self {
            content_type,
            parameters: BTreeMap::new(),
            content,
        }
    }
}
