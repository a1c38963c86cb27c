//! Content codec records and the registry that dispatches on
//! [`ContentTypeId`].
//!
//! A codec is an explicit record of pure functions — no trait object with an
//! implicit required-method contract. The built-in codecs carry UTF-8 JSON
//! and register under the `groupfi.app` authority; new content types are
//! added by registering another record, without touching existing codecs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::content_type::{CodecKey, ContentTypeId, Envelope};
use crate::error::{DecodeError, EncodeError};
use crate::proposal::{ProposalContent, MAX_OPTIONS, MIN_OPTIONS};
use crate::vote::Vote;

/// A decoded domain object, tagged by which built-in codec produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedContent {
    Proposal(ProposalContent),
    Vote(Vote),
}

impl DecodedContent {
    /// The content type this object encodes under.
    #[must_use]
    pub fn content_type(&self) -> ContentTypeId {
        match self {
            DecodedContent::Proposal(_) => ContentTypeId::proposal(),
            DecodedContent::Vote(_) => ContentTypeId::vote(),
        }
    }
}

/// One registered codec: encode/decode/fallback over [`DecodedContent`].
///
/// All three functions are pure and stateless. `decode(encode(x)) == x`
/// must hold for every valid `x`, with instants truncated to the
/// transport's millisecond resolution on encode.
#[derive(Clone, Copy)]
pub struct Codec {
    pub encode: fn(&DecodedContent) -> Result<Envelope, EncodeError>,
    pub decode: fn(&Envelope) -> Result<DecodedContent, DecodeError>,
    /// Human-readable rendering for clients that lack the codec.
    pub fallback_text: fn(&DecodedContent) -> String,
}

/// Lookup table from content type to codec.
///
/// Lookup is exact on `(authority, type, major version)`; the minor version
/// is ignored.
pub struct CodecRegistry {
    codecs: HashMap<CodecKey, Codec>,
}

impl CodecRegistry {
    /// An empty registry with no codecs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// A registry with the proposal and vote codecs registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(&ContentTypeId::proposal(), PROPOSAL_CODEC);
        registry.register(&ContentTypeId::vote(), VOTE_CODEC);
        registry
    }

    /// Register a codec for `content_type`, replacing any previous entry
    /// with the same major version.
    pub fn register(&mut self, content_type: &ContentTypeId, codec: Codec) {
        self.codecs.insert(content_type.codec_key(), codec);
    }

    /// Encode a domain object into an envelope.
    ///
    /// # Errors
    ///
    /// [`EncodeError::UnknownType`] if no codec is registered for the
    /// object's content type; [`EncodeError::Content`] if serialization
    /// fails.
    pub fn encode(&self, content: &DecodedContent) -> Result<Envelope, EncodeError> {
        let content_type = content.content_type();
        let codec = self
            .codecs
            .get(&content_type.codec_key())
            .ok_or(EncodeError::UnknownType(content_type))?;
        (codec.encode)(content)
    }

    /// Decode an envelope into a domain object.
    ///
    /// # Errors
    ///
    /// [`DecodeError::UnknownType`] when no codec matches the envelope's
    /// type identifier; [`DecodeError::Malformed`] / [`DecodeError::Schema`]
    /// when the bytes do not satisfy the declared schema. Callers surface
    /// failures as unrecognized events rather than dropping the envelope.
    pub fn decode(&self, envelope: &Envelope) -> Result<DecodedContent, DecodeError> {
        let codec = self
            .codecs
            .get(&envelope.content_type.codec_key())
            .ok_or_else(|| DecodeError::UnknownType(envelope.content_type.clone()))?;
        (codec.decode)(envelope)
    }

    /// Render the human-readable fallback for a domain object.
    ///
    /// Returns `None` when no codec is registered for the object's type.
    #[must_use]
    pub fn fallback_text(&self, content: &DecodedContent) -> Option<String> {
        let codec = self.codecs.get(&content.content_type().codec_key())?;
        Some((codec.fallback_text)(content))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Truncate an instant to the transport's millisecond resolution.
///
/// Encoders apply this automatically; publishers also use it on locally
/// created records so the local copy matches what remote members decode.
#[must_use]
pub fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(instant.timestamp_millis()).unwrap_or(instant)
}

/// Codec for `(groupfi.app, proposal, 1, 0)`.
pub const PROPOSAL_CODEC: Codec = Codec {
    encode: encode_proposal,
    decode: decode_proposal,
    fallback_text: proposal_fallback,
};

/// Codec for `(groupfi.app, vote, 1, 0)`.
pub const VOTE_CODEC: Codec = Codec {
    encode: encode_vote,
    decode: decode_vote,
    fallback_text: vote_fallback,
};

fn encode_proposal(content: &DecodedContent) -> Result<Envelope, EncodeError> {
    let DecodedContent::Proposal(proposal) = content else {
        return Err(EncodeError::Content("expected proposal content".into()));
    };

    let mut wire = proposal.clone();
    wire.deadline = truncate_to_millis(wire.deadline);

    let bytes = serde_json::to_vec(&wire).map_err(|e| EncodeError::Content(e.to_string()))?;
    Ok(Envelope::new(ContentTypeId::proposal(), bytes))
}

fn decode_proposal(envelope: &Envelope) -> Result<DecodedContent, DecodeError> {
    let proposal: ProposalContent = serde_json::from_slice(&envelope.content)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let count = proposal.options.len();
    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&count) {
        return Err(DecodeError::Schema(format!(
            "option count {count} outside {MIN_OPTIONS}..={MAX_OPTIONS}"
        )));
    }

    Ok(DecodedContent::Proposal(proposal))
}

fn proposal_fallback(content: &DecodedContent) -> String {
    match content {
        DecodedContent::Proposal(p) => format!(
            "\u{1f4cb} Proposal: {}\n{}\nOptions: {}\nDeadline: {}",
            p.title,
            p.description,
            p.options.join(" | "),
            p.deadline.format("%Y-%m-%d")
        ),
        DecodedContent::Vote(_) => String::new(),
    }
}

fn encode_vote(content: &DecodedContent) -> Result<Envelope, EncodeError> {
    let DecodedContent::Vote(vote) = content else {
        return Err(EncodeError::Content("expected vote content".into()));
    };

    let mut wire = vote.clone();
    wire.cast_at = truncate_to_millis(wire.cast_at);

    let bytes = serde_json::to_vec(&wire).map_err(|e| EncodeError::Content(e.to_string()))?;
    Ok(Envelope::new(ContentTypeId::vote(), bytes))
}

fn decode_vote(envelope: &Envelope) -> Result<DecodedContent, DecodeError> {
    let vote: Vote = serde_json::from_slice(&envelope.content)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok(DecodedContent::Vote(vote))
}

fn vote_fallback(content: &DecodedContent) -> String {
    match content {
        DecodedContent::Vote(v) => {
            format!("\u{1f5f3} Vote cast for proposal {}", v.proposal_id)
        }
        DecodedContent::Proposal(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::id::{MemberAddr, ProposalId};
    use crate::proposal::ProposalType;

    fn sample_proposal() -> ProposalContent {
        ProposalContent {
            id: ProposalId::from("prop-1"),
            title: "Quarterly treasury allocation".into(),
            description: "Move 10% into the tooling budget".into(),
            options: vec!["Yes".into(), "No".into()],
            deadline: Utc::now() + Duration::hours(1),
            proposal_type: ProposalType::Treasury,
        }
    }

    fn sample_vote() -> Vote {
        Vote::new(
            ProposalId::from("prop-1"),
            MemberAddr::from("0xabc"),
            0,
            Utc::now(),
        )
    }

    #[test]
    fn proposal_round_trip_at_millisecond_resolution() {
        let registry = CodecRegistry::with_builtins();
        let original = sample_proposal();

        let envelope = registry
            .encode(&DecodedContent::Proposal(original.clone()))
            .expect("encode");
        assert_eq!(envelope.content_type, ContentTypeId::proposal());

        let decoded = registry.decode(&envelope).expect("decode");
        let DecodedContent::Proposal(decoded) = decoded else {
            panic!("expected proposal content");
        };

        let mut expected = original;
        expected.deadline = truncate_to_millis(expected.deadline);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn vote_round_trip_at_millisecond_resolution() {
        let registry = CodecRegistry::with_builtins();
        let original = sample_vote();

        let envelope = registry
            .encode(&DecodedContent::Vote(original.clone()))
            .expect("encode");
        let DecodedContent::Vote(decoded) = registry.decode(&envelope).expect("decode") else {
            panic!("expected vote content");
        };

        let mut expected = original;
        expected.cast_at = truncate_to_millis(expected.cast_at);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn wire_json_uses_camel_case_field_names() {
        let registry = CodecRegistry::with_builtins();
        let envelope = registry
            .encode(&DecodedContent::Vote(sample_vote()))
            .expect("encode");

        let value: serde_json::Value = serde_json::from_slice(&envelope.content).expect("json");
        let object = value.as_object().expect("object");
        assert!(object.contains_key("proposalId"));
        assert!(object.contains_key("selectedOption"));
        assert!(object.contains_key("voterAddress"));
        assert!(object.contains_key("weight"));
        assert!(object.contains_key("timestamp"));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let registry = CodecRegistry::with_builtins();
        let envelope = Envelope::new(
            ContentTypeId::new("groupfi.app", "poll", 1, 0),
            b"{}".to_vec(),
        );
        assert!(matches!(
            registry.decode(&envelope),
            Err(DecodeError::UnknownType(_))
        ));
    }

    #[test]
    fn decode_ignores_minor_version() {
        let registry = CodecRegistry::with_builtins();
        let mut envelope = registry
            .encode(&DecodedContent::Vote(sample_vote()))
            .expect("encode");
        envelope.content_type.version_minor = 7;
        assert!(registry.decode(&envelope).is_ok());
    }

    #[test]
    fn decode_rejects_missing_fields_as_malformed() {
        let registry = CodecRegistry::with_builtins();
        let envelope = Envelope::new(
            ContentTypeId::vote(),
            br#"{"proposalId":"p1","selectedOption":0}"#.to_vec(),
        );
        assert!(matches!(
            registry.decode(&envelope),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_option_count_outside_schema() {
        let registry = CodecRegistry::with_builtins();
        let mut single = sample_proposal();
        single.options = vec!["Yes".into()];

        // Bypass the registry for encoding: the schema check lives in decode.
        let bytes = serde_json::to_vec(&single).expect("json");
        let envelope = Envelope::new(ContentTypeId::proposal(), bytes);
        assert!(matches!(
            registry.decode(&envelope),
            Err(DecodeError::Schema(_))
        ));
    }

    #[test]
    fn fallback_text_matches_expected_rendering() {
        let registry = CodecRegistry::with_builtins();
        let text = registry
            .fallback_text(&DecodedContent::Vote(sample_vote()))
            .expect("fallback");
        assert_eq!(text, "\u{1f5f3} Vote cast for proposal prop-1");

        let text = registry
            .fallback_text(&DecodedContent::Proposal(sample_proposal()))
            .expect("fallback");
        assert!(text.starts_with("\u{1f4cb} Proposal: Quarterly treasury allocation"));
    }
}
