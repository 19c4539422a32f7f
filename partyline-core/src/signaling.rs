//! Wire envelope, codec, and the outbound gateway seam
//!
//! Every message on the signaling channel shares one JSON envelope shape.
//! Session descriptions, candidates, and key payloads ride inside `data`
//! as opaque JSON; the coordinator never inspects them.

use crate::types::ParticipantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted size of one encoded envelope, to bound per-message memory
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Maximum length of a participant identifier on the wire
pub const MAX_PARTICIPANT_ID_LENGTH: usize = 256;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Encoded envelope exceeds [`MAX_ENVELOPE_SIZE`]
    #[error("envelope size {0} exceeds maximum of {MAX_ENVELOPE_SIZE} bytes")]
    Oversized(usize),

    /// Envelope is not valid JSON or does not match the envelope shape
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Sender is empty or longer than [`MAX_PARTICIPANT_ID_LENGTH`]
    #[error("invalid sender: {0}")]
    InvalidSender(String),

    /// Recipient is present but empty or over-long
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// Signal type carried in the envelope `type` field
///
/// Wire names are SCREAMING_SNAKE_CASE strings. Unknown strings decode to
/// [`SignalType::Unknown`] and route to a no-op handler, keeping the codec
/// forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// A participant announces itself to the group
    Join,
    /// A participant departs the group
    Leave,
    /// Full presence list, sent to one recipient
    UserList,
    /// Ask for the presence list
    RequestUsers,
    /// Session-description offer
    Offer,
    /// Session-description answer
    Answer,
    /// Network reachability candidate
    Ice,
    /// Ring a peer
    CallRequest,
    /// Accept a ringing call
    CallAccepted,
    /// Decline a ringing call (also the busy auto-reply)
    CallRejected,
    /// End or cancel a call
    CallEnded,
    /// Exported symmetric media key from the offeror
    KeyExchange,
    /// Answerer acknowledgment that the media key was imported
    EncryptionEnabled,
    /// Any type string this version does not know
    #[serde(other)]
    Unknown,
}

/// One signaling message as carried on the wire
///
/// `recipient`, `data`, and `useEncryption` are optional and omitted from
/// the encoded form when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    /// Originating participant
    pub sender: ParticipantId,
    /// Addressee; absent means the envelope is for the whole group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ParticipantId>,
    /// Opaque payload (description, candidate, key, or id list)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Caller preference for media encryption
    #[serde(
        rename = "useEncryption",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub use_encryption: Option<bool>,
}

impl Envelope {
    /// Create an envelope with no recipient, payload, or encryption flag
    #[must_use]
    pub fn new(signal_type: SignalType, sender: ParticipantId) -> Self {
        Self {
            signal_type,
            sender,
            recipient: None,
            data: None,
            use_encryption: None,
        }
    }

    /// Address the envelope to one participant
    #[must_use]
    pub fn with_recipient(mut self, recipient: ParticipantId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Attach an opaque payload
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Mark the caller's encryption preference
    #[must_use]
    pub fn with_encryption(mut self, use_encryption: bool) -> Self {
        self.use_encryption = Some(use_encryption);
        self
    }

    /// Whether this envelope concerns the given local participant
    ///
    /// Broadcast envelopes (no recipient) concern everyone; addressed ones
    /// only their addressee. Used to absorb the broadcast fallback path for
    /// private messages.
    #[must_use]
    pub fn is_for(&self, local: &ParticipantId) -> bool {
        self.recipient.as_ref().map_or(true, |r| r == local)
    }
}

/// Decode one envelope from its wire form
///
/// # Errors
///
/// Returns [`CodecError`] if the input is over-sized, not valid envelope
/// JSON, or carries an invalid sender/recipient. An unknown `type` string is
/// not an error.
pub fn decode(raw: &str) -> Result<Envelope, CodecError> {
    if raw.len() > MAX_ENVELOPE_SIZE {
        return Err(CodecError::Oversized(raw.len()));
    }
    let envelope: Envelope = serde_json::from_str(raw)?;
    validate(&envelope)?;
    Ok(envelope)
}

/// Encode one envelope to its wire form
///
/// # Errors
///
/// Returns [`CodecError`] if the envelope fails validation or its encoded
/// form exceeds [`MAX_ENVELOPE_SIZE`].
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    validate(envelope)?;
    let raw = serde_json::to_string(envelope)?;
    if raw.len() > MAX_ENVELOPE_SIZE {
        return Err(CodecError::Oversized(raw.len()));
    }
    Ok(raw)
}

/// Validate envelope fields shared by encode and decode
fn validate(envelope: &Envelope) -> Result<(), CodecError> {
    if envelope.sender.is_empty() {
        return Err(CodecError::InvalidSender("empty".to_string()));
    }
    if envelope.sender.as_str().len() > MAX_PARTICIPANT_ID_LENGTH {
        return Err(CodecError::InvalidSender(format!(
            "length {} exceeds maximum of {}",
            envelope.sender.as_str().len(),
            MAX_PARTICIPANT_ID_LENGTH
        )));
    }
    if let Some(recipient) = &envelope.recipient {
        if recipient.is_empty() {
            return Err(CodecError::InvalidRecipient("empty".to_string()));
        }
        if recipient.as_str().len() > MAX_PARTICIPANT_ID_LENGTH {
            return Err(CodecError::InvalidRecipient(format!(
                "length {} exceeds maximum of {}",
                recipient.as_str().len(),
                MAX_PARTICIPANT_ID_LENGTH
            )));
        }
    }
    Ok(())
}

/// Outbound half of the signaling transport
///
/// Implement this for the concrete channel (websocket, broker topic, in-memory
/// router, ...). Envelopes without a recipient are broadcast to the whole
/// group; addressed envelopes go to their addressee, over a private channel if
/// one exists or tagged on the broadcast channel otherwise. Inbound envelopes
/// enter the core through
/// [`crate::switchboard::Switchboard::handle_envelope`], one call per
/// delivered envelope.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deliver one envelope
    async fn send(&self, envelope: Envelope) -> Result<(), Self::Error>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_hand_written_envelope() {
        let raw = r#"{"type":"OFFER","sender":"alice","recipient":"bob","data":{"sdp":"v=0","type":"offer"}}"#;
        let envelope = decode(raw).unwrap();
        assert_eq!(envelope.signal_type, SignalType::Offer);
        assert_eq!(envelope.sender, ParticipantId::new("alice"));
        assert_eq!(envelope.recipient, Some(ParticipantId::new("bob")));
        assert!(envelope.data.is_some());
        assert_eq!(envelope.use_encryption, None);
    }

    #[test]
    fn decodes_use_encryption_flag() {
        let raw = r#"{"type":"CALL_REQUEST","sender":"alice","recipient":"bob","useEncryption":true}"#;
        let envelope = decode(raw).unwrap();
        assert_eq!(envelope.signal_type, SignalType::CallRequest);
        assert_eq!(envelope.use_encryption, Some(true));
    }

    #[test]
    fn encodes_screaming_snake_type_names() {
        let envelope = Envelope::new(SignalType::CallRequest, ParticipantId::new("alice"))
            .with_recipient(ParticipantId::new("bob"))
            .with_encryption(true);
        let raw = encode(&envelope).unwrap();
        assert!(raw.contains("\"type\":\"CALL_REQUEST\""));
        assert!(raw.contains("\"useEncryption\":true"));
        assert!(!raw.contains("\"data\""));
    }

    #[test]
    fn omits_absent_optional_fields() {
        let envelope = Envelope::new(SignalType::Join, ParticipantId::new("alice"));
        let raw = encode(&envelope).unwrap();
        assert_eq!(raw, r#"{"type":"JOIN","sender":"alice"}"#);
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let raw = r#"{"type":"SOMETHING_NEW","sender":"alice"}"#;
        let envelope = decode(raw).unwrap();
        assert_eq!(envelope.signal_type, SignalType::Unknown);
    }

    #[test]
    fn rejects_empty_sender() {
        let raw = r#"{"type":"JOIN","sender":""}"#;
        assert!(matches!(decode(raw), Err(CodecError::InvalidSender(_))));
    }

    #[test]
    fn rejects_overlong_sender() {
        let long = "x".repeat(MAX_PARTICIPANT_ID_LENGTH + 1);
        let raw = format!(r#"{{"type":"JOIN","sender":"{long}"}}"#);
        assert!(matches!(decode(&raw), Err(CodecError::InvalidSender(_))));
    }

    #[test]
    fn rejects_oversized_input() {
        let padding = "x".repeat(MAX_ENVELOPE_SIZE);
        let raw = format!(r#"{{"type":"JOIN","sender":"alice","data":"{padding}"}}"#);
        assert!(matches!(decode(&raw), Err(CodecError::Oversized(_))));
    }

    #[test]
    fn rejects_non_envelope_json() {
        assert!(matches!(decode("[1,2,3]"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn broadcast_envelope_is_for_everyone() {
        let envelope = Envelope::new(SignalType::Join, ParticipantId::new("alice"));
        assert!(envelope.is_for(&ParticipantId::new("bob")));
        assert!(envelope.is_for(&ParticipantId::new("carol")));
    }

    #[test]
    fn addressed_envelope_is_only_for_its_recipient() {
        let envelope = Envelope::new(SignalType::Offer, ParticipantId::new("alice"))
            .with_recipient(ParticipantId::new("bob"));
        assert!(envelope.is_for(&ParticipantId::new("bob")));
        assert!(!envelope.is_for(&ParticipantId::new("carol")));
    }

    #[test]
    fn all_thirteen_wire_names_round_trip() {
        let names = [
            ("JOIN", SignalType::Join),
            ("LEAVE", SignalType::Leave),
            ("USER_LIST", SignalType::UserList),
            ("REQUEST_USERS", SignalType::RequestUsers),
            ("OFFER", SignalType::Offer),
            ("ANSWER", SignalType::Answer),
            ("ICE", SignalType::Ice),
            ("CALL_REQUEST", SignalType::CallRequest),
            ("CALL_ACCEPTED", SignalType::CallAccepted),
            ("CALL_REJECTED", SignalType::CallRejected),
            ("CALL_ENDED", SignalType::CallEnded),
            ("KEY_EXCHANGE", SignalType::KeyExchange),
            ("ENCRYPTION_ENABLED", SignalType::EncryptionEnabled),
        ];
        for (wire, variant) in names {
            let raw = format!(r#"{{"type":"{wire}","sender":"alice"}}"#);
            assert_eq!(decode(&raw).unwrap().signal_type, variant, "{wire}");
        }
    }
}
