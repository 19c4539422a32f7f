//! Seam to the external media-negotiation capability
//!
//! The coordinator drives offer/answer/candidate exchange but never builds
//! descriptions itself; a [`Negotiator`] does. Descriptions and candidates
//! are opaque JSON forwarded verbatim inside envelope `data`.

use crate::types::ParticipantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Negotiation capability errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The capability failed an operation
    #[error("negotiation capability failure: {0}")]
    Capability(String),

    /// The capability refused a description or candidate payload
    #[error("payload rejected by capability: {0}")]
    InvalidPayload(String),
}

/// Opaque session description produced or consumed by a [`Negotiator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

impl SessionDescription {
    /// Unwrap into the envelope payload form
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Opaque network reachability candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub Value);

impl Candidate {
    /// Unwrap into the envelope payload form
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// One peer's media-negotiation capability
///
/// Implementations wrap whatever produces descriptions and applies
/// candidates (a browser peer connection, a native stack, a scripted test
/// double). Locally gathered candidates and connection-state changes are
/// pushed back into the coordinator through its explicit entry points
/// ([`crate::switchboard::Switchboard::candidate_gathered`],
/// [`crate::switchboard::Switchboard::connection_state_changed`]); the trait
/// itself carries only the imperative operations the coordinator invokes.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Produce a local offer description
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Produce a local answer description
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a locally produced description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply the remote side's description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply one remote candidate
    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError>;

    /// Release capability resources; best-effort during teardown
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Produces one [`Negotiator`] per peer session
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// Create the capability instance for a new session with `peer`
    async fn create(&self, peer: &ParticipantId) -> Result<Arc<dyn Negotiator>, NegotiationError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_serializes_transparently() {
        let description = SessionDescription(json!({"type": "offer", "sdp": "v=0"}));
        let value = serde_json::to_value(&description).unwrap();
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0"}));
        let back: SessionDescription = serde_json::from_value(value).unwrap();
        assert_eq!(back, description);
    }

    #[test]
    fn candidate_round_trips_through_envelope_payload() {
        let candidate = Candidate(json!({"candidate": "candidate:1 1 udp 2122260223", "sdpMid": "0"}));
        let payload = candidate.clone().into_value();
        let back = Candidate(payload);
        assert_eq!(back, candidate);
    }
}
