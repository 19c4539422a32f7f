//! Core coordinator types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of a participant on the signaling channel
///
/// Opaque and globally unique within one presence group. The derived
/// lexicographic ordering is used only for the deterministic offeror
/// tie-break, never for authorization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (invalid on the wire)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Negotiation role of the local side within one session attempt
///
/// Fixed at session creation and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Creates and sends the offer
    Offeror,
    /// Consumes the offer and replies with an answer
    Answerer,
}

impl Role {
    /// Role decision for auto-connect negotiation, where neither side is an
    /// explicit caller: the lexicographically smaller identifier offers.
    ///
    /// Exactly one of the two sides computes `Offeror` for any pair of
    /// distinct identifiers, which prevents offer glare.
    #[must_use]
    pub fn from_id_order(local: &ParticipantId, peer: &ParticipantId) -> Self {
        if local < peer {
            Self::Offeror
        } else {
            Self::Answerer
        }
    }
}

/// Offer/answer handshake progress, independent of transport connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// No description applied yet
    Idle,
    /// Local offer sent, awaiting the remote answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet produced
    HaveRemoteOffer,
    /// Both descriptions applied
    Stable,
    /// Terminal; session resources released
    Closed,
}

/// Connectivity reported by the negotiation capability, read-only to the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, no connectivity activity yet
    New,
    /// Path establishment in progress
    Connecting,
    /// Media path established
    Connected,
    /// Path lost, may recover
    Disconnected,
    /// Terminal failure
    Failed,
    /// Closed by either side
    Closed,
}

/// Call lifecycle phase of the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call activity
    Idle,
    /// We sent a call request and are waiting for the remote decision
    OutgoingRinging,
    /// A remote call request is waiting for the local decision
    IncomingRinging,
    /// Call accepted by either side, negotiation under way or complete
    InCall,
}

/// Which side initiated the active call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Placed by the local participant
    Outgoing,
    /// Placed by a remote participant
    Incoming,
}

/// Why a call attempt ended without connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The remote side declined the call
    Declined,
    /// No decision arrived within the ring deadline
    Timeout,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declined => write!(f, "declined by remote"),
            Self::Timeout => write!(f, "no answer within ring deadline"),
        }
    }
}

/// State-change notifications emitted by the switchboard
///
/// Downstream consumers (UI, media layer) subscribe via
/// [`crate::switchboard::Switchboard::subscribe_events`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchboardEvent {
    /// A participant joined the presence group
    PeerJoined {
        /// Who joined
        peer: ParticipantId,
    },
    /// A participant left the presence group
    PeerLeft {
        /// Who left
        peer: ParticipantId,
    },
    /// A full presence list was applied
    PresenceSynced {
        /// All currently known participants
        peers: Vec<ParticipantId>,
    },
    /// A remote participant is calling; accept or reject to proceed
    IncomingCall {
        /// The caller
        from: ParticipantId,
        /// Whether the caller requested media encryption
        encrypted: bool,
    },
    /// The remote side accepted our outgoing call
    CallAccepted {
        /// The accepting callee
        peer: ParticipantId,
    },
    /// An outgoing call attempt ended without connecting
    CallRejected {
        /// The callee that did not pick up
        peer: ParticipantId,
        /// Why the attempt ended
        reason: RejectReason,
    },
    /// The active call ended (either side, or cancelled while ringing)
    CallEnded {
        /// The other party
        peer: ParticipantId,
    },
    /// Offer/answer negotiation with a peer reached Stable
    NegotiationComplete {
        /// The negotiated peer
        peer: ParticipantId,
    },
    /// The negotiation capability reported a connectivity change
    ConnectionChanged {
        /// The affected peer
        peer: ParticipantId,
        /// The reported state
        state: ConnectionState,
    },
    /// The peer acknowledged the media key; encrypted transforms may install
    EncryptionEnabled {
        /// The acknowledging peer
        peer: ParticipantId,
    },
}

/// Retry policy for the presence bootstrap request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of send attempts while no presence list has arrived
    pub attempts: u32,
    /// Pause between consecutive attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(1000),
        }
    }
}

/// Switchboard configuration
#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// Negotiate with every peer discovered via JOIN, without an explicit
    /// call; the id tie-break decides which side offers
    pub auto_connect: bool,
    /// Bootstrap a symmetric media key before offering
    pub encryption: bool,
    /// How long an outgoing call may ring before timing out
    pub ring_timeout: Duration,
    /// Retry policy for [`crate::switchboard::Switchboard::request_presence`]
    pub presence_retry: RetryPolicy,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            auto_connect: false,
            encryption: false,
            ring_timeout: Duration::from_secs(30),
            presence_retry: RetryPolicy::default(),
        }
    }
}

/// Presence record for one known participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// The participant
    pub peer_id: ParticipantId,
    /// When this side learned of the participant
    pub joined_at: DateTime<Utc>,
}

impl PresenceEntry {
    /// Create an entry stamped with the current time
    #[must_use]
    pub fn now(peer_id: ParticipantId) -> Self {
        Self {
            peer_id,
            joined_at: Utc::now(),
        }
    }
}
