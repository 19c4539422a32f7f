//! Partyline - glare-free call signaling coordination
//!
//! This library is the per-participant coordinator for a group of peers that
//! place direct calls to each other over a shared signaling channel. It
//! features:
//!
//! - **Deterministic roles**: exactly one side of every pair offers, decided
//!   by identifier order or by who placed the call - no offer glare
//! - **Idempotent handshake**: duplicate and out-of-order OFFER/ANSWER/ICE
//!   messages are absorbed by state guards, assuming only at-least-once
//!   delivery
//! - **Candidate buffering**: early candidates are held and replayed in
//!   receipt order once a remote description exists
//! - **Single-call lifecycle**: ring, accept, reject, cancel, hang-up, and a
//!   ring deadline, with busy auto-rejection
//! - **Optional key bootstrap**: a symmetric media key delivered before the
//!   offer, best effort, never blocking call setup
//! - **Transport-agnostic**: the wire and the media stack stay behind the
//!   [`SignalingGateway`] and [`Negotiator`] traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use partyline_core::{ParticipantId, Switchboard, SwitchboardConfig, SwitchboardError};
//! use std::sync::Arc;
//! # use async_trait::async_trait;
//! # use partyline_core::{Envelope, NegotiationError, Negotiator, NegotiatorFactory, SignalingGateway};
//! # struct DropGateway;
//! # #[async_trait]
//! # impl SignalingGateway for DropGateway {
//! #     type Error = std::io::Error;
//! #     async fn send(&self, _envelope: Envelope) -> Result<(), Self::Error> {
//! #         Ok(())
//! #     }
//! # }
//! # struct NoMedia;
//! # #[async_trait]
//! # impl NegotiatorFactory for NoMedia {
//! #     async fn create(&self, _peer: &ParticipantId) -> Result<Arc<dyn Negotiator>, NegotiationError> {
//! #         Err(NegotiationError::Capability("no media stack wired up".into()))
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), SwitchboardError> {
//! let board = Switchboard::builder(
//!     ParticipantId::new("alice"),
//!     Arc::new(DropGateway),
//!     Arc::new(NoMedia),
//! )
//! .with_config(SwitchboardConfig::default())
//! .build();
//!
//! // Announce ourselves, then ring bob
//! board.join().await?;
//! board.initiate_call(&ParticipantId::new("bob")).await?;
//!
//! // React to what comes back
//! let mut events = board.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers, states, events, and configuration
pub mod types;

/// Envelope codec and the signaling gateway trait
pub mod signaling;

/// Negotiation capability traits and opaque payload wrappers
pub mod negotiation;

/// Media key generation, import/export, and wire encoding
pub mod keys;

/// Per-peer handshake state machine
pub mod session;

/// Call lifecycle phase machine
pub mod call;

/// Presence roster and session records
pub mod registry;

/// The switchboard: signal dispatch and call orchestration
pub mod switchboard;

// Re-export main types at crate root
pub use call::{AttemptPhase, CallAttempt, CallController, CallError, RequestDisposition};
pub use keys::{KeyError, MediaKey, MEDIA_KEY_LEN};
pub use negotiation::{
    Candidate, NegotiationError, Negotiator, NegotiatorFactory, SessionDescription,
};
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{CandidateDisposition, PeerSession};
pub use signaling::{
    CodecError, Envelope, SignalType, SignalingGateway, MAX_ENVELOPE_SIZE,
    MAX_PARTICIPANT_ID_LENGTH,
};
pub use switchboard::{Switchboard, SwitchboardBuilder, SwitchboardError};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::negotiation::{Candidate, Negotiator, NegotiatorFactory, SessionDescription};
    pub use crate::signaling::{Envelope, SignalType, SignalingGateway};
    pub use crate::switchboard::{Switchboard, SwitchboardBuilder, SwitchboardError};
    pub use crate::types::{
        CallPhase, ConnectionState, NegotiationState, ParticipantId, RejectReason, Role,
        SwitchboardConfig, SwitchboardEvent,
    };
}
