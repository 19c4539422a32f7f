//! Per-peer negotiation session state machine
//!
//! One [`PeerSession`] exists per remote participant while negotiation is
//! live. It is a pure state machine: the dispatcher checks a guard, performs
//! the capability I/O, then records the outcome. Guards make repeated
//! delivery harmless: a message that finds its effect already recorded is
//! discarded without side effects.

use crate::keys::MediaKey;
use crate::negotiation::Candidate;
use crate::types::{ConnectionState, NegotiationState, ParticipantId, Role};

/// What to do with a remote candidate, decided by session state
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateDisposition {
    /// A remote description exists; apply through the capability now
    ApplyNow(Candidate),
    /// No remote description yet; held for replay after one arrives
    Buffered,
    /// Session is closed; candidate dropped
    Discarded,
}

/// Negotiation state for one remote participant
#[derive(Debug)]
pub struct PeerSession {
    peer_id: ParticipantId,
    role: Role,
    negotiation_state: NegotiationState,
    connection_state: ConnectionState,
    pending_remote_candidates: Vec<Candidate>,
    encryption_key: Option<MediaKey>,
    encryption_confirmed: bool,
    remote_description_set: bool,
    local_description_set: bool,
}

impl PeerSession {
    /// Create a session in the Idle negotiation state
    ///
    /// The role is fixed here for the lifetime of the attempt.
    #[must_use]
    pub fn new(peer_id: ParticipantId, role: Role) -> Self {
        Self {
            peer_id,
            role,
            negotiation_state: NegotiationState::Idle,
            connection_state: ConnectionState::New,
            pending_remote_candidates: Vec::new(),
            encryption_key: None,
            encryption_confirmed: false,
            remote_description_set: false,
            local_description_set: false,
        }
    }

    /// The remote participant this session negotiates with
    #[must_use]
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    /// Negotiation role of the local side
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current handshake progress
    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation_state
    }

    /// Last connectivity state reported by the capability
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Whether the session has reached its terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.negotiation_state == NegotiationState::Closed
    }

    /// Whether a replacement session may be created for this peer
    ///
    /// True once negotiation is closed or the capability reported terminal
    /// connectivity; a live session is never silently replaced.
    #[must_use]
    pub fn is_replaceable(&self) -> bool {
        self.is_closed()
            || matches!(
                self.connection_state,
                ConnectionState::Failed | ConnectionState::Closed
            )
    }

    /// Guard for sending the initial offer
    ///
    /// Only the offeror offers, exactly once, from Idle.
    #[must_use]
    pub fn can_send_offer(&self) -> bool {
        self.role == Role::Offeror
            && self.negotiation_state == NegotiationState::Idle
            && !self.local_description_set
    }

    /// Record that the local offer was produced, applied, and emitted
    pub fn mark_offer_sent(&mut self) {
        self.local_description_set = true;
        self.negotiation_state = NegotiationState::HaveLocalOffer;
    }

    /// Guard for applying a remote offer
    ///
    /// A repeat of an already-applied offer fails this guard and must be
    /// discarded without side effects.
    #[must_use]
    pub fn can_apply_remote_offer(&self) -> bool {
        matches!(
            self.negotiation_state,
            NegotiationState::Idle | NegotiationState::HaveRemoteOffer
        ) && !self.remote_description_set
    }

    /// Record that the remote offer description was applied
    pub fn mark_remote_offer(&mut self) {
        self.remote_description_set = true;
        self.negotiation_state = NegotiationState::HaveRemoteOffer;
    }

    /// Record that the local answer was produced, applied, and emitted
    pub fn mark_answer_sent(&mut self) {
        self.local_description_set = true;
        self.negotiation_state = NegotiationState::Stable;
    }

    /// Guard for applying a remote answer
    ///
    /// Valid only while a local offer is awaiting one; anything else is a
    /// duplicate or a protocol violation and is discarded.
    #[must_use]
    pub fn can_apply_remote_answer(&self) -> bool {
        self.negotiation_state == NegotiationState::HaveLocalOffer && !self.remote_description_set
    }

    /// Record that the remote answer description was applied
    pub fn mark_remote_answer(&mut self) {
        self.remote_description_set = true;
        self.negotiation_state = NegotiationState::Stable;
    }

    /// Decide what to do with an inbound remote candidate
    ///
    /// Candidates arriving before the remote description are buffered in
    /// receipt order; [`Self::drain_pending_candidates`] replays them once a
    /// description exists.
    pub fn accept_candidate(&mut self, candidate: Candidate) -> CandidateDisposition {
        if self.is_closed() {
            return CandidateDisposition::Discarded;
        }
        if self.remote_description_set {
            return CandidateDisposition::ApplyNow(candidate);
        }
        self.pending_remote_candidates.push(candidate);
        CandidateDisposition::Buffered
    }

    /// Take the buffered candidates for replay, in receipt order
    #[must_use]
    pub fn drain_pending_candidates(&mut self) -> Vec<Candidate> {
        std::mem::take(&mut self.pending_remote_candidates)
    }

    /// Number of candidates currently buffered
    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    /// Record the connectivity state reported by the capability
    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    /// Install the media key for this session
    pub fn set_encryption_key(&mut self, key: MediaKey) {
        self.encryption_key = Some(key);
    }

    /// The installed media key, if the session is encrypted
    #[must_use]
    pub fn encryption_key(&self) -> Option<&MediaKey> {
        self.encryption_key.as_ref()
    }

    /// Record the remote ENCRYPTION_ENABLED acknowledgment
    ///
    /// Returns `true` only for the first acknowledgment of an installed key;
    /// replays and acks without a key report `false`.
    pub fn confirm_encryption(&mut self) -> bool {
        if self.encryption_key.is_none() || self.encryption_confirmed {
            return false;
        }
        self.encryption_confirmed = true;
        true
    }

    /// Close the session: terminal, idempotent
    ///
    /// Buffers and key material are dropped here; releasing the capability is
    /// the dispatcher's job since it owns the I/O.
    pub fn close(&mut self) {
        self.negotiation_state = NegotiationState::Closed;
        self.pending_remote_candidates.clear();
        self.encryption_key = None;
        self.encryption_confirmed = false;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(n: u32) -> Candidate {
        Candidate(json!({ "candidate": format!("candidate:{n}") }))
    }

    fn offeror_session() -> PeerSession {
        PeerSession::new(ParticipantId::new("bob"), Role::Offeror)
    }

    fn answerer_session() -> PeerSession {
        PeerSession::new(ParticipantId::new("alice"), Role::Answerer)
    }

    #[test]
    fn new_session_starts_idle() {
        let session = offeror_session();
        assert_eq!(session.negotiation_state(), NegotiationState::Idle);
        assert_eq!(session.connection_state(), ConnectionState::New);
        assert_eq!(session.pending_candidate_count(), 0);
        assert!(session.encryption_key().is_none());
    }

    #[test]
    fn only_the_offeror_may_offer() {
        let offeror = offeror_session();
        let answerer = answerer_session();
        assert!(offeror.can_send_offer());
        assert!(!answerer.can_send_offer());
    }

    #[test]
    fn offer_is_sent_once() {
        let mut session = offeror_session();
        assert!(session.can_send_offer());
        session.mark_offer_sent();
        assert_eq!(session.negotiation_state(), NegotiationState::HaveLocalOffer);
        assert!(!session.can_send_offer());
    }

    #[test]
    fn remote_offer_applies_only_once() {
        let mut session = answerer_session();
        assert!(session.can_apply_remote_offer());
        session.mark_remote_offer();
        assert_eq!(session.negotiation_state(), NegotiationState::HaveRemoteOffer);
        // Replay of the same offer finds the remote description set
        assert!(!session.can_apply_remote_offer());
        session.mark_answer_sent();
        assert_eq!(session.negotiation_state(), NegotiationState::Stable);
        assert!(!session.can_apply_remote_offer());
    }

    #[test]
    fn remote_offer_rejected_after_local_offer() {
        let mut session = offeror_session();
        session.mark_offer_sent();
        assert!(!session.can_apply_remote_offer());
    }

    #[test]
    fn remote_answer_requires_awaiting_local_offer() {
        let mut offeror = offeror_session();
        assert!(!offeror.can_apply_remote_answer());
        offeror.mark_offer_sent();
        assert!(offeror.can_apply_remote_answer());
        offeror.mark_remote_answer();
        assert_eq!(offeror.negotiation_state(), NegotiationState::Stable);
        assert!(!offeror.can_apply_remote_answer());

        let answerer = answerer_session();
        assert!(!answerer.can_apply_remote_answer());
    }

    #[test]
    fn early_candidates_buffer_in_receipt_order() {
        let mut session = answerer_session();
        assert_eq!(session.accept_candidate(candidate(1)), CandidateDisposition::Buffered);
        assert_eq!(session.accept_candidate(candidate(2)), CandidateDisposition::Buffered);
        assert_eq!(session.accept_candidate(candidate(3)), CandidateDisposition::Buffered);
        assert_eq!(session.pending_candidate_count(), 3);

        session.mark_remote_offer();
        let drained = session.drain_pending_candidates();
        assert_eq!(drained, vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(session.pending_candidate_count(), 0);

        // Once a remote description exists, candidates apply immediately
        assert_eq!(
            session.accept_candidate(candidate(4)),
            CandidateDisposition::ApplyNow(candidate(4))
        );
        assert_eq!(session.pending_candidate_count(), 0);
    }

    #[test]
    fn closed_session_discards_candidates() {
        let mut session = answerer_session();
        session.close();
        assert_eq!(session.accept_candidate(candidate(1)), CandidateDisposition::Discarded);
        assert_eq!(session.pending_candidate_count(), 0);
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let mut session = offeror_session();
        let key = crate::keys::generate().unwrap();
        session.set_encryption_key(key);
        let _ = session.accept_candidate(candidate(1));

        session.close();
        assert!(session.is_closed());
        assert!(session.encryption_key().is_none());
        assert_eq!(session.pending_candidate_count(), 0);
        assert!(!session.can_send_offer());
        assert!(!session.can_apply_remote_offer());

        session.close();
        assert!(session.is_closed());
    }

    #[test]
    fn replaceable_only_when_closed_or_failed() {
        let mut session = offeror_session();
        assert!(!session.is_replaceable());

        session.set_connection_state(ConnectionState::Connected);
        assert!(!session.is_replaceable());

        session.set_connection_state(ConnectionState::Failed);
        assert!(session.is_replaceable());

        let mut closed = answerer_session();
        closed.close();
        assert!(closed.is_replaceable());
    }

    #[test]
    fn encryption_key_is_tracked_per_session() {
        let mut session = answerer_session();
        assert!(session.encryption_key().is_none());
        let key = crate::keys::generate().unwrap();
        session.set_encryption_key(key.clone());
        assert_eq!(session.encryption_key(), Some(&key));
    }

    #[test]
    fn encryption_ack_counts_once_and_needs_a_key() {
        let mut session = offeror_session();
        assert!(!session.confirm_encryption());

        session.set_encryption_key(crate::keys::generate().unwrap());
        assert!(session.confirm_encryption());
        assert!(!session.confirm_encryption());
    }
}
