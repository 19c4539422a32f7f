//! Call lifecycle control
//!
//! The call lifecycle (ring, accept, reject, timeout, cancel, end) is
//! distinct from the negotiation lifecycle: the controller decides *whether*
//! a pair talks, the session machine decides *how* the media path is
//! negotiated once they do. At most one call attempt is active per local
//! participant; further requests are refused busy.
//!
//! The controller is a pure phase machine. Inbound-message transitions
//! return `Option`: `None` means the message did not match the active
//! attempt and must be discarded idempotently. Local-action transitions
//! return `Result` with a typed refusal.

use crate::types::{CallDirection, CallPhase, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Call control errors for local actions
#[derive(Error, Debug)]
pub enum CallError {
    /// An attempt is already active with the named peer
    #[error("busy: call attempt already active with {0}")]
    Busy(ParticipantId),

    /// The action is not valid in the current phase
    #[error("not permitted in call phase {0:?}")]
    InvalidPhase(CallPhase),
}

/// Progress of one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptPhase {
    /// Waiting for a decision on either side
    Ringing,
    /// Accepted; the pair is in a call
    Accepted,
    /// Terminal: declined by the remote side
    Rejected,
    /// Terminal: the ring deadline elapsed unanswered
    TimedOut,
    /// Terminal: ended or cancelled
    Ended,
}

/// One call attempt, at most one active per local participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttempt {
    /// Which side placed the call
    pub direction: CallDirection,
    /// The other party
    pub peer_id: ParticipantId,
    /// Current progress
    pub phase: AttemptPhase,
    /// When the attempt began
    pub started_at: DateTime<Utc>,
    /// After this instant an unanswered outgoing attempt auto-fails
    pub deadline: Option<DateTime<Utc>>,
}

/// Routing decision for an inbound CALL_REQUEST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Idle; surface the ring to the user
    Ring,
    /// Replay of the request backing the active attempt; discard
    Duplicate,
    /// Active attempt with someone else; auto-reply busy
    Busy,
}

/// Phase machine for the local participant's call lifecycle
#[derive(Debug)]
pub struct CallController {
    attempt: Option<CallAttempt>,
    ring_timeout: Duration,
}

impl CallController {
    /// Create an idle controller with the given ring deadline window
    #[must_use]
    pub fn new(ring_timeout: Duration) -> Self {
        Self {
            attempt: None,
            ring_timeout,
        }
    }

    /// Current phase, derived from the active attempt
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        match &self.attempt {
            None => CallPhase::Idle,
            Some(attempt) => match (attempt.direction, attempt.phase) {
                (CallDirection::Outgoing, AttemptPhase::Ringing) => CallPhase::OutgoingRinging,
                (CallDirection::Incoming, AttemptPhase::Ringing) => CallPhase::IncomingRinging,
                _ => CallPhase::InCall,
            },
        }
    }

    /// Peer of the active attempt, if any
    #[must_use]
    pub fn active_peer(&self) -> Option<&ParticipantId> {
        self.attempt.as_ref().map(|a| &a.peer_id)
    }

    /// Whether any attempt is active
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.attempt.is_some()
    }

    /// Start an outgoing attempt toward `peer`
    ///
    /// # Errors
    ///
    /// [`CallError::Busy`] if any attempt is already active, including an
    /// unacknowledged incoming ring; the controller is strictly
    /// single-attempt.
    pub fn begin_outgoing(&mut self, peer: ParticipantId) -> Result<&CallAttempt, CallError> {
        if let Some(active) = &self.attempt {
            return Err(CallError::Busy(active.peer_id.clone()));
        }
        let now = Utc::now();
        let window =
            chrono::Duration::from_std(self.ring_timeout).unwrap_or(chrono::Duration::MAX);
        Ok(self.attempt.insert(CallAttempt {
            direction: CallDirection::Outgoing,
            peer_id: peer,
            phase: AttemptPhase::Ringing,
            started_at: now,
            deadline: Some(now + window),
        }))
    }

    /// Classify an inbound CALL_REQUEST from `sender`
    #[must_use]
    pub fn classify_request(&self, sender: &ParticipantId) -> RequestDisposition {
        match &self.attempt {
            None => RequestDisposition::Ring,
            Some(active) if active.peer_id == *sender => RequestDisposition::Duplicate,
            Some(_) => RequestDisposition::Busy,
        }
    }

    /// Start ringing for an incoming attempt from `sender`
    ///
    /// # Errors
    ///
    /// [`CallError::Busy`] if any attempt is already active; the dispatcher
    /// classifies first and auto-replies busy instead of calling this.
    pub fn begin_incoming(&mut self, sender: ParticipantId) -> Result<(), CallError> {
        if let Some(active) = &self.attempt {
            return Err(CallError::Busy(active.peer_id.clone()));
        }
        self.attempt = Some(CallAttempt {
            direction: CallDirection::Incoming,
            peer_id: sender,
            phase: AttemptPhase::Ringing,
            started_at: Utc::now(),
            deadline: None,
        });
        Ok(())
    }

    /// Accept the incoming ring; returns the caller to answer
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidPhase`] unless an incoming attempt is ringing.
    pub fn accept_incoming(&mut self) -> Result<ParticipantId, CallError> {
        match &mut self.attempt {
            Some(attempt)
                if attempt.direction == CallDirection::Incoming
                    && attempt.phase == AttemptPhase::Ringing =>
            {
                attempt.phase = AttemptPhase::Accepted;
                Ok(attempt.peer_id.clone())
            }
            _ => Err(CallError::InvalidPhase(self.phase())),
        }
    }

    /// Reject the incoming ring; returns the refused caller
    ///
    /// # Errors
    ///
    /// [`CallError::InvalidPhase`] unless an incoming attempt is ringing.
    pub fn reject_incoming(&mut self) -> Result<ParticipantId, CallError> {
        let ringing_in = self.attempt.as_ref().is_some_and(|a| {
            a.direction == CallDirection::Incoming && a.phase == AttemptPhase::Ringing
        });
        if !ringing_in {
            return Err(CallError::InvalidPhase(self.phase()));
        }
        self.attempt
            .take()
            .map(|a| a.peer_id)
            .ok_or_else(|| CallError::InvalidPhase(CallPhase::Idle))
    }

    /// Apply a CALL_ACCEPTED from `sender`
    ///
    /// Returns the accepted peer, or `None` when no matching outgoing ring
    /// exists (stale or duplicate message).
    pub fn remote_accepted(&mut self, sender: &ParticipantId) -> Option<ParticipantId> {
        match &mut self.attempt {
            Some(attempt)
                if attempt.direction == CallDirection::Outgoing
                    && attempt.phase == AttemptPhase::Ringing
                    && attempt.peer_id == *sender =>
            {
                attempt.phase = AttemptPhase::Accepted;
                Some(attempt.peer_id.clone())
            }
            _ => None,
        }
    }

    /// Apply a CALL_REJECTED from `sender`
    ///
    /// Returns the finished attempt, or `None` when nothing matches.
    pub fn remote_rejected(&mut self, sender: &ParticipantId) -> Option<CallAttempt> {
        self.take_outgoing_ringing(sender, AttemptPhase::Rejected)
    }

    /// Apply the ring-deadline expiry for `peer`
    ///
    /// `deadline` must equal the expiring attempt's own deadline; a stale
    /// timer waking after its attempt was replaced by a newer one to the
    /// same peer therefore cannot fire against the successor. Returns the
    /// timed-out attempt, or `None` when the attempt was already decided.
    pub fn ring_expired(
        &mut self,
        peer: &ParticipantId,
        deadline: DateTime<Utc>,
    ) -> Option<CallAttempt> {
        let matches = self.attempt.as_ref().is_some_and(|a| {
            a.direction == CallDirection::Outgoing
                && a.phase == AttemptPhase::Ringing
                && a.peer_id == *peer
                && a.deadline == Some(deadline)
        });
        if !matches {
            return None;
        }
        let mut finished = self.attempt.take()?;
        finished.phase = AttemptPhase::TimedOut;
        Some(finished)
    }

    /// Apply a CALL_ENDED from `sender`, valid in any phase of the attempt
    /// bound to that peer
    ///
    /// Returns the finished attempt; `None` on repeats or mismatches.
    pub fn remote_ended(&mut self, sender: &ParticipantId) -> Option<CallAttempt> {
        if !self.attempt.as_ref().is_some_and(|a| a.peer_id == *sender) {
            return None;
        }
        let mut finished = self.attempt.take()?;
        finished.phase = AttemptPhase::Ended;
        Some(finished)
    }

    /// End the active call, or cancel the outgoing ring
    ///
    /// Returns the finished attempt. `None` when idle (ending twice is a
    /// no-op) or while an incoming ring awaits its explicit accept/reject.
    pub fn end_active(&mut self) -> Option<CallAttempt> {
        let endable = self.attempt.as_ref().is_some_and(|a| {
            a.phase == AttemptPhase::Accepted
                || (a.direction == CallDirection::Outgoing && a.phase == AttemptPhase::Ringing)
        });
        if !endable {
            return None;
        }
        let mut finished = self.attempt.take()?;
        finished.phase = AttemptPhase::Ended;
        Some(finished)
    }

    /// Drop whatever attempt is active, for local shutdown
    ///
    /// Unlike [`end_active`](Self::end_active) this also clears an incoming
    /// ring; the departing side cannot answer it anyway.
    pub fn abandon(&mut self) -> Option<CallAttempt> {
        let mut finished = self.attempt.take()?;
        finished.phase = AttemptPhase::Ended;
        Some(finished)
    }

    fn take_outgoing_ringing(
        &mut self,
        peer: &ParticipantId,
        terminal: AttemptPhase,
    ) -> Option<CallAttempt> {
        let matches = self.attempt.as_ref().is_some_and(|a| {
            a.direction == CallDirection::Outgoing
                && a.phase == AttemptPhase::Ringing
                && a.peer_id == *peer
        });
        if !matches {
            return None;
        }
        let mut finished = self.attempt.take()?;
        finished.phase = terminal;
        Some(finished)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const RING: Duration = Duration::from_secs(30);

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    fn bob() -> ParticipantId {
        ParticipantId::new("bob")
    }

    fn carol() -> ParticipantId {
        ParticipantId::new("carol")
    }

    #[test]
    fn initiate_from_idle_sets_outgoing_ringing_with_deadline() {
        let mut controller = CallController::new(RING);
        let attempt = controller.begin_outgoing(bob()).unwrap();
        assert_eq!(attempt.direction, CallDirection::Outgoing);
        assert_eq!(attempt.phase, AttemptPhase::Ringing);
        let deadline = attempt.deadline.unwrap();
        assert!(deadline > Utc::now());
        assert_eq!(controller.phase(), CallPhase::OutgoingRinging);
        assert_eq!(controller.active_peer(), Some(&bob()));
    }

    #[test]
    fn second_initiate_is_refused_without_a_new_attempt() {
        let mut controller = CallController::new(RING);
        controller.begin_outgoing(bob()).unwrap();
        let err = controller.begin_outgoing(carol()).unwrap_err();
        assert!(matches!(err, CallError::Busy(peer) if peer == bob()));
        assert_eq!(controller.active_peer(), Some(&bob()));
    }

    #[test]
    fn initiate_while_incoming_ring_pending_is_busy() {
        let mut controller = CallController::new(RING);
        controller.begin_incoming(carol()).unwrap();
        let err = controller.begin_outgoing(bob()).unwrap_err();
        assert!(matches!(err, CallError::Busy(peer) if peer == carol()));
        assert_eq!(controller.phase(), CallPhase::IncomingRinging);
    }

    #[test]
    fn request_classification_by_phase_and_sender() {
        let mut controller = CallController::new(RING);
        assert_eq!(controller.classify_request(&bob()), RequestDisposition::Ring);

        controller.begin_incoming(bob()).unwrap();
        assert_eq!(controller.classify_request(&bob()), RequestDisposition::Duplicate);
        assert_eq!(controller.classify_request(&carol()), RequestDisposition::Busy);

        controller.accept_incoming().unwrap();
        // Replay from the in-call peer stays a duplicate, not a busy reply
        assert_eq!(controller.classify_request(&bob()), RequestDisposition::Duplicate);
        assert_eq!(controller.classify_request(&alice()), RequestDisposition::Busy);
    }

    #[test]
    fn accept_moves_incoming_to_in_call() {
        let mut controller = CallController::new(RING);
        controller.begin_incoming(bob()).unwrap();
        let peer = controller.accept_incoming().unwrap();
        assert_eq!(peer, bob());
        assert_eq!(controller.phase(), CallPhase::InCall);
    }

    #[test]
    fn accept_and_reject_require_incoming_ringing() {
        let mut controller = CallController::new(RING);
        assert!(matches!(
            controller.accept_incoming(),
            Err(CallError::InvalidPhase(CallPhase::Idle))
        ));
        assert!(matches!(
            controller.reject_incoming(),
            Err(CallError::InvalidPhase(CallPhase::Idle))
        ));

        controller.begin_outgoing(bob()).unwrap();
        assert!(matches!(
            controller.accept_incoming(),
            Err(CallError::InvalidPhase(CallPhase::OutgoingRinging))
        ));
    }

    #[test]
    fn reject_returns_to_idle() {
        let mut controller = CallController::new(RING);
        controller.begin_incoming(bob()).unwrap();
        let peer = controller.reject_incoming().unwrap();
        assert_eq!(peer, bob());
        assert_eq!(controller.phase(), CallPhase::Idle);
        assert!(!controller.is_busy());
    }

    #[test]
    fn remote_accept_matches_peer_and_cancels_nothing_else() {
        let mut controller = CallController::new(RING);
        controller.begin_outgoing(bob()).unwrap();

        // Stale accept from someone else is discarded
        assert_eq!(controller.remote_accepted(&carol()), None);
        assert_eq!(controller.phase(), CallPhase::OutgoingRinging);

        assert_eq!(controller.remote_accepted(&bob()), Some(bob()));
        assert_eq!(controller.phase(), CallPhase::InCall);

        // A replayed accept no longer matches a ringing attempt
        assert_eq!(controller.remote_accepted(&bob()), None);
        assert_eq!(controller.phase(), CallPhase::InCall);
    }

    #[test]
    fn remote_reject_finishes_the_attempt() {
        let mut controller = CallController::new(RING);
        controller.begin_outgoing(bob()).unwrap();
        let finished = controller.remote_rejected(&bob()).unwrap();
        assert_eq!(finished.phase, AttemptPhase::Rejected);
        assert_eq!(controller.phase(), CallPhase::Idle);
        assert_eq!(controller.remote_rejected(&bob()), None);
    }

    #[test]
    fn ring_expiry_loses_the_race_to_accept() {
        let mut controller = CallController::new(RING);
        let deadline = controller.begin_outgoing(bob()).unwrap().deadline.unwrap();
        controller.remote_accepted(&bob()).unwrap();
        assert_eq!(controller.ring_expired(&bob(), deadline), None);
        assert_eq!(controller.phase(), CallPhase::InCall);
    }

    #[test]
    fn ring_expiry_times_out_exactly_once() {
        let mut controller = CallController::new(RING);
        let deadline = controller.begin_outgoing(bob()).unwrap().deadline.unwrap();
        let finished = controller.ring_expired(&bob(), deadline).unwrap();
        assert_eq!(finished.phase, AttemptPhase::TimedOut);
        assert_eq!(controller.phase(), CallPhase::Idle);
        assert_eq!(controller.ring_expired(&bob(), deadline), None);
    }

    #[test]
    fn stale_ring_expiry_cannot_touch_a_successor_attempt() {
        let mut controller = CallController::new(RING);
        let stale = controller.begin_outgoing(bob()).unwrap().deadline.unwrap();
        controller.remote_rejected(&bob()).unwrap();

        // Redial the same peer; the old timer token no longer matches
        std::thread::sleep(Duration::from_millis(2));
        let fresh = controller.begin_outgoing(bob()).unwrap().deadline.unwrap();
        assert_ne!(stale, fresh);
        assert_eq!(controller.ring_expired(&bob(), stale), None);
        assert_eq!(controller.phase(), CallPhase::OutgoingRinging);
    }

    #[test]
    fn remote_ended_works_in_any_phase_idempotently() {
        let mut controller = CallController::new(RING);

        // While ringing out (remote cancelled our view of their decision)
        controller.begin_outgoing(bob()).unwrap();
        let finished = controller.remote_ended(&bob()).unwrap();
        assert_eq!(finished.phase, AttemptPhase::Ended);
        assert_eq!(controller.remote_ended(&bob()), None);

        // While the incoming side is still ringing (caller cancelled)
        controller.begin_incoming(carol()).unwrap();
        assert!(controller.remote_ended(&carol()).is_some());
        assert_eq!(controller.phase(), CallPhase::Idle);

        // In call
        controller.begin_incoming(carol()).unwrap();
        controller.accept_incoming().unwrap();
        assert!(controller.remote_ended(&carol()).is_some());
        assert_eq!(controller.phase(), CallPhase::Idle);
    }

    #[test]
    fn remote_ended_from_a_bystander_changes_nothing() {
        let mut controller = CallController::new(RING);
        controller.begin_incoming(bob()).unwrap();
        controller.accept_incoming().unwrap();
        assert_eq!(controller.remote_ended(&carol()), None);
        assert_eq!(controller.phase(), CallPhase::InCall);
    }

    #[test]
    fn end_active_covers_cancel_and_hangup_only() {
        let mut controller = CallController::new(RING);

        // Idle: no-op
        assert_eq!(controller.end_active(), None);

        // Cancel an outgoing ring
        controller.begin_outgoing(bob()).unwrap();
        let cancelled = controller.end_active().unwrap();
        assert_eq!(cancelled.phase, AttemptPhase::Ended);
        assert_eq!(controller.phase(), CallPhase::Idle);

        // Incoming ring needs an explicit accept/reject, not end
        controller.begin_incoming(bob()).unwrap();
        assert_eq!(controller.end_active(), None);
        assert_eq!(controller.phase(), CallPhase::IncomingRinging);

        // Hang up an accepted call
        controller.accept_incoming().unwrap();
        assert!(controller.end_active().is_some());
        assert_eq!(controller.phase(), CallPhase::Idle);
    }

    #[test]
    fn abandon_clears_even_an_incoming_ring() {
        let mut controller = CallController::new(RING);
        controller.begin_incoming(bob()).unwrap();
        let finished = controller.abandon().unwrap();
        assert_eq!(finished.phase, AttemptPhase::Ended);
        assert_eq!(controller.phase(), CallPhase::Idle);
        assert_eq!(controller.abandon(), None);
    }
}
