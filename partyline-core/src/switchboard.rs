//! Signal dispatch and call orchestration
//!
//! The [`Switchboard`] is the single entry point wiring the pure state
//! machines ([`PeerSession`], [`crate::call::CallController`]) to the
//! outside world: inbound envelopes come in through [`handle_envelope`],
//! local user actions through `initiate_call`/`accept_call`/..., and
//! capability callbacks through `candidate_gathered`/`negotiation_needed`.
//! Every mutation of shared state happens under a lock owned here; the
//! machines themselves never suspend.
//!
//! # Locking
//!
//! Three locks exist: the call controller, the registry, and one mutex per
//! peer session. The controller and registry are never held at the same
//! time, and a session mutex is never acquired while a registry guard is
//! held. Holding a session mutex across capability and gateway calls is
//! deliberate: it serializes all signals from one peer, which the handshake
//! machines rely on. Signals for different peers interleave freely.
//!
//! # Delivery assumptions
//!
//! The underlying channel is at-least-once and unordered. Callers should
//! deliver envelopes one at a time (awaiting each [`handle_envelope`])
//! to preserve per-sender receipt order; duplicates and stale messages are
//! absorbed by the state-machine guards rather than by the transport.
//!
//! [`handle_envelope`]: Switchboard::handle_envelope

use crate::call::{CallController, CallError, RequestDisposition};
use crate::keys;
use crate::negotiation::{Candidate, NegotiationError, NegotiatorFactory, SessionDescription};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{CandidateDisposition, PeerSession};
use crate::signaling::{decode, CodecError, Envelope, SignalType, SignalingGateway};
use crate::types::{
    CallPhase, ConnectionState, NegotiationState, ParticipantId, RejectReason, Role,
    SwitchboardConfig, SwitchboardEvent,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::AbortHandle;

/// Switchboard errors
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// The gateway refused or failed to send an envelope
    #[error("gateway send failed: {0}")]
    Gateway(String),

    /// An inbound envelope could not be decoded
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// A local call action was not valid in the current phase
    #[error("call: {0}")]
    Call(#[from] CallError),

    /// The negotiation capability failed
    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),
}

/// Per-participant signaling coordinator
///
/// Cheap to clone; clones share all state. See the module docs for the
/// locking and delivery model.
pub struct Switchboard<G: SignalingGateway> {
    local_id: ParticipantId,
    config: SwitchboardConfig,
    gateway: Arc<G>,
    negotiators: Arc<dyn NegotiatorFactory>,
    controller: Arc<Mutex<CallController>>,
    registry: Arc<RwLock<SessionRegistry>>,
    ring_timer: Arc<Mutex<Option<AbortHandle>>>,
    event_sender: broadcast::Sender<SwitchboardEvent>,
}

impl<G: SignalingGateway> Clone for Switchboard<G> {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id.clone(),
            config: self.config.clone(),
            gateway: Arc::clone(&self.gateway),
            negotiators: Arc::clone(&self.negotiators),
            controller: Arc::clone(&self.controller),
            registry: Arc::clone(&self.registry),
            ring_timer: Arc::clone(&self.ring_timer),
            event_sender: self.event_sender.clone(),
        }
    }
}

impl<G: SignalingGateway + 'static> Switchboard<G> {
    /// Create a switchboard for `local_id` over the given gateway
    #[must_use]
    pub fn new(
        local_id: ParticipantId,
        gateway: Arc<G>,
        negotiators: Arc<dyn NegotiatorFactory>,
        config: SwitchboardConfig,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(1000);
        let controller = CallController::new(config.ring_timeout);
        Self {
            local_id,
            config,
            gateway,
            negotiators,
            controller: Arc::new(Mutex::new(controller)),
            registry: Arc::new(RwLock::new(SessionRegistry::new())),
            ring_timer: Arc::new(Mutex::new(None)),
            event_sender,
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(
        local_id: ParticipantId,
        gateway: Arc<G>,
        negotiators: Arc<dyn NegotiatorFactory>,
    ) -> SwitchboardBuilder<G> {
        SwitchboardBuilder::new(local_id, gateway, negotiators)
    }

    /// The local participant
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Subscribe to switchboard events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SwitchboardEvent> {
        self.event_sender.subscribe()
    }

    /// Current call phase
    pub async fn call_phase(&self) -> CallPhase {
        self.controller.lock().await.phase()
    }

    /// Peer of the active call attempt, if any
    pub async fn active_peer(&self) -> Option<ParticipantId> {
        self.controller.lock().await.active_peer().cloned()
    }

    /// Known participants, sorted
    pub async fn roster(&self) -> Vec<ParticipantId> {
        self.registry.read().await.roster()
    }

    /// Whether a presence snapshot has been applied since startup
    pub async fn is_presence_synced(&self) -> bool {
        self.registry.read().await.is_synced()
    }

    /// Negotiation state of the session with `peer`, if one exists
    pub async fn negotiation_state(&self, peer: &ParticipantId) -> Option<NegotiationState> {
        let handle = self.registry.read().await.session(peer);
        match handle {
            Some(handle) => Some(handle.session().lock().await.negotiation_state()),
            None => None,
        }
    }

    /// Whether the session with `peer` holds a media key
    pub async fn session_encrypted(&self, peer: &ParticipantId) -> bool {
        let handle = self.registry.read().await.session(peer);
        match handle {
            Some(handle) => handle.session().lock().await.encryption_key().is_some(),
            None => false,
        }
    }

    /// Candidates buffered for `peer` awaiting a remote description
    pub async fn pending_candidates(&self, peer: &ParticipantId) -> usize {
        let handle = self.registry.read().await.session(peer);
        match handle {
            Some(handle) => handle.session().lock().await.pending_candidate_count(),
            None => 0,
        }
    }

    /// Announce the local participant and start the presence bootstrap
    ///
    /// # Errors
    ///
    /// Returns an error if the JOIN announcement or the first roster request
    /// cannot be sent; retries beyond the first request run in the
    /// background and only log.
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn join(&self) -> Result<(), SwitchboardError> {
        tracing::info!("joining presence group");
        self.send(Envelope::new(SignalType::Join, self.local_id.clone()))
            .await?;
        self.request_presence().await
    }

    /// Announce departure and tear everything down
    ///
    /// # Errors
    ///
    /// Returns an error if the LEAVE announcement cannot be sent; local
    /// teardown still completes.
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn leave(&self) -> Result<(), SwitchboardError> {
        tracing::info!("leaving presence group");
        let sent = self
            .send(Envelope::new(SignalType::Leave, self.local_id.clone()))
            .await;

        self.disarm_ring_timer().await;
        self.controller.lock().await.abandon();

        let handles = self.registry.write().await.drain_sessions();
        for handle in handles {
            handle.session().lock().await.close();
            if let Err(error) = handle.negotiator().close().await {
                tracing::warn!(peer = %handle.peer_id(), %error, "capability close failed");
            }
        }
        sent
    }

    /// Request the presence roster, with the configured retry policy
    ///
    /// Retries stop early once a USER_LIST has been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the first request cannot be sent.
    pub async fn request_presence(&self) -> Result<(), SwitchboardError> {
        self.send(Envelope::new(
            SignalType::RequestUsers,
            self.local_id.clone(),
        ))
        .await?;

        let retries = self.config.presence_retry.attempts.saturating_sub(1);
        if retries == 0 {
            return Ok(());
        }
        let board = self.clone();
        tokio::spawn(async move {
            for _ in 0..retries {
                tokio::time::sleep(board.config.presence_retry.backoff).await;
                if board.is_presence_synced().await {
                    break;
                }
                let envelope =
                    Envelope::new(SignalType::RequestUsers, board.local_id.clone());
                if let Err(error) = board.send(envelope).await {
                    tracing::warn!(%error, "roster re-request failed");
                }
            }
        });
        Ok(())
    }

    /// Ring `peer`
    ///
    /// Sends CALL_REQUEST carrying the local encryption preference and arms
    /// the ring deadline.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] (wrapped) when an attempt is already
    /// active, or a gateway error if the request cannot be sent; in that
    /// case no attempt is left behind.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn initiate_call(&self, peer: &ParticipantId) -> Result<(), SwitchboardError> {
        tracing::info!("initiating call");
        let mut controller = self.controller.lock().await;
        let attempt = controller.begin_outgoing(peer.clone())?;
        let deadline = attempt.deadline;

        let request = Envelope::new(SignalType::CallRequest, self.local_id.clone())
            .with_recipient(peer.clone())
            .with_encryption(self.config.encryption);
        if let Err(error) = self.send(request).await {
            controller.end_active();
            return Err(error);
        }

        if let Some(deadline) = deadline {
            self.arm_ring_timer(peer.clone(), deadline).await;
        }
        tracing::info!("ringing");
        Ok(())
    }

    /// Accept the currently ringing incoming call
    ///
    /// Sends CALL_ACCEPTED and creates the answerer-side session so the
    /// caller's OFFER lands on a ready record.
    ///
    /// # Errors
    ///
    /// Returns an error when no incoming call is ringing, the acceptance
    /// cannot be sent (the attempt is dropped), or the negotiation
    /// capability cannot be created.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), SwitchboardError> {
        tracing::info!("accepting call");
        let caller = {
            let mut controller = self.controller.lock().await;
            let caller = controller.accept_incoming()?;
            let accepted = Envelope::new(SignalType::CallAccepted, self.local_id.clone())
                .with_recipient(caller.clone());
            if let Err(error) = self.send(accepted).await {
                controller.abandon();
                return Err(error);
            }
            caller
        };
        self.ensure_session(&caller, Role::Answerer).await?;
        tracing::info!(peer = %caller, "call accepted");
        Ok(())
    }

    /// Reject the currently ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns an error when no incoming call is ringing or the rejection
    /// cannot be sent; either way the attempt is cleared and the caller's
    /// own deadline covers the lost message.
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), SwitchboardError> {
        tracing::info!("rejecting call");
        let caller = {
            let mut controller = self.controller.lock().await;
            controller.reject_incoming()?
        };
        self.send(
            Envelope::new(SignalType::CallRejected, self.local_id.clone())
                .with_recipient(caller.clone()),
        )
        .await?;
        tracing::info!(peer = %caller, "call rejected");
        Ok(())
    }

    /// Hang up the active call, or cancel an outgoing ring
    ///
    /// A no-op when nothing is active; ending twice is safe. The cancel path
    /// reuses CALL_ENDED so the remote bell stops ringing.
    ///
    /// # Errors
    ///
    /// Returns an error if the CALL_ENDED signal cannot be sent; local
    /// teardown still completes.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), SwitchboardError> {
        let finished = {
            let mut controller = self.controller.lock().await;
            let finished = controller.end_active();
            if finished.is_some() {
                self.disarm_ring_timer().await;
            }
            finished
        };
        let Some(finished) = finished else {
            tracing::debug!("end_call with no active attempt, nothing to do");
            return Ok(());
        };

        tracing::info!(peer = %finished.peer_id, "ending call");
        let sent = self
            .send(
                Envelope::new(SignalType::CallEnded, self.local_id.clone())
                    .with_recipient(finished.peer_id.clone()),
            )
            .await;
        self.teardown_session(&finished.peer_id).await;
        sent
    }

    /// Forward a locally gathered candidate to `peer`
    ///
    /// Dropped with a log when no session exists for the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the ICE envelope cannot be sent.
    pub async fn candidate_gathered(
        &self,
        peer: &ParticipantId,
        candidate: Candidate,
    ) -> Result<(), SwitchboardError> {
        if self.registry.read().await.session(peer).is_none() {
            tracing::debug!(%peer, "discarding local candidate, no session");
            return Ok(());
        }
        self.send(
            Envelope::new(SignalType::Ice, self.local_id.clone())
                .with_recipient(peer.clone())
                .with_data(candidate.into_value()),
        )
        .await
    }

    /// Record a connection-state report from the capability
    ///
    /// Terminal failures are surfaced as events only; teardown stays with
    /// the user via `end_call`/`leave`.
    pub async fn connection_state_changed(&self, peer: &ParticipantId, state: ConnectionState) {
        let handle = self.registry.read().await.session(peer);
        if let Some(handle) = handle {
            handle.session().lock().await.set_connection_state(state);
        }
        self.emit(SwitchboardEvent::ConnectionChanged {
            peer: peer.clone(),
            state,
        });
    }

    /// Honor a renegotiation request from the capability
    ///
    /// Only an offeror-side session still in Idle may offer; anything else
    /// is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if offer creation or delivery fails; the session is
    /// closed and a Failed state change is emitted first.
    pub async fn negotiation_needed(&self, peer: &ParticipantId) -> Result<(), SwitchboardError> {
        let handle = self.registry.read().await.session(peer);
        let Some(handle) = handle else {
            tracing::debug!(%peer, "negotiation needed without a session, ignoring");
            return Ok(());
        };
        self.send_offer_on(&handle).await.map(|_| ())
    }

    /// Apply one inbound envelope
    ///
    /// Malformed input surfaces as [`SwitchboardError::Codec`]. Everything
    /// else (duplicates, stale messages, protocol violations, capability
    /// failures) is absorbed here and reported through logs and events.
    ///
    /// # Errors
    ///
    /// Returns an error only when `raw` cannot be decoded.
    #[tracing::instrument(skip(self, raw))]
    pub async fn handle_envelope(&self, raw: &str) -> Result<(), SwitchboardError> {
        let envelope = decode(raw)?;
        if envelope.sender == self.local_id {
            tracing::trace!("dropping broadcast echo of our own envelope");
            return Ok(());
        }
        if !envelope.is_for(&self.local_id) {
            tracing::trace!(
                signal = ?envelope.signal_type,
                "dropping envelope addressed to another participant"
            );
            return Ok(());
        }
        tracing::debug!(signal = ?envelope.signal_type, sender = %envelope.sender, "routing envelope");

        let Envelope {
            signal_type,
            sender,
            data,
            use_encryption,
            ..
        } = envelope;

        match signal_type {
            SignalType::Join => self.on_join(sender).await,
            SignalType::Leave => self.on_leave(sender).await,
            SignalType::UserList => self.on_user_list(data).await,
            SignalType::RequestUsers => self.on_request_users(sender).await,
            SignalType::Offer => self.on_offer(sender, data).await,
            SignalType::Answer => self.on_answer(sender, data).await,
            SignalType::Ice => self.on_ice(sender, data).await,
            SignalType::CallRequest => {
                self.on_call_request(sender, use_encryption.unwrap_or(false))
                    .await;
            }
            SignalType::CallAccepted => self.on_call_accepted(sender).await,
            SignalType::CallRejected => self.on_call_rejected(sender).await,
            SignalType::CallEnded => self.on_call_ended(sender).await,
            SignalType::KeyExchange => self.on_key_exchange(sender, data).await,
            SignalType::EncryptionEnabled => self.on_encryption_enabled(sender).await,
            SignalType::Unknown => {
                tracing::debug!(%sender, "ignoring unknown signal type");
            }
        }
        Ok(())
    }

    async fn on_join(&self, peer: ParticipantId) {
        let newly_known = self.registry.write().await.record_join(peer.clone());
        if !newly_known {
            tracing::debug!(%peer, "repeated JOIN, roster unchanged");
            return;
        }
        tracing::info!(%peer, "participant joined");
        self.emit(SwitchboardEvent::PeerJoined { peer: peer.clone() });
        self.maybe_auto_connect(&peer).await;
    }

    async fn on_leave(&self, peer: ParticipantId) {
        let known = self.registry.write().await.record_leave(&peer);
        self.teardown_session(&peer).await;

        let dropped_call = {
            let mut controller = self.controller.lock().await;
            let finished = controller.remote_ended(&peer);
            if finished.is_some() {
                self.disarm_ring_timer().await;
            }
            finished
        };
        if dropped_call.is_some() {
            self.emit(SwitchboardEvent::CallEnded { peer: peer.clone() });
        }
        if known {
            tracing::info!(%peer, "participant left");
            self.emit(SwitchboardEvent::PeerLeft { peer });
        }
    }

    async fn on_user_list(&self, data: Option<Value>) {
        let Some(data) = data else {
            tracing::warn!("USER_LIST without a payload, dropping");
            return;
        };
        let peers: Vec<ParticipantId> = match serde_json::from_value(data) {
            Ok(peers) => peers,
            Err(error) => {
                tracing::warn!(%error, "USER_LIST payload is not an id array, dropping");
                return;
            }
        };

        let (added, roster) = {
            let mut registry = self.registry.write().await;
            let added = registry.merge_roster(peers, &self.local_id);
            (added, registry.roster())
        };
        tracing::info!(known = roster.len(), new = added.len(), "presence synchronized");
        self.emit(SwitchboardEvent::PresenceSynced { peers: roster });
        for peer in added {
            self.maybe_auto_connect(&peer).await;
        }
    }

    async fn on_request_users(&self, requester: ParticipantId) {
        let mut peers = self.registry.read().await.roster();
        peers.push(self.local_id.clone());
        peers.sort();
        let payload = match serde_json::to_value(&peers) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "could not encode roster reply");
                return;
            }
        };
        let reply = Envelope::new(SignalType::UserList, self.local_id.clone())
            .with_recipient(requester.clone())
            .with_data(payload);
        if let Err(error) = self.send(reply).await {
            tracing::warn!(%requester, %error, "roster reply failed");
        }
    }

    async fn on_call_request(&self, caller: ParticipantId, use_encryption: bool) {
        let mut controller = self.controller.lock().await;
        match controller.classify_request(&caller) {
            RequestDisposition::Ring => {
                if let Err(error) = controller.begin_incoming(caller.clone()) {
                    tracing::warn!(%caller, %error, "could not ring");
                    return;
                }
                tracing::info!(%caller, use_encryption, "incoming call");
                self.emit(SwitchboardEvent::IncomingCall {
                    from: caller,
                    encrypted: use_encryption,
                });
            }
            RequestDisposition::Duplicate => {
                tracing::debug!(%caller, "replayed CALL_REQUEST for the active attempt, discarding");
            }
            RequestDisposition::Busy => {
                tracing::info!(%caller, "busy, auto-rejecting call request");
                let busy = Envelope::new(SignalType::CallRejected, self.local_id.clone())
                    .with_recipient(caller.clone());
                if let Err(error) = self.send(busy).await {
                    tracing::warn!(%caller, %error, "busy rejection failed");
                }
            }
        }
    }

    async fn on_call_accepted(&self, callee: ParticipantId) {
        let accepted = {
            let mut controller = self.controller.lock().await;
            let accepted = controller.remote_accepted(&callee);
            if accepted.is_some() {
                self.disarm_ring_timer().await;
            }
            accepted
        };
        let Some(peer) = accepted else {
            tracing::debug!(%callee, "stale CALL_ACCEPTED, discarding");
            return;
        };
        tracing::info!(%peer, "call accepted by remote");
        self.emit(SwitchboardEvent::CallAccepted { peer: peer.clone() });

        if let Err(error) = self.start_offer_flow(&peer).await {
            tracing::warn!(%peer, %error, "offer flow failed after acceptance");
        }
    }

    async fn on_call_rejected(&self, callee: ParticipantId) {
        let finished = {
            let mut controller = self.controller.lock().await;
            let finished = controller.remote_rejected(&callee);
            if finished.is_some() {
                self.disarm_ring_timer().await;
            }
            finished
        };
        if finished.is_none() {
            tracing::debug!(%callee, "stale CALL_REJECTED, discarding");
            return;
        }
        tracing::info!(%callee, "call rejected by remote");
        self.emit(SwitchboardEvent::CallRejected {
            peer: callee,
            reason: RejectReason::Declined,
        });
    }

    async fn on_call_ended(&self, peer: ParticipantId) {
        let dropped_call = {
            let mut controller = self.controller.lock().await;
            let finished = controller.remote_ended(&peer);
            if finished.is_some() {
                self.disarm_ring_timer().await;
            }
            finished
        };
        let had_session = self.teardown_session(&peer).await;
        if dropped_call.is_none() && !had_session {
            tracing::debug!(%peer, "repeated CALL_ENDED, nothing to do");
            return;
        }
        tracing::info!(%peer, "call ended by remote");
        self.emit(SwitchboardEvent::CallEnded { peer });
    }

    async fn on_offer(&self, sender: ParticipantId, data: Option<Value>) {
        let Some(data) = data else {
            tracing::warn!(%sender, "OFFER without a payload, dropping");
            return;
        };
        let handle = match self.ensure_session(&sender, Role::Answerer).await {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%sender, %error, "no session for inbound offer");
                return;
            }
        };

        let mut session = handle.session().lock().await;
        if session.role() == Role::Offeror {
            tracing::warn!(%sender, "offer from the answerer side, dropping");
            return;
        }
        if !session.can_apply_remote_offer() {
            tracing::debug!(%sender, "duplicate OFFER, discarding");
            return;
        }

        let negotiator = Arc::clone(handle.negotiator());
        if let Err(error) = negotiator
            .set_remote_description(SessionDescription(data))
            .await
        {
            self.fail_negotiation(&handle, &mut session, &error).await;
            return;
        }
        session.mark_remote_offer();
        self.apply_buffered_candidates(&handle, &mut session).await;

        let answer = match negotiator.create_answer().await {
            Ok(answer) => answer,
            Err(error) => {
                self.fail_negotiation(&handle, &mut session, &error).await;
                return;
            }
        };
        if let Err(error) = negotiator.set_local_description(answer.clone()).await {
            self.fail_negotiation(&handle, &mut session, &error).await;
            return;
        }
        session.mark_answer_sent();

        let reply = Envelope::new(SignalType::Answer, self.local_id.clone())
            .with_recipient(sender.clone())
            .with_data(answer.into_value());
        if let Err(error) = self.send(reply).await {
            self.fail_negotiation(&handle, &mut session, &error).await;
            return;
        }
        tracing::info!(%sender, "answered offer, negotiation stable");
        self.emit(SwitchboardEvent::NegotiationComplete { peer: sender });
    }

    async fn on_answer(&self, sender: ParticipantId, data: Option<Value>) {
        let Some(data) = data else {
            tracing::warn!(%sender, "ANSWER without a payload, dropping");
            return;
        };
        let handle = self.registry.read().await.session(&sender);
        let Some(handle) = handle else {
            tracing::warn!(%sender, "ANSWER without a session, dropping");
            return;
        };

        let mut session = handle.session().lock().await;
        if !session.can_apply_remote_answer() {
            tracing::debug!(%sender, "duplicate ANSWER, discarding");
            return;
        }
        if let Err(error) = handle
            .negotiator()
            .set_remote_description(SessionDescription(data))
            .await
        {
            self.fail_negotiation(&handle, &mut session, &error).await;
            return;
        }
        session.mark_remote_answer();
        self.apply_buffered_candidates(&handle, &mut session).await;
        tracing::info!(%sender, "answer applied, negotiation stable");
        self.emit(SwitchboardEvent::NegotiationComplete { peer: sender });
    }

    async fn on_ice(&self, sender: ParticipantId, data: Option<Value>) {
        let Some(data) = data else {
            tracing::warn!(%sender, "ICE without a payload, dropping");
            return;
        };
        let handle = self.registry.read().await.session(&sender);
        let Some(handle) = handle else {
            tracing::debug!(%sender, "ICE before any session, dropping");
            return;
        };

        let mut session = handle.session().lock().await;
        match session.accept_candidate(Candidate(data)) {
            CandidateDisposition::ApplyNow(candidate) => {
                if let Err(error) = handle.negotiator().add_remote_candidate(candidate).await {
                    tracing::warn!(%sender, %error, "candidate rejected by capability");
                }
            }
            CandidateDisposition::Buffered => {
                tracing::debug!(
                    %sender,
                    pending = session.pending_candidate_count(),
                    "candidate buffered until a remote description arrives"
                );
            }
            CandidateDisposition::Discarded => {
                tracing::debug!(%sender, "candidate for a closed session, discarding");
            }
        }
    }

    async fn on_key_exchange(&self, sender: ParticipantId, data: Option<Value>) {
        let Some(data) = data else {
            tracing::warn!(%sender, "KEY_EXCHANGE without a payload, dropping");
            return;
        };
        let key = match keys::decode_payload(&data) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(%sender, %error, "key import failed, staying unencrypted");
                return;
            }
        };
        let handle = match self.ensure_session(&sender, Role::Answerer).await {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%sender, %error, "no session for key exchange");
                return;
            }
        };

        let mut session = handle.session().lock().await;
        if session.encryption_key().is_some() {
            tracing::debug!(%sender, "duplicate KEY_EXCHANGE, discarding");
            return;
        }
        session.set_encryption_key(key);
        session.confirm_encryption();

        let ack = Envelope::new(SignalType::EncryptionEnabled, self.local_id.clone())
            .with_recipient(sender.clone());
        if let Err(error) = self.send(ack).await {
            tracing::warn!(%sender, %error, "encryption ack failed");
        }
        tracing::info!(%sender, "media key installed");
        self.emit(SwitchboardEvent::EncryptionEnabled { peer: sender });
    }

    async fn on_encryption_enabled(&self, sender: ParticipantId) {
        let handle = self.registry.read().await.session(&sender);
        let Some(handle) = handle else {
            tracing::debug!(%sender, "encryption ack without a session, dropping");
            return;
        };
        let confirmed = handle.session().lock().await.confirm_encryption();
        if !confirmed {
            tracing::debug!(%sender, "repeated or keyless encryption ack, discarding");
            return;
        }
        tracing::info!(%sender, "remote confirmed encryption");
        self.emit(SwitchboardEvent::EncryptionEnabled { peer: sender });
    }

    /// Auto-connect: the lexicographically smaller id offers first, so
    /// exactly one side of each pair starts the handshake
    async fn maybe_auto_connect(&self, peer: &ParticipantId) {
        if !self.config.auto_connect {
            return;
        }
        if Role::from_id_order(&self.local_id, peer) != Role::Offeror {
            tracing::debug!(%peer, "auto-connect defers to the peer's offer");
            return;
        }
        if let Err(error) = self.start_offer_flow(peer).await {
            tracing::warn!(%peer, %error, "auto-connect offer failed");
        }
    }

    /// Offeror-side handshake start: key bootstrap when enabled, then the
    /// offer itself
    async fn start_offer_flow(&self, peer: &ParticipantId) -> Result<(), SwitchboardError> {
        let handle = self.ensure_session(peer, Role::Offeror).await?;
        if self.config.encryption {
            self.key_bootstrap_on(&handle).await;
        }
        self.send_offer_on(&handle).await.map(|_| ())
    }

    /// Generate and deliver a media key, best effort
    ///
    /// Any failure logs and leaves the session unencrypted; call setup is
    /// never blocked on key exchange.
    async fn key_bootstrap_on(&self, handle: &Arc<SessionHandle>) {
        let peer = handle.peer_id().clone();
        let mut session = handle.session().lock().await;
        if session.encryption_key().is_some() {
            return;
        }
        let key = match keys::generate() {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(%peer, %error, "key generation failed, proceeding unencrypted");
                return;
            }
        };
        let payload = match keys::encode_payload(&key) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%peer, %error, "key export failed, proceeding unencrypted");
                return;
            }
        };
        let envelope = Envelope::new(SignalType::KeyExchange, self.local_id.clone())
            .with_recipient(peer.clone())
            .with_data(payload);
        if let Err(error) = self.send(envelope).await {
            tracing::warn!(%peer, %error, "key delivery failed, proceeding unencrypted");
            return;
        }
        session.set_encryption_key(key);
        tracing::info!(%peer, "media key offered");
    }

    /// Create and send the offer if the session may still offer
    ///
    /// Returns whether an offer went out; `Ok(false)` means the state guard
    /// declined (already offered, wrong role).
    async fn send_offer_on(&self, handle: &Arc<SessionHandle>) -> Result<bool, SwitchboardError> {
        let peer = handle.peer_id().clone();
        let mut session = handle.session().lock().await;
        if !session.can_send_offer() {
            tracing::debug!(
                %peer,
                role = ?session.role(),
                state = ?session.negotiation_state(),
                "session not in a position to offer, ignoring"
            );
            return Ok(false);
        }

        let negotiator = Arc::clone(handle.negotiator());
        let offer = match negotiator.create_offer().await {
            Ok(offer) => offer,
            Err(error) => {
                self.fail_negotiation(handle, &mut session, &error).await;
                return Err(error.into());
            }
        };
        if let Err(error) = negotiator.set_local_description(offer.clone()).await {
            self.fail_negotiation(handle, &mut session, &error).await;
            return Err(error.into());
        }
        session.mark_offer_sent();

        let envelope = Envelope::new(SignalType::Offer, self.local_id.clone())
            .with_recipient(peer.clone())
            .with_data(offer.into_value());
        if let Err(error) = self.send(envelope).await {
            self.fail_negotiation(handle, &mut session, &error).await;
            return Err(error);
        }
        tracing::info!(%peer, "offer sent");
        Ok(true)
    }

    /// Replay buffered remote candidates in receipt order
    ///
    /// Individual rejections are logged and skipped; one bad candidate must
    /// not starve the rest.
    async fn apply_buffered_candidates(
        &self,
        handle: &Arc<SessionHandle>,
        session: &mut PeerSession,
    ) {
        for candidate in session.drain_pending_candidates() {
            if let Err(error) = handle.negotiator().add_remote_candidate(candidate).await {
                tracing::warn!(peer = %handle.peer_id(), %error, "buffered candidate rejected");
            }
        }
    }

    /// Abort a handshake after a capability or delivery failure: close the
    /// session, release the capability, surface a Failed state change
    async fn fail_negotiation(
        &self,
        handle: &Arc<SessionHandle>,
        session: &mut PeerSession,
        error: &(dyn std::fmt::Display + Sync),
    ) {
        let peer = handle.peer_id().clone();
        tracing::error!(%peer, %error, "negotiation failed, closing session");
        session.close();
        if let Err(close_error) = handle.negotiator().close().await {
            tracing::warn!(%peer, error = %close_error, "capability close failed");
        }
        self.emit(SwitchboardEvent::ConnectionChanged {
            peer,
            state: ConnectionState::Failed,
        });
    }

    /// Find a usable session for `peer` or create one with `role`
    ///
    /// An existing session that is closed or terminally failed is replaced,
    /// and the displaced record is torn down so its capability is released;
    /// a live one is reused as-is (its role wins). Creation is
    /// double-checked so two racing signals end up sharing one record.
    async fn ensure_session(
        &self,
        peer: &ParticipantId,
        role: Role,
    ) -> Result<Arc<SessionHandle>, SwitchboardError> {
        let stale = {
            let existing = self.registry.read().await.session(peer);
            match existing {
                Some(handle) => {
                    if !handle.session().lock().await.is_replaceable() {
                        return Ok(handle);
                    }
                    Some(handle)
                }
                None => None,
            }
        };

        let negotiator = self.negotiators.create(peer).await?;
        let fresh = Arc::new(SessionHandle::new(
            peer.clone(),
            negotiator,
            PeerSession::new(peer.clone(), role),
        ));

        let (raced, displaced) = {
            let mut registry = self.registry.write().await;
            match registry.session(peer) {
                Some(existing)
                    if stale
                        .as_ref()
                        .map_or(true, |s| !Arc::ptr_eq(s, &existing)) =>
                {
                    (Some(existing), None)
                }
                current => {
                    registry.insert_session(Arc::clone(&fresh));
                    (None, current)
                }
            }
        };

        // A record displaced for a failed connection still holds a live
        // capability; finish its teardown now that the registry points at
        // the replacement
        if let Some(old) = displaced {
            old.session().lock().await.close();
            if let Err(error) = old.negotiator().close().await {
                tracing::warn!(%peer, %error, "capability close failed");
            }
            tracing::debug!(%peer, "displaced session torn down");
        }

        match raced {
            Some(existing) => {
                // Lost the race; release the capability we just made
                if let Err(error) = fresh.negotiator().close().await {
                    tracing::warn!(%peer, %error, "capability close failed");
                }
                Ok(existing)
            }
            None => {
                tracing::debug!(%peer, ?role, "session created");
                Ok(fresh)
            }
        }
    }

    /// Close and remove the session for `peer`; returns whether one existed
    async fn teardown_session(&self, peer: &ParticipantId) -> bool {
        let handle = self.registry.write().await.remove_session(peer);
        let Some(handle) = handle else {
            return false;
        };
        handle.session().lock().await.close();
        if let Err(error) = handle.negotiator().close().await {
            tracing::warn!(%peer, %error, "capability close failed");
        }
        tracing::debug!(%peer, "session torn down");
        true
    }

    async fn arm_ring_timer(&self, peer: ParticipantId, deadline: DateTime<Utc>) {
        let board = self.clone();
        let ring = self.config.ring_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(ring).await;
            board.ring_deadline_elapsed(peer, deadline).await;
        });
        *self.ring_timer.lock().await = Some(task.abort_handle());
    }

    async fn disarm_ring_timer(&self) {
        if let Some(timer) = self.ring_timer.lock().await.take() {
            timer.abort();
        }
    }

    async fn ring_deadline_elapsed(&self, peer: ParticipantId, deadline: DateTime<Utc>) {
        let timed_out = {
            let mut controller = self.controller.lock().await;
            let finished = controller.ring_expired(&peer, deadline);
            if finished.is_some() {
                *self.ring_timer.lock().await = None;
            }
            finished
        };
        if timed_out.is_none() {
            tracing::debug!(%peer, "ring timer fired after the attempt was decided");
            return;
        }

        tracing::info!(%peer, "no answer within the ring deadline");
        // Reuse CALL_ENDED as the cancel signal so the remote bell stops
        let cancel = Envelope::new(SignalType::CallEnded, self.local_id.clone())
            .with_recipient(peer.clone());
        if let Err(error) = self.send(cancel).await {
            tracing::warn!(%peer, %error, "ring cancel failed");
        }
        self.emit(SwitchboardEvent::CallRejected {
            peer,
            reason: RejectReason::Timeout,
        });
    }

    async fn send(&self, envelope: Envelope) -> Result<(), SwitchboardError> {
        self.gateway
            .send(envelope)
            .await
            .map_err(|error| SwitchboardError::Gateway(error.to_string()))
    }

    fn emit(&self, event: SwitchboardEvent) {
        let _ = self.event_sender.send(event);
    }
}

/// Switchboard builder
pub struct SwitchboardBuilder<G: SignalingGateway> {
    local_id: ParticipantId,
    gateway: Arc<G>,
    negotiators: Arc<dyn NegotiatorFactory>,
    config: SwitchboardConfig,
}

impl<G: SignalingGateway + 'static> SwitchboardBuilder<G> {
    /// Create a builder with the default configuration
    #[must_use]
    pub fn new(
        local_id: ParticipantId,
        gateway: Arc<G>,
        negotiators: Arc<dyn NegotiatorFactory>,
    ) -> Self {
        Self {
            local_id,
            gateway,
            negotiators,
            config: SwitchboardConfig::default(),
        }
    }

    /// Set the configuration
    #[must_use]
    pub fn with_config(mut self, config: SwitchboardConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the switchboard
    #[must_use]
    pub fn build(self) -> Switchboard<G> {
        Switchboard::new(self.local_id, self.gateway, self.negotiators, self.config)
    }
}
