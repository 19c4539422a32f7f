//! Presence roster and per-peer session records
//!
//! The registry is plain data behind the switchboard's lock; it never does
//! I/O. Presence is additive: names appear on JOIN or roster merge and
//! disappear only on LEAVE, so interleaved USER_LIST snapshots from slow
//! paths cannot erase a peer that already announced itself.

use crate::negotiation::Negotiator;
use crate::session::PeerSession;
use crate::types::{ParticipantId, PresenceEntry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One peer's live record: identity, capability handle, and the handshake
/// machine guarding it
///
/// The session mutex is held across capability calls so that all signals
/// from one peer apply strictly one at a time.
pub struct SessionHandle {
    peer_id: ParticipantId,
    negotiator: Arc<dyn Negotiator>,
    session: Mutex<PeerSession>,
}

impl SessionHandle {
    /// Bind a session machine to its peer and capability
    #[must_use]
    pub fn new(peer_id: ParticipantId, negotiator: Arc<dyn Negotiator>, session: PeerSession) -> Self {
        Self {
            peer_id,
            negotiator,
            session: Mutex::new(session),
        }
    }

    /// Peer this record belongs to
    #[must_use]
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    /// Capability driving the media path for this peer
    #[must_use]
    pub fn negotiator(&self) -> &Arc<dyn Negotiator> {
        &self.negotiator
    }

    /// Handshake state machine; lock before reading or advancing
    #[must_use]
    pub fn session(&self) -> &Mutex<PeerSession> {
        &self.session
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Roster of known participants plus their session records
#[derive(Debug, Default)]
pub struct SessionRegistry {
    presence: HashMap<ParticipantId, PresenceEntry>,
    sessions: HashMap<ParticipantId, Arc<SessionHandle>>,
    presence_synced: bool,
}

impl SessionRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a JOIN announcement; returns `true` only the first time
    pub fn record_join(&mut self, peer: ParticipantId) -> bool {
        use std::collections::hash_map::Entry;
        match self.presence.entry(peer) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let entry = PresenceEntry::now(slot.key().clone());
                slot.insert(entry);
                true
            }
        }
    }

    /// Record a LEAVE announcement; returns `true` if the peer was known
    pub fn record_leave(&mut self, peer: &ParticipantId) -> bool {
        self.presence.remove(peer).is_some()
    }

    /// Fold a USER_LIST snapshot into the roster
    ///
    /// Additive only: names absent from the snapshot stay. The local id is
    /// skipped so a roster echo can never make a node its own peer. Returns
    /// the newly learned peers and marks the roster synced.
    pub fn merge_roster<I>(&mut self, peers: I, local: &ParticipantId) -> Vec<ParticipantId>
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        let mut added = Vec::new();
        for peer in peers {
            if peer == *local {
                continue;
            }
            if self.record_join(peer.clone()) {
                added.push(peer);
            }
        }
        self.presence_synced = true;
        added
    }

    /// Whether a roster snapshot has arrived since startup
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.presence_synced
    }

    /// Whether `peer` is on the roster
    #[must_use]
    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.presence.contains_key(peer)
    }

    /// Known peers, sorted for stable presentation
    #[must_use]
    pub fn roster(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<ParticipantId> = self.presence.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Look up the session record for `peer`
    #[must_use]
    pub fn session(&self, peer: &ParticipantId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(peer).cloned()
    }

    /// Install a session record, displacing any previous one for the peer
    pub fn insert_session(&mut self, handle: Arc<SessionHandle>) {
        self.sessions.insert(handle.peer_id().clone(), handle);
    }

    /// Drop the session record for `peer`, returning it for teardown
    pub fn remove_session(&mut self, peer: &ParticipantId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(peer)
    }

    /// Drain every session record, for local shutdown
    pub fn drain_sessions(&mut self) -> Vec<Arc<SessionHandle>> {
        self.sessions.drain().map(|(_, handle)| handle).collect()
    }
}
