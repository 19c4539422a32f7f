//! In-process signaling relay for the demos
//!
//! Routes envelopes between switchboards the way the real relay does on the
//! wire: an addressed envelope goes to its recipient's inbox when one is
//! registered and falls back to a tagged broadcast otherwise; a broadcast
//! goes to every inbox, the sender's included (boards drop their own echo).

use async_trait::async_trait;
use partyline_core::signaling::encode;
use partyline_core::{Envelope, ParticipantId, SignalingGateway};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Shared in-memory relay for any number of participants
#[derive(Default)]
pub struct LoopbackRouter {
    inboxes: Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<String>>>,
}

impl LoopbackRouter {
    /// Register a participant and return its inbound envelope stream
    pub async fn attach(&self, id: ParticipantId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(id, tx);
        rx
    }

    /// A sending handle bound to this relay
    pub fn gateway(self: &Arc<Self>) -> RouterGateway {
        RouterGateway {
            router: Arc::clone(self),
        }
    }

    async fn route(&self, envelope: &Envelope) -> io::Result<()> {
        let raw = encode(envelope)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        let inboxes = self.inboxes.lock().await;

        if let Some(recipient) = &envelope.recipient {
            if let Some(inbox) = inboxes.get(recipient) {
                return inbox.send(raw).map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, format!("{recipient} went away"))
                });
            }
            tracing::debug!(%recipient, "no private inbox, falling back to broadcast");
        }
        for inbox in inboxes.values() {
            // A departed participant's closed inbox must not stall the rest
            let _ = inbox.send(raw.clone());
        }
        Ok(())
    }
}

/// One participant's sending side of the relay
pub struct RouterGateway {
    router: Arc<LoopbackRouter>,
}

#[async_trait]
impl SignalingGateway for RouterGateway {
    type Error = io::Error;

    async fn send(&self, envelope: Envelope) -> Result<(), Self::Error> {
        self.router.route(&envelope).await
    }
}
