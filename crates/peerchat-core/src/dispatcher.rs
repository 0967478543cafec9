//! Single consumer of the outbound command queue
//!
//! ```text
//! ┌───────────────┐     ┌──────────────────────────────────────────┐
//! │ outbound queue│ ──► │ Dispatcher                               │
//! │ (mpsc, 1000)  │     │  ├── /connect → ConnectionManager        │
//! └───────────────┘     │  ├── /relay   → RelayManager             │
//!                       │  └── payload  → every contact's outbox   │
//!                       └──────────────────────────────────────────┘
//! ```
//!
//! Commands run strictly in queue order. A payload is handed to each
//! contact's outbox without waiting for the write, so delivery to different
//! contacts is concurrent and unordered.

use std::sync::Arc;

use libp2p::Multiaddr;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::OutboundCommand;
use crate::connection::ConnectionManager;
use crate::contact::{ContactId, SendOutcome};
use crate::error::ChatResult;
use crate::events::ChatEvent;
use crate::registry::ContactRegistry;
use crate::relay::RelayManager;
use crate::transport::Transport;

/// Per-contact results of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Contacts the line was queued for
    pub queued: usize,
    /// Closed contacts
    pub skipped: usize,
}

/// Result of dispatching one queue item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Empty item, discarded
    Ignored,
    Connected(ContactId),
    Relayed(Vec<Multiaddr>),
    Broadcast(BroadcastReport),
}

pub struct Dispatcher {
    connections: ConnectionManager,
    relays: RelayManager,
    registry: Arc<ContactRegistry>,
    events: broadcast::Sender<ChatEvent>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ContactRegistry>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            connections: ConnectionManager::new(transport.clone(), registry.clone()),
            relays: RelayManager::new(transport, events.clone()),
            registry,
            events,
        }
    }

    /// Process queued commands until the queue closes or `shutdown` fires
    pub async fn run(self, mut queue: mpsc::Receiver<String>, shutdown: CancellationToken) {
        info!("Dispatcher started");

        loop {
            let raw = tokio::select! {
                _ = shutdown.cancelled() => break,
                raw = queue.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            // Failures are logged and published by dispatch itself
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(command = %raw.trim(), "Shutdown interrupted command");
                    break;
                }
                _ = self.dispatch(&raw) => {}
            }
        }

        info!("Dispatcher stopped");
    }

    /// Handle one raw queue item. Errors are logged and published as
    /// [`ChatEvent::CommandFailed`] before being returned.
    pub async fn dispatch(&self, raw: &str) -> ChatResult<DispatchOutcome> {
        let result = self.execute(raw).await;

        if let Err(e) = &result {
            let command = raw.trim().to_string();
            error!(%command, error = %e, "Command failed");
            let _ = self.events.send(ChatEvent::CommandFailed {
                command,
                error: e.to_string(),
            });
        }

        result
    }

    async fn execute(&self, raw: &str) -> ChatResult<DispatchOutcome> {
        let Some(command) = OutboundCommand::parse(raw)? else {
            debug!("Discarding empty queue item");
            return Ok(DispatchOutcome::Ignored);
        };
        debug!(%command, "Dispatching");

        match command {
            OutboundCommand::Connect(address) => self
                .connections
                .connect(&address)
                .await
                .map(DispatchOutcome::Connected),
            OutboundCommand::Relay(address) => self
                .relays
                .connect_via_relay(&address)
                .await
                .map(DispatchOutcome::Relayed),
            OutboundCommand::Payload(text) => Ok(DispatchOutcome::Broadcast(self.broadcast(&text))),
        }
    }

    /// Queue `text` for every contact in the current registry snapshot
    pub fn broadcast(&self, text: &str) -> BroadcastReport {
        let contacts = self.registry.snapshot();
        let mut report = BroadcastReport::default();

        for contact in contacts.iter() {
            match contact.send(text) {
                SendOutcome::Queued => report.queued += 1,
                SendOutcome::Skipped => report.skipped += 1,
            }
        }

        debug!(
            contacts = contacts.len(),
            queued = report.queued,
            skipped = report.skipped,
            "Broadcast"
        );
        report
    }
}
