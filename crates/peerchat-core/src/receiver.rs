//! Inbound read loops
//!
//! The receiver consumes new-contact notifications and starts exactly one
//! read loop per contact. A loop reads newline-delimited lines until the
//! stream ends, fails, or the contact is closed. It is tied to the contact's
//! lifetime only, so node shutdown does not interrupt running conversations.
//! A contact whose loop ended stays registered.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::short_peer_id;
use crate::contact::{Contact, ContactReader};
use crate::events::{ChatEvent, StopReason};
use crate::registry::ContactNotifications;

pub struct Receiver {
    events: broadcast::Sender<ChatEvent>,
}

impl Receiver {
    pub fn new(events: broadcast::Sender<ChatEvent>) -> Self {
        Self { events }
    }

    /// Start read loops for contacts as they are registered.
    ///
    /// Returns when the registry side of the channel is dropped.
    pub async fn run(self, mut notifications: ContactNotifications) {
        debug!("Receiver waiting for contacts");
        while let Some(contact) = notifications.recv().await {
            self.start(contact);
        }
        debug!("Contact notifications closed");
    }

    /// Start the read loop of one contact.
    ///
    /// Returns `None` if a loop was already started for it.
    pub fn start(&self, contact: Arc<Contact>) -> Option<JoinHandle<()>> {
        let Some(reader) = contact.take_reader() else {
            warn!(contact = %contact.id(), "Read loop already running, ignoring");
            return None;
        };

        debug!(contact = %contact.id(), peer = %contact.peer(), "Starting read loop");
        let _ = self.events.send(ChatEvent::ReceiverStarted {
            contact: contact.id(),
        });

        Some(tokio::spawn(read_loop(contact, reader, self.events.clone())))
    }
}

/// Strip the line terminator and surrounding spaces
fn clean_line(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r']).trim_matches(' ')
}

async fn read_loop(
    contact: Arc<Contact>,
    mut reader: ContactReader,
    events: broadcast::Sender<ChatEvent>,
) {
    let id = contact.id();
    let peer = contact.peer();
    let name = short_peer_id(&peer);
    let mut line = String::new();

    let reason = loop {
        if contact.is_closed() {
            break StopReason::Closed;
        }

        line.clear();
        let read = tokio::select! {
            _ = contact.lifetime().cancelled() => break StopReason::Closed,
            read = reader.read_line(&mut line) => read,
        };

        match read {
            Ok(0) => break StopReason::Eof,
            Ok(_) => {
                let text = clean_line(&line).to_string();
                info!(contact = %id, from = %name, "{}", text);
                let _ = events.send(ChatEvent::MessageReceived {
                    contact: id,
                    peer,
                    text,
                });
            }
            Err(e) => break StopReason::Error(e.to_string()),
        }
    };

    match &reason {
        StopReason::Closed => debug!(contact = %id, %peer, "Read loop stopped, contact closed"),
        other => warn!(contact = %id, %peer, reason = %other, "Read loop stopped"),
    }

    contact.close();
    let _ = events.send(ChatEvent::ReceiverStopped {
        contact: id,
        reason,
    });
}
