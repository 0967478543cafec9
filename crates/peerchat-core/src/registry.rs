//! Append-only contact registry
//!
//! Contacts are kept in an `Arc<Vec<_>>` that is copied on append when a
//! snapshot is still held, so readers iterate a stable sequence while new
//! contacts keep arriving. Every appended contact is also pushed once onto
//! a bounded notification channel; when
//! [`CONTACT_NOTIFY_CAPACITY`](crate::config::CONTACT_NOTIFY_CAPACITY)
//! contacts are waiting for a receiver, [`ContactRegistry::add`] waits.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::CONTACT_NOTIFY_CAPACITY;
use crate::contact::{Contact, ContactId, ContactSummary};
use crate::error::{ChatError, ChatResult};
use crate::events::ChatEvent;

/// Stable view of the registry at one point in time
pub type ContactSnapshot = Arc<Vec<Arc<Contact>>>;

/// Consumer side of the new-contact notification channel
#[derive(Debug)]
pub struct ContactNotifications {
    rx: mpsc::Receiver<Arc<Contact>>,
}

impl ContactNotifications {
    /// Next newly registered contact; `None` once the registry is dropped
    pub async fn recv(&mut self) -> Option<Arc<Contact>> {
        self.rx.recv().await
    }
}

/// Ordered collection of every contact this node has had
pub struct ContactRegistry {
    contacts: RwLock<ContactSnapshot>,
    notify: mpsc::Sender<Arc<Contact>>,
    events: broadcast::Sender<ChatEvent>,
}

impl ContactRegistry {
    pub fn new(events: broadcast::Sender<ChatEvent>) -> (Self, ContactNotifications) {
        let (notify, rx) = mpsc::channel(CONTACT_NOTIFY_CAPACITY);
        let registry = Self {
            contacts: RwLock::new(Arc::new(Vec::new())),
            notify,
            events,
        };
        (registry, ContactNotifications { rx })
    }

    /// Append a contact and hand it to the receiver.
    ///
    /// Waits while the notification channel is full. Fails only when the
    /// receiver side is gone, in which case the contact stays registered
    /// but nobody reads from it.
    pub async fn add(&self, contact: Arc<Contact>) -> ChatResult<()> {
        let total = {
            let mut contacts = self.contacts.write();
            Arc::make_mut(&mut *contacts).push(contact.clone());
            contacts.len()
        };

        info!(
            contact = %contact.id(),
            peer = %contact.peer(),
            direction = %contact.direction(),
            total,
            "Contact registered"
        );
        let _ = self.events.send(ChatEvent::ContactRegistered {
            contact: contact.id(),
            peer: contact.peer(),
            direction: contact.direction(),
        });

        self.notify
            .send(contact)
            .await
            .map_err(|_| ChatError::Queue("contact notification channel closed".to_string()))
    }

    /// Current contacts in registration order
    pub fn snapshot(&self) -> ContactSnapshot {
        self.contacts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }

    pub fn get(&self, id: ContactId) -> Option<Arc<Contact>> {
        self.contacts.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn summaries(&self) -> Vec<ContactSummary> {
        self.snapshot().iter().map(|c| c.summary()).collect()
    }
}
