//! Outbound session establishment
//!
//! ```text
//! Idle ──► Dialing ──► Connected ──► StreamOpening ──► Registered
//!             │                           │
//!             └──────────► Failed ◄───────┘
//! ```
//!
//! Nothing retries automatically; issuing `/connect` again starts over from
//! `Idle`, and the backoff left by the earlier failure is cleared first.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::config::{CHAT_PROTOCOL, DIAL_TIMEOUT, PERMANENT_ADDR_TTL};
use crate::contact::{Contact, ContactId};
use crate::error::ChatResult;
use crate::registry::ContactRegistry;
use crate::transport::Transport;

/// Progress of one outbound connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Idle,
    Dialing,
    Connected,
    StreamOpening,
    Registered,
    Failed,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectPhase::Idle => "idle",
            ConnectPhase::Dialing => "dialing",
            ConnectPhase::Connected => "connected",
            ConnectPhase::StreamOpening => "stream-opening",
            ConnectPhase::Registered => "registered",
            ConnectPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Dials peers and registers the resulting chat streams as contacts
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<ContactRegistry>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<ContactRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    /// Connect to the peer at `address` and register a contact for it.
    ///
    /// Relay circuit addresses open their stream without a deadline; direct
    /// ones use the dial timeout for stream negotiation as well.
    pub async fn connect(&self, address: &str) -> ChatResult<ContactId> {
        let target = PeerAddress::parse(address)?;
        let peer = target.peer;
        trace_phase(&target, ConnectPhase::Idle);

        self.transport.clear_backoff(&peer);
        self.transport
            .add_addresses(&peer, &target.addrs, PERMANENT_ADDR_TTL);

        trace_phase(&target, ConnectPhase::Dialing);
        if let Err(e) = self.transport.connect(&target, DIAL_TIMEOUT).await {
            trace_phase(&target, ConnectPhase::Failed);
            warn!(%peer, error = %e, "Dial failed");
            return Err(e);
        }
        trace_phase(&target, ConnectPhase::Connected);

        let deadline = if target.via_relay {
            None
        } else {
            Some(DIAL_TIMEOUT)
        };

        trace_phase(&target, ConnectPhase::StreamOpening);
        let stream = match self
            .transport
            .new_stream(peer, CHAT_PROTOCOL, deadline)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                trace_phase(&target, ConnectPhase::Failed);
                warn!(%peer, error = %e, "Opening chat stream failed");
                return Err(e);
            }
        };

        let contact = Contact::new(stream);
        let id = contact.id();
        self.registry.add(contact).await?;

        trace_phase(&target, ConnectPhase::Registered);
        info!(%peer, contact = %id, via_relay = target.via_relay, "Connected to peer");
        Ok(id)
    }
}

fn trace_phase(target: &PeerAddress, phase: ConnectPhase) {
    debug!(peer = %target.peer, %phase, "Connect phase");
}
