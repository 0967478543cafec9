//! Chat events for programmatic consumers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ChatEvent: Notifications about session activity                │
//! │  ├── ContactRegistered: Contact appended to the registry        │
//! │  ├── ReceiverStarted: Read loop began for a contact             │
//! │  ├── MessageReceived: A line arrived from a contact             │
//! │  ├── ReceiverStopped: Read loop ended (EOF, error, close)        │
//! │  ├── RelayAddress: Relay-reachable address became known         │
//! │  └── CommandFailed: A queued command could not be carried out   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are sent on a `tokio::sync::broadcast` channel; sending never
//! blocks and is skipped silently when nobody subscribes.

use std::fmt;

use libp2p::PeerId;

use crate::contact::ContactId;
use crate::transport::Direction;

/// Why a contact's read loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The contact was closed before or during a read
    Closed,
    /// The remote end finished the stream
    Eof,
    /// Reading failed
    Error(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Closed => write!(f, "closed"),
            StopReason::Eof => write!(f, "end of stream"),
            StopReason::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Events emitted by a running node session
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A contact was appended to the registry
    ContactRegistered {
        contact: ContactId,
        peer: PeerId,
        direction: Direction,
    },
    /// A read loop started for a contact
    ReceiverStarted { contact: ContactId },
    /// A chat line arrived, trimmed
    MessageReceived {
        contact: ContactId,
        peer: PeerId,
        text: String,
    },
    /// A read loop ended; the contact stays registered
    ReceiverStopped {
        contact: ContactId,
        reason: StopReason,
    },
    /// Address other peers can use to reach this node through a relay
    RelayAddress { address: String },
    /// A queued command failed
    CommandFailed { command: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::Closed.to_string(), "closed");
        assert_eq!(StopReason::Eof.to_string(), "end of stream");
        assert_eq!(
            StopReason::Error("reset".to_string()).to_string(),
            "error: reset"
        );
    }
}
