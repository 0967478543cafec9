//! Classification of outbound queue items
//!
//! ```text
//! "/connect <addr>"  → Connect
//! "/relay <addr>"    → Relay
//! "/<anything else>" → CommandParse error
//! "<text>"           → Payload
//! ""                 → dropped
//! ```

use std::fmt;

use crate::error::{ChatError, ChatResult};

/// A parsed outbound queue item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Establish an outbound session to the address
    Connect(String),
    /// Reserve a slot on the relay at the address
    Relay(String),
    /// Broadcast a chat line to every contact
    Payload(String),
}

impl OutboundCommand {
    /// Classify a raw queue item.
    ///
    /// Surrounding whitespace is trimmed first; an empty item yields
    /// `Ok(None)`. Extra tokens after a control command's address are
    /// ignored.
    pub fn parse(raw: &str) -> ChatResult<Option<Self>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        if !trimmed.starts_with('/') {
            return Ok(Some(OutboundCommand::Payload(trimmed.to_string())));
        }

        let mut tokens = trimmed.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        let Some(address) = tokens.next() else {
            return Err(ChatError::CommandParse(format!(
                "{}: expected /<command> <address>",
                trimmed
            )));
        };

        match keyword {
            "/connect" => Ok(Some(OutboundCommand::Connect(address.to_string()))),
            "/relay" => Ok(Some(OutboundCommand::Relay(address.to_string()))),
            other => Err(ChatError::CommandParse(format!("unknown command {}", other))),
        }
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundCommand::Connect(addr) => write!(f, "/connect {}", addr),
            OutboundCommand::Relay(addr) => write!(f, "/relay {}", addr),
            OutboundCommand::Payload(text) => write!(f, "{}", text),
        }
    }
}
