//! Node configuration and protocol constants

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::error::{ChatError, ChatResult};

/// Protocol identifier negotiated for chat streams
pub const CHAT_PROTOCOL: &str = "/Chat/1.0.0";

/// Upper bound for dialing a peer and for opening a direct chat stream
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for a relay reservation request
pub const RESERVE_TIMEOUT: Duration = Duration::from_secs(15);

/// TTL used when registering addresses for a peer we were told to dial.
///
/// Large enough that the peer store treats it as permanent.
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// Capacity of the outbound command queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1000;

/// Capacity of the new-contact notification channel.
///
/// When this many contacts are waiting for a receiver, further
/// registrations block the registering task.
pub const CONTACT_NOTIFY_CAPACITY: usize = 10;

/// Capacity of the [`ChatEvent`](crate::events::ChatEvent) broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Interval of the "peers online" status log line
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Startup configuration of a node. Immutable once the node is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IPv4 address the p2p transport listens on
    pub bind_ip: String,
    /// TCP port the p2p transport listens on (0 = OS-assigned)
    pub port: u16,
    /// Port of the HTTP command injector
    pub http_port: u16,
    /// Relay to reserve a slot on at startup
    pub relay_address: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port: 16600,
            http_port: 8080,
            relay_address: None,
        }
    }
}

impl NodeConfig {
    /// Check the bind address and the optional relay address.
    pub fn validate(&self) -> ChatResult<()> {
        self.bind_ip
            .parse::<Ipv4Addr>()
            .map_err(|e| ChatError::Config(format!("invalid bind ip {}: {}", self.bind_ip, e)))?;

        if let Some(relay) = &self.relay_address {
            PeerAddress::parse(relay)
                .map_err(|e| ChatError::Config(format!("invalid relay address: {}", e)))?;
        }

        Ok(())
    }

    /// Multiaddr string the transport listens on
    pub fn listen_multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}", self.bind_ip, self.port)
    }
}
