//! Peer address parsing and relay circuit helpers
//!
//! Addresses use the transport's self-describing multiaddr format and must
//! end with the target's identity:
//!
//! ```text
//! direct:  /ip4/1.2.3.4/tcp/16600/p2p/<peer>
//! relayed: /ip4/5.6.7.8/tcp/4001/p2p/<relay>/p2p-circuit/p2p/<peer>
//! ```

use std::fmt;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::{ChatError, ChatResult};

/// Substring marking an address as reachable only through a relay circuit
pub const CIRCUIT_MARKER: &str = "/p2p-circuit/";

/// A peer identity plus the addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Identity of the peer
    pub peer: PeerId,
    /// Dialable addresses without the trailing `/p2p/<peer>` component
    /// (for relayed targets: exactly the full circuit address)
    pub addrs: Vec<Multiaddr>,
    /// Whether the peer is reachable only through a relay circuit
    pub via_relay: bool,
}

impl PeerAddress {
    /// Parse an address string into a peer identity and address set.
    ///
    /// The last component must be `/p2p/<peer>`. When the string contains
    /// [`CIRCUIT_MARKER`] the address set is replaced with exactly the
    /// supplied address and `via_relay` is set.
    pub fn parse(address: &str) -> ChatResult<Self> {
        let address = address.trim();
        let full: Multiaddr = address
            .parse()
            .map_err(|e| ChatError::AddressParse(format!("{}: {}", address, e)))?;

        let mut transport_part = full.clone();
        let peer = match transport_part.pop() {
            Some(Protocol::P2p(peer)) => peer,
            _ => {
                return Err(ChatError::AddressParse(format!(
                    "{}: missing trailing /p2p/<peer id>",
                    address
                )))
            }
        };

        if address.contains(CIRCUIT_MARKER) {
            return Ok(Self {
                peer,
                addrs: vec![full],
                via_relay: true,
            });
        }

        let addrs = if transport_part.is_empty() {
            Vec::new()
        } else {
            vec![transport_part]
        };

        Ok(Self {
            peer,
            addrs,
            via_relay: false,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.peer)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", addr)?;
        }
        write!(f, "]}}")
    }
}

/// Address other peers use to reach `local` through a relay.
///
/// Produces: `{relay_addr}/p2p/{relay}/p2p-circuit/p2p/{local}`
pub fn relay_circuit_address(relay_addr: &Multiaddr, relay: &PeerId, local: &PeerId) -> Multiaddr {
    relay_addr
        .clone()
        .with(Protocol::P2p(*relay))
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(*local))
}

/// Address to listen on in order to hold a reservation at `relay`.
///
/// Produces: `{relay_addr}/p2p/{relay}/p2p-circuit`, or
/// `/p2p/{relay}/p2p-circuit` when no relay transport address is known.
pub fn relay_listen_address(relay_addr: Option<&Multiaddr>, relay: &PeerId) -> Multiaddr {
    relay_addr
        .cloned()
        .unwrap_or_else(Multiaddr::empty)
        .with(Protocol::P2p(*relay))
        .with(Protocol::P2pCircuit)
}

/// Full `/p2p/` address of `peer` at `addr`
pub fn p2p_address(addr: &Multiaddr, peer: &PeerId) -> Multiaddr {
    match addr.iter().last() {
        Some(Protocol::P2p(existing)) if existing == *peer => addr.clone(),
        _ => addr.clone().with(Protocol::P2p(*peer)),
    }
}

/// Short display form of a peer id: first 2 and last 6 characters
pub fn short_peer_id(peer: &PeerId) -> String {
    let full = peer.to_base58();
    if full.len() <= 8 {
        return full;
    }
    format!("{}*{}", &full[..2], &full[full.len() - 6..])
}

/// Escape an address for display in a URL query component.
///
/// Unreserved characters pass through, spaces become `+`, everything else
/// is percent-encoded.
pub fn query_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
