//! Transport abstraction consumed by the session layer
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Transport                                                   │
//! │  ├── clear_backoff / add_addresses   (peer store)            │
//! │  ├── connect(target, timeout)        (dial)                  │
//! │  ├── new_stream(peer, proto, limit)  (outbound chat stream)  │
//! │  ├── reserve(relay, timeout)         (circuit relay slot)    │
//! │  └── set_stream_handler(proto, h)    (inbound chat streams)  │
//! │                                                              │
//! │  Implementations                                             │
//! │  ├── swarm::Libp2pTransport   (TCP + Noise + Yamux + relay)  │
//! │  └── memory::MemoryTransport  (in-process, for tests)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backoff clearing is part of the trait so callers never need to know which
//! concrete transport they hold.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod swarm;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::address::PeerAddress;
use crate::error::ChatResult;

/// Byte stream usable as a chat stream
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Opened by a remote peer and accepted by us
    Inbound,
    /// Opened by us
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A negotiated chat protocol stream to one peer
pub struct ChatStream {
    /// Remote peer
    pub peer: PeerId,
    /// Which side opened the stream
    pub direction: Direction,
    /// Bidirectional byte stream
    pub io: Box<dyn StreamIo>,
    /// Cancelled by the transport when the underlying connection goes away
    pub closed: CancellationToken,
}

impl ChatStream {
    /// Wrap a byte stream
    pub fn new(
        peer: PeerId,
        direction: Direction,
        io: impl StreamIo,
        closed: CancellationToken,
    ) -> Self {
        Self {
            peer,
            direction,
            io: Box::new(io),
            closed,
        }
    }

    /// Whether the transport already reported the connection closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatStream")
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("io", &"<StreamIo>")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An accepted relay reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The relay holding the slot
    pub relay: PeerId,
}

/// Callback invoked by a transport for every accepted inbound stream
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Take ownership of a freshly accepted stream
    async fn handle(&self, stream: ChatStream) -> ChatResult<()>;
}

/// Peer-to-peer transport operations the session layer depends on
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of this node
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this node currently listens on (without `/p2p/` suffix)
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Forget earlier dial failures recorded against a peer
    fn clear_backoff(&self, peer: &PeerId);

    /// Register addresses for a peer with the given TTL
    fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration);

    /// Connect to a peer, failing with `ChatError::Dial` after `timeout`
    async fn connect(&self, target: &PeerAddress, timeout: Duration) -> ChatResult<()>;

    /// Open a protocol stream to a connected peer.
    ///
    /// `deadline` bounds negotiation; `None` waits as long as the transport
    /// allows (used for relay-mediated conversations).
    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        deadline: Option<Duration>,
    ) -> ChatResult<ChatStream>;

    /// Reserve a relay slot so other peers can reach us through `relay`
    async fn reserve(&self, relay: &PeerAddress, timeout: Duration) -> ChatResult<Reservation>;

    /// Route inbound streams for `protocol` to `handler`
    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>)
        -> ChatResult<()>;
}
