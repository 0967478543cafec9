//! Peerchat Core Library
//!
//! Session and message-dispatch layer of a peer-to-peer text chat.
//!
//! ## Overview
//!
//! A node accepts chat streams from remote peers, dials peers (directly or
//! through a relay circuit) on request, and fans every outbound chat line out
//! to all peers it is talking to. Incoming lines are logged and published as
//! [`ChatEvent`]s.
//!
//! ## Core Principles
//!
//! - **One queue**: every outbound command goes through a single ordered queue
//! - **Isolated peers**: a slow or failing peer never blocks the others
//! - **Long-lived conversations**: contacts outlive the node shutdown signal
//!   until their streams end
//!
//! ## Quick Start
//!
//! ```ignore
//! use peerchat_core::{Libp2pTransport, NodeConfig, NodeSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let transport = Libp2pTransport::spawn(&config).await?;
//!     let session = NodeSession::start(config, transport).await?;
//!
//!     let queue = session.queue();
//!     queue.submit("/connect /ip4/10.0.0.2/tcp/16600/p2p/12D3KooW...").await?;
//!     queue.submit("hello").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod command;
pub mod config;
pub mod connection;
pub mod contact;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod inbound;
pub mod peerstore;
pub mod receiver;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;

// Re-exports
pub use address::{query_escape, short_peer_id, PeerAddress};
pub use command::OutboundCommand;
pub use config::NodeConfig;
pub use connection::{ConnectPhase, ConnectionManager};
pub use contact::{Contact, ContactId, ContactSummary, SendOutcome};
pub use dispatcher::{BroadcastReport, DispatchOutcome, Dispatcher};
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, StopReason};
pub use inbound::InboundHandler;
pub use peerstore::PeerStore;
pub use receiver::Receiver;
pub use registry::{ContactNotifications, ContactRegistry, ContactSnapshot};
pub use relay::RelayManager;
pub use session::{NodeSession, OutboundQueue};
#[cfg(any(test, feature = "test-utils"))]
pub use transport::memory::{MemoryNetwork, MemoryTransport, TransportCall};
pub use transport::swarm::Libp2pTransport;
pub use transport::{ChatStream, Direction, Reservation, StreamHandler, Transport};
