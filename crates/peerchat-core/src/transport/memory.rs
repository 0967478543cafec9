//! In-process transport for tests and simulations
//!
//! A [`MemoryNetwork`] is a hub of nodes addressed by `PeerId`. Streams are
//! `tokio::io::duplex` pairs; the remote side's registered handler receives
//! its half on a spawned task, as with a real transport.
//!
//! Every trait call made on a [`MemoryTransport`] is recorded so tests can
//! assert on the exact sequence the session layer produced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChatStream, Direction, Reservation, StreamHandler, Transport};
use crate::address::PeerAddress;
use crate::error::{ChatError, ChatResult};
use crate::peerstore::PeerStore;

/// Buffer size of each in-memory stream direction
const DUPLEX_BUFFER: usize = 64 * 1024;

/// A transport call as observed by the memory transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    ClearBackoff {
        peer: PeerId,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        ttl: Duration,
    },
    Connect {
        peer: PeerId,
    },
    NewStream {
        peer: PeerId,
        protocol: String,
        deadline: Option<Duration>,
    },
    Reserve {
        relay: PeerId,
    },
}

struct NodeEntry {
    addr: Multiaddr,
    handlers: HashMap<String, Arc<dyn StreamHandler>>,
    reachable: bool,
    accepts_reservations: bool,
    fail_streams: bool,
    stall_streams: bool,
    connected: HashSet<PeerId>,
    /// Peers holding a reservation on this node
    reservations: HashSet<PeerId>,
    links: Vec<(PeerId, CancellationToken)>,
}

impl NodeEntry {
    fn new(addr: Multiaddr) -> Self {
        Self {
            addr,
            handlers: HashMap::new(),
            reachable: true,
            accepts_reservations: true,
            fail_streams: false,
            stall_streams: false,
            connected: HashSet::new(),
            reservations: HashSet::new(),
            links: Vec::new(),
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<PeerId, NodeEntry>,
    next_port: u64,
}

/// Shared hub connecting [`MemoryTransport`] nodes
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with a random identity
    pub fn add_node(&self) -> Arc<MemoryTransport> {
        let local = PeerId::random();
        let addr = {
            let mut inner = self.inner.lock();
            inner.next_port += 1;
            let addr = Multiaddr::empty().with(Protocol::Memory(inner.next_port));
            inner.nodes.insert(local, NodeEntry::new(addr.clone()));
            addr
        };
        debug!(%local, %addr, "Memory node added");

        Arc::new(MemoryTransport {
            local,
            network: self.clone(),
            peerstore: PeerStore::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Make a node refuse (or accept again) incoming dials
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(peer) {
            node.reachable = reachable;
        }
    }

    /// Make a node refuse (or accept again) relay reservations
    pub fn set_accepts_reservations(&self, peer: &PeerId, accepts: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(peer) {
            node.accepts_reservations = accepts;
        }
    }

    /// Make every stream a node tries to open fail
    pub fn set_fail_streams(&self, peer: &PeerId, fail: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(peer) {
            node.fail_streams = fail;
        }
    }

    /// Make every stream a node tries to open hang until its deadline, or
    /// forever without one
    pub fn set_stall_streams(&self, peer: &PeerId, stall: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(peer) {
            node.stall_streams = stall;
        }
    }

    /// Whether `client` holds a reservation on `relay`
    pub fn has_reservation(&self, relay: &PeerId, client: &PeerId) -> bool {
        self.inner
            .lock()
            .nodes
            .get(relay)
            .map(|node| node.reservations.contains(client))
            .unwrap_or(false)
    }

    /// Drop the connection between two nodes, closing every stream on it
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut closing = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (this, other) in [(a, b), (b, a)] {
                if let Some(node) = inner.nodes.get_mut(this) {
                    node.connected.remove(other);
                    node.links.retain(|(peer, token)| {
                        if peer == other {
                            closing.push(token.clone());
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
        for token in closing {
            token.cancel();
        }
    }

    fn address_of(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.inner.lock().nodes.get(peer).map(|n| n.addr.clone())
    }
}

/// Relay named in a circuit address, i.e. the `/p2p/` before `/p2p-circuit`
fn circuit_relay(addr: &Multiaddr) -> Option<PeerId> {
    let mut relay = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::P2p(peer) => relay = Some(peer),
            Protocol::P2pCircuit => return relay,
            _ => {}
        }
    }
    None
}

/// One node of a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
    peerstore: PeerStore,
    calls: Mutex<Vec<TransportCall>>,
}

impl MemoryTransport {
    /// Every call recorded so far, oldest first
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Backoff state as seen by this node
    pub fn is_backed_off(&self, peer: &PeerId) -> bool {
        self.peerstore.is_backed_off(peer)
    }

    /// Record a dial failure against `peer` as if a dial had failed
    pub fn record_dial_failure(&self, peer: &PeerId) {
        self.peerstore.record_dial_failure(peer);
    }

    /// Full address of this node
    pub fn p2p_address(&self) -> String {
        let addr = self.network.address_of(&self.local).unwrap_or_else(Multiaddr::empty);
        format!("{}/p2p/{}", addr, self.local)
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn dial_failed(&self, peer: &PeerId, reason: &str) -> ChatError {
        self.peerstore.record_dial_failure(peer);
        ChatError::Dial(format!("{}: {}", peer, reason))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.network.address_of(&self.local).into_iter().collect()
    }

    fn clear_backoff(&self, peer: &PeerId) {
        self.record(TransportCall::ClearBackoff { peer: *peer });
        self.peerstore.clear_backoff(peer);
    }

    fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        self.record(TransportCall::AddAddresses {
            peer: *peer,
            addrs: addrs.to_vec(),
            ttl,
        });
        self.peerstore.add_addresses(peer, addrs, ttl);
    }

    async fn connect(&self, target: &PeerAddress, _timeout: Duration) -> ChatResult<()> {
        let peer = target.peer;
        self.record(TransportCall::Connect { peer });

        if self.peerstore.is_backed_off(&peer) {
            return Err(ChatError::Dial(format!("peer {} is in dial backoff", peer)));
        }

        let mut inner = self.network.inner.lock();
        let reachable = match inner.nodes.get(&peer) {
            Some(_) if target.via_relay => target
                .addrs
                .first()
                .and_then(circuit_relay)
                .and_then(|relay| inner.nodes.get(&relay))
                .map(|relay| relay.reachable && relay.reservations.contains(&peer))
                .unwrap_or(false),
            Some(node) => node.reachable,
            None => false,
        };

        if !reachable {
            drop(inner);
            return Err(self.dial_failed(&peer, "unreachable"));
        }

        for (this, other) in [(self.local, peer), (peer, self.local)] {
            if let Some(node) = inner.nodes.get_mut(&this) {
                node.connected.insert(other);
            }
        }
        drop(inner);

        self.peerstore.record_dial_success(&peer);
        Ok(())
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        deadline: Option<Duration>,
    ) -> ChatResult<ChatStream> {
        self.record(TransportCall::NewStream {
            peer,
            protocol: protocol.to_string(),
            deadline,
        });

        let stall = self
            .network
            .inner
            .lock()
            .nodes
            .get(&self.local)
            .map(|node| node.stall_streams)
            .unwrap_or(false);
        if stall {
            debug!(local = %self.local, %peer, ?deadline, "Stalling stream open");
            return match deadline {
                Some(deadline) => {
                    tokio::time::sleep(deadline).await;
                    Err(ChatError::StreamOpen(format!("{}: timed out", peer)))
                }
                None => std::future::pending().await,
            };
        }

        let (handler, token) = {
            let mut inner = self.network.inner.lock();
            let local = inner
                .nodes
                .get(&self.local)
                .ok_or_else(|| ChatError::Transport("node left the network".to_string()))?;
            if local.fail_streams {
                return Err(ChatError::StreamOpen(format!("{}: stream reset", peer)));
            }
            if !local.connected.contains(&peer) {
                return Err(ChatError::StreamOpen(format!("{}: not connected", peer)));
            }

            let handler = inner
                .nodes
                .get(&peer)
                .and_then(|remote| remote.handlers.get(protocol).cloned())
                .ok_or_else(|| {
                    ChatError::StreamOpen(format!("{}: protocol {} not supported", peer, protocol))
                })?;

            let token = CancellationToken::new();
            for (this, other) in [(self.local, peer), (peer, self.local)] {
                if let Some(node) = inner.nodes.get_mut(&this) {
                    node.links.push((other, token.clone()));
                }
            }
            (handler, token)
        };

        let (local_io, remote_io) = tokio::io::duplex(DUPLEX_BUFFER);
        let inbound = ChatStream::new(self.local, Direction::Inbound, remote_io, token.clone());
        let local = self.local;
        tokio::spawn(async move {
            if let Err(e) = handler.handle(inbound).await {
                debug!(%local, error = %e, "Remote stream handler failed");
            }
        });

        Ok(ChatStream::new(peer, Direction::Outbound, local_io, token))
    }

    async fn reserve(&self, relay: &PeerAddress, _timeout: Duration) -> ChatResult<Reservation> {
        self.record(TransportCall::Reserve { relay: relay.peer });

        let mut inner = self.network.inner.lock();
        match inner.nodes.get_mut(&relay.peer) {
            Some(node) if node.reachable && node.accepts_reservations => {
                node.reservations.insert(self.local);
                Ok(Reservation { relay: relay.peer })
            }
            Some(_) => Err(ChatError::Reservation(format!(
                "relay {} refused the reservation",
                relay.peer
            ))),
            None => Err(ChatError::Reservation(format!(
                "relay {} is unknown",
                relay.peer
            ))),
        }
    }

    fn set_stream_handler(
        &self,
        protocol: &str,
        handler: Arc<dyn StreamHandler>,
    ) -> ChatResult<()> {
        let mut inner = self.network.inner.lock();
        let node = inner
            .nodes
            .get_mut(&self.local)
            .ok_or_else(|| ChatError::Transport("node left the network".to_string()))?;
        node.handlers.insert(protocol.to_string(), handler);
        Ok(())
    }
}
