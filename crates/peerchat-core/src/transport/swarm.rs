//! libp2p-backed transport
//!
//! A single driver task owns the `Swarm` and multiplexes:
//!
//! 1. **Commands** from [`Libp2pTransport`] handles (dial, reserve).
//! 2. **Swarm events** (connections, listeners, relay reservations).
//! 3. **Shutdown** via the transport's cancellation token.
//!
//! Chat streams are opened and accepted through `libp2p-stream`, which does
//! not need the swarm itself, so stream negotiation never waits on the
//! driver loop.
//!
//! ## Behaviours
//!
//! - Circuit relay v2 client (reach and be reached through relays)
//! - Circuit relay v2 server (this node relays for others)
//! - Identify + DCUtR (hole punching upgrade of relayed connections)
//! - Ping (keeps idle connections observable)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{
    dcutr, identify, identity, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, StreamProtocol,
    Swarm,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChatStream, Direction, Reservation, StreamHandler, Transport};
use crate::address::{relay_listen_address, PeerAddress};
use crate::config::NodeConfig;
use crate::error::{ChatError, ChatResult};
use crate::peerstore::PeerStore;

/// Protocol version announced through identify
const IDENTIFY_PROTOCOL: &str = "/peerchat/1.0.0";

/// Connections without streams are closed after this long
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `spawn` waits for the first listen address
const LISTEN_READY_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Combined libp2p behaviour for a chat node
#[derive(NetworkBehaviour)]
struct ChatBehaviour {
    relay_client: relay::client::Behaviour,
    relay_server: relay::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    dcutr: dcutr::Behaviour,
    stream: libp2p_stream::Behaviour,
}

/// Requests from transport handles to the driver task
enum SwarmCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    Reserve {
        relay: PeerId,
        listen_addr: Multiaddr,
        reply: oneshot::Sender<ChatResult<Reservation>>,
    },
    CancelReservation {
        relay: PeerId,
    },
}

/// State shared between the handle and the driver task
#[derive(Default)]
struct Shared {
    peerstore: PeerStore,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    /// One token per connected peer; each chat stream holds a child of it,
    /// released when the stream's owner drops it
    links: Mutex<HashMap<PeerId, CancellationToken>>,
}

impl Shared {
    fn track_link(&self, peer: PeerId) -> CancellationToken {
        self.links.lock().entry(peer).or_default().child_token()
    }

    fn close_links(&self, peer: &PeerId) {
        if let Some(token) = self.links.lock().remove(peer) {
            token.cancel();
        }
    }

    fn close_all_links(&self) {
        let links = std::mem::take(&mut *self.links.lock());
        for token in links.into_values() {
            token.cancel();
        }
    }
}

/// [`Transport`] implementation on top of a libp2p swarm
pub struct Libp2pTransport {
    local_peer_id: PeerId,
    commands: mpsc::Sender<SwarmCommand>,
    control: Mutex<libp2p_stream::Control>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Libp2pTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Libp2pTransport")
            .field("local_peer_id", &self.local_peer_id)
            .field("listen_addrs", &*self.shared.listen_addrs.read())
            .finish_non_exhaustive()
    }
}

impl Libp2pTransport {
    /// Start a transport with a freshly generated identity
    pub async fn spawn(config: &NodeConfig) -> ChatResult<Arc<Self>> {
        Self::spawn_with_keypair(config, identity::Keypair::generate_ed25519()).await
    }

    /// Start a transport with the given identity.
    ///
    /// Returns once the listener reported its first address, or after a
    /// short grace period if it has not yet.
    pub async fn spawn_with_keypair(
        config: &NodeConfig,
        keypair: identity::Keypair,
    ) -> ChatResult<Arc<Self>> {
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair)?;
        let control = swarm.behaviour().stream.new_control();

        let listen: Multiaddr = config
            .listen_multiaddr()
            .parse()
            .map_err(|e| ChatError::Config(format!("invalid listen address: {}", e)))?;
        let listener = swarm
            .listen_on(listen.clone())
            .map_err(|e| ChatError::Transport(format!("failed to listen on {}: {}", listen, e)))?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();

        let driver = SwarmDriver {
            swarm,
            commands: command_rx,
            shared: shared.clone(),
            listener,
            ready: Some(ready_tx),
            pending_dials: HashMap::new(),
            pending_reservations: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        let driver = tokio::spawn(driver.run());

        match tokio::time::timeout(LISTEN_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(ChatError::Transport(
                    "swarm driver stopped before listening".to_string(),
                ))
            }
            Err(_) => warn!(%listen, "No listen address reported yet"),
        }

        info!(%local_peer_id, "libp2p transport started");

        Ok(Arc::new(Self {
            local_peer_id,
            commands: command_tx,
            control: Mutex::new(control),
            shared,
            shutdown,
            driver: Mutex::new(Some(driver)),
        }))
    }

    /// Stop the driver task; open chat streams are reported closed
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "swarm driver task failed");
            }
        }
    }

    async fn send_command(&self, command: SwarmCommand) -> ChatResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::Transport("swarm driver stopped".to_string()))
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.shared.listen_addrs.read().clone()
    }

    fn clear_backoff(&self, peer: &PeerId) {
        self.shared.peerstore.clear_backoff(peer);
    }

    fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        self.shared.peerstore.add_addresses(peer, addrs, ttl);
    }

    async fn connect(&self, target: &PeerAddress, timeout: Duration) -> ChatResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SwarmCommand::Dial {
            peer: target.peer,
            addrs: target.addrs.clone(),
            reply,
        })
        .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::Dial("swarm driver dropped the dial".to_string())),
            Err(_) => {
                self.shared.peerstore.record_dial_failure(&target.peer);
                Err(ChatError::Dial(format!(
                    "dial to {} timed out after {:?}",
                    target.peer, timeout
                )))
            }
        }
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        deadline: Option<Duration>,
    ) -> ChatResult<ChatStream> {
        let protocol = stream_protocol(protocol)?;
        let mut control = self.control.lock().clone();
        let open = control.open_stream(peer, protocol);

        let opened = match deadline {
            Some(limit) => tokio::time::timeout(limit, open).await.map_err(|_| {
                ChatError::StreamOpen(format!("stream to {} timed out after {:?}", peer, limit))
            })?,
            None => open.await,
        };
        let stream = opened.map_err(|e| ChatError::StreamOpen(format!("{}: {}", peer, e)))?;

        let closed = self.shared.track_link(peer);
        Ok(ChatStream::new(peer, Direction::Outbound, stream.compat(), closed))
    }

    async fn reserve(&self, relay: &PeerAddress, timeout: Duration) -> ChatResult<Reservation> {
        let listen_addr = relay_listen_address(relay.addrs.first(), &relay.peer);
        let (reply, rx) = oneshot::channel();
        self.send_command(SwarmCommand::Reserve {
            relay: relay.peer,
            listen_addr,
            reply,
        })
        .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::Reservation(
                "swarm driver dropped the reservation".to_string(),
            )),
            Err(_) => {
                self.send_command(SwarmCommand::CancelReservation { relay: relay.peer })
                    .await?;
                Err(ChatError::Reservation(format!(
                    "relay {} did not answer within {:?}",
                    relay.peer, timeout
                )))
            }
        }
    }

    fn set_stream_handler(
        &self,
        protocol: &str,
        handler: Arc<dyn StreamHandler>,
    ) -> ChatResult<()> {
        let protocol = stream_protocol(protocol)?;
        let mut incoming = self
            .control
            .lock()
            .accept(protocol.clone())
            .map_err(|e| ChatError::Transport(format!("{}: {}", protocol, e)))?;

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = incoming.next() => next,
                };
                let Some((peer, stream)) = next else {
                    break;
                };

                let closed = shared.track_link(peer);
                let chat = ChatStream::new(peer, Direction::Inbound, stream.compat(), closed);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(chat).await {
                        warn!(%peer, error = %e, "Inbound stream handler failed");
                    }
                });
            }
            debug!(%protocol, "Inbound stream listener stopped");
        });

        Ok(())
    }
}

fn stream_protocol(protocol: &str) -> ChatResult<StreamProtocol> {
    StreamProtocol::try_from_owned(protocol.to_string())
        .map_err(|e| ChatError::Transport(format!("invalid protocol {}: {}", protocol, e)))
}

fn build_swarm(keypair: identity::Keypair) -> ChatResult<Swarm<ChatBehaviour>> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| ChatError::Transport(format!("failed to configure TCP transport: {}", e)))?
        .with_dns()
        .map_err(|e| ChatError::Transport(format!("failed to configure DNS: {}", e)))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| ChatError::Transport(format!("failed to configure relay client: {}", e)))?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = key.public().to_peer_id();
            ChatBehaviour {
                relay_client,
                relay_server: relay::Behaviour::new(local_peer_id, relay::Config::default()),
                identify: identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                )),
                ping: ping::Behaviour::new(ping::Config::new()),
                dcutr: dcutr::Behaviour::new(local_peer_id),
                stream: libp2p_stream::Behaviour::new(),
            }
        })
        .map_err(|e| ChatError::Transport(format!("failed to build network behaviour: {}", e)))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}

struct PendingDial {
    peer: PeerId,
    reply: oneshot::Sender<ChatResult<()>>,
}

struct PendingReservation {
    relay: PeerId,
    reply: oneshot::Sender<ChatResult<Reservation>>,
}

/// Owner of the swarm; runs until shutdown or until every handle is gone
struct SwarmDriver {
    swarm: Swarm<ChatBehaviour>,
    commands: mpsc::Receiver<SwarmCommand>,
    shared: Arc<Shared>,
    /// The primary TCP listener
    listener: ListenerId,
    ready: Option<oneshot::Sender<ChatResult<()>>>,
    pending_dials: HashMap<ConnectionId, PendingDial>,
    pending_reservations: HashMap<ListenerId, PendingReservation>,
    shutdown: CancellationToken,
}

impl SwarmDriver {
    async fn run(mut self) {
        debug!("Swarm driver started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }

        self.shared.close_all_links();
        info!("Swarm driver stopped");
    }

    fn on_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),
            SwarmCommand::Reserve {
                relay,
                listen_addr,
                reply,
            } => match self.swarm.listen_on(listen_addr.clone()) {
                Ok(listener_id) => {
                    debug!(%relay, %listen_addr, "Requesting relay reservation");
                    self.pending_reservations
                        .insert(listener_id, PendingReservation { relay, reply });
                }
                Err(e) => {
                    let _ = reply.send(Err(ChatError::Reservation(format!(
                        "cannot listen on {}: {}",
                        listen_addr, e
                    ))));
                }
            },
            SwarmCommand::CancelReservation { relay } => {
                let abandoned: Vec<ListenerId> = self
                    .pending_reservations
                    .iter()
                    .filter(|(_, pending)| pending.relay == relay)
                    .map(|(id, _)| *id)
                    .collect();
                for id in abandoned {
                    self.pending_reservations.remove(&id);
                    self.swarm.remove_listener(id);
                }
            }
        }
    }

    fn dial(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, reply: oneshot::Sender<ChatResult<()>>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        if self.shared.peerstore.is_backed_off(&peer) {
            let _ = reply.send(Err(ChatError::Dial(format!(
                "peer {} is in dial backoff",
                peer
            ))));
            return;
        }

        let mut candidates = addrs;
        for known in self.shared.peerstore.addresses(&peer) {
            if !candidates.contains(&known) {
                candidates.push(known);
            }
        }

        let opts = DialOpts::peer_id(peer)
            .addresses(candidates)
            .condition(PeerCondition::Always)
            .build();
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials
                    .insert(connection_id, PendingDial { peer, reply });
            }
            Err(e) => {
                self.shared.peerstore.record_dial_failure(&peer);
                let _ = reply.send(Err(ChatError::Dial(format!("{}: {}", peer, e))));
            }
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<ChatBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening");
                {
                    let mut addrs = self.shared.listen_addrs.write();
                    if !addrs.contains(&address) {
                        addrs.push(address);
                    }
                }
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "Listen address expired");
                self.shared.listen_addrs.write().retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                debug!(
                    %peer_id,
                    address = %endpoint.get_remote_address(),
                    num_established = num_established.get(),
                    "Connection established"
                );
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    self.shared.peerstore.record_dial_success(&pending.peer);
                    let _ = pending.reply.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                warn!(?peer_id, %error, "Outgoing connection failed");
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    self.shared.peerstore.record_dial_failure(&pending.peer);
                    let _ = pending
                        .reply
                        .send(Err(ChatError::Dial(format!("{}: {}", pending.peer, error))));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(%peer_id, num_established, ?cause, "Connection closed");
                if num_established == 0 {
                    self.shared.close_links(&peer_id);
                }
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                self.fail_listener(listener_id, reason);
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                self.fail_listener(listener_id, error.to_string());
            }
            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),
            _ => {}
        }
    }

    fn fail_listener(&mut self, listener_id: ListenerId, reason: String) {
        if listener_id == self.listener {
            warn!(%reason, "Primary listener failed");
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(Err(ChatError::Transport(reason.clone())));
            }
        }

        if let Some(pending) = self.pending_reservations.remove(&listener_id) {
            warn!(relay = %pending.relay, %reason, "Relay reservation failed");
            let _ = pending.reply.send(Err(ChatError::Reservation(format!(
                "{}: {}",
                pending.relay, reason
            ))));
        }
    }

    fn on_behaviour_event(&mut self, event: ChatBehaviourEvent) {
        match event {
            ChatBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                info!(%relay_peer_id, renewal, "Relay reservation accepted");
                if renewal {
                    return;
                }
                let accepted = self
                    .pending_reservations
                    .iter()
                    .find(|(_, pending)| pending.relay == relay_peer_id)
                    .map(|(id, _)| *id);
                if let Some(pending) = accepted.and_then(|id| self.pending_reservations.remove(&id)) {
                    let _ = pending.reply.send(Ok(Reservation {
                        relay: relay_peer_id,
                    }));
                }
            }
            ChatBehaviourEvent::RelayClient(event) => debug!(?event, "Relay client event"),
            ChatBehaviourEvent::RelayServer(event) => debug!(?event, "Relay server event"),
            ChatBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }
            ChatBehaviourEvent::Dcutr(event) => debug!(?event, "Hole punching event"),
            _ => {}
        }
    }
}
