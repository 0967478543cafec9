//! Node session: the aggregate tying the chat layer together
//!
//! ```text
//!  HTTP / stdin ──► OutboundQueue ──► Dispatcher ──► ConnectionManager ─┐
//!                                         │          RelayManager       │
//!                                         ▼                             ▼
//!                                   contact outboxes ◄──────── ContactRegistry
//!                                                                  ▲    │
//!  Transport ──► InboundHandler ───────────────────────────────────┘    │
//!                                                        notifications  ▼
//!                                                                  Receiver
//! ```
//!
//! [`NodeSession::shutdown`] stops the dispatcher and the status ticker.
//! Contacts and their read loops keep running until their streams end.

use std::sync::Arc;

use libp2p::Multiaddr;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::address::{p2p_address, query_escape, short_peer_id};
use crate::config::{
    NodeConfig, CHAT_PROTOCOL, EVENT_CHANNEL_CAPACITY, OUTBOUND_QUEUE_CAPACITY, STATUS_INTERVAL,
};
use crate::contact::ContactSummary;
use crate::dispatcher::Dispatcher;
use crate::error::{ChatError, ChatResult};
use crate::events::ChatEvent;
use crate::inbound::InboundHandler;
use crate::receiver::Receiver;
use crate::registry::ContactRegistry;
use crate::transport::Transport;

/// Producer side of the outbound command queue
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<String>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push a command, waiting while the queue is full
    pub async fn submit(&self, raw: impl Into<String>) -> ChatResult<()> {
        self.tx
            .send(raw.into())
            .await
            .map_err(|_| ChatError::Queue("outbound queue closed".to_string()))
    }

    /// Push a command without waiting
    pub fn try_submit(&self, raw: impl Into<String>) -> ChatResult<()> {
        self.tx.try_send(raw.into()).map_err(|e| match e {
            TrySendError::Full(_) => ChatError::Queue("outbound queue full".to_string()),
            TrySendError::Closed(_) => ChatError::Queue("outbound queue closed".to_string()),
        })
    }
}

/// One running chat node
pub struct NodeSession {
    id: String,
    name: String,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<ContactRegistry>,
    queue: OutboundQueue,
    events: broadcast::Sender<ChatEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeSession {
    /// Wire the chat layer onto a running transport.
    ///
    /// Registers the inbound handler, starts the receiver, the dispatcher
    /// and the status ticker, and queues `/relay` when a relay is
    /// configured.
    pub async fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> ChatResult<Self> {
        config.validate()?;

        let local = transport.local_peer_id();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (registry, notifications) = ContactRegistry::new(events.clone());
        let registry = Arc::new(registry);

        transport.set_stream_handler(
            CHAT_PROTOCOL,
            Arc::new(InboundHandler::new(registry.clone())),
        )?;
        tokio::spawn(Receiver::new(events.clone()).run(notifications));

        let (queue, queue_rx) = OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher::new(transport.clone(), registry.clone(), events.clone());
        let dispatcher = tokio::spawn(dispatcher.run(queue_rx, shutdown.clone()));
        let ticker = tokio::spawn(status_ticker(registry.clone(), shutdown.clone()));

        let session = Self {
            id: local.to_string(),
            name: short_peer_id(&local),
            config,
            transport,
            registry,
            queue,
            events,
            shutdown,
            tasks: Mutex::new(vec![dispatcher, ticker]),
        };

        info!(id = %session.id, name = %session.name, "Node session started");
        for address in session.p2p_addresses() {
            info!("You are Online, Your p2p address is {}", query_escape(&address.to_string()));
        }

        if let Some(relay) = &session.config.relay_address {
            session.queue.submit(format!("/relay {}", relay)).await?;
        }

        Ok(session)
    }

    /// Full peer id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short display name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<ContactRegistry> {
        &self.registry
    }

    /// Injection point for outbound commands
    pub fn queue(&self) -> OutboundQueue {
        self.queue.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Listen addresses with this node's `/p2p/` suffix
    pub fn p2p_addresses(&self) -> Vec<Multiaddr> {
        let local = self.transport.local_peer_id();
        self.transport
            .listen_addrs()
            .iter()
            .map(|addr| p2p_address(addr, &local))
            .collect()
    }

    pub fn contacts(&self) -> Vec<ContactSummary> {
        self.registry.summaries()
    }

    /// Stop the dispatcher and the status ticker
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task failed");
            }
        }

        info!("bye");
    }
}

async fn status_ticker(registry: Arc<ContactRegistry>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                info!("{} peer online", registry.len() + 1);
            }
        }
    }
}
