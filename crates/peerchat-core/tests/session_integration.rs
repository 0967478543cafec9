//! Session Integration Tests
//!
//! Whole nodes (session + dispatcher + receiver) wired onto the in-memory
//! transport, so every scenario is deterministic and inspectable.
//!
//! ## What These Tests Verify
//!
//! - Stream deadlines for direct versus relay circuit targets
//! - Malformed control commands never reach the transport
//! - Exactly one read loop per registered contact
//! - Retrying a failed connect without manual backoff cleanup
//! - Broadcast fan-out, including the empty registry and bursts
//! - Broadcasting while contacts are registered from other tasks
//! - Relay reservation success, failure and startup reservation
//! - Conversations surviving node shutdown
//! - Shutdown interrupting a connect that would never finish

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use peerchat_core::config::{CHAT_PROTOCOL, DIAL_TIMEOUT, RESERVE_TIMEOUT};
use peerchat_core::{
    ChatEvent, ChatStream, Contact, ContactId, ContactRegistry, Direction, Dispatcher,
    MemoryNetwork, MemoryTransport, NodeConfig, NodeSession, PeerAddress, StopReason, Transport,
    TransportCall,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    transport: Arc<MemoryTransport>,
    session: NodeSession,
    events: broadcast::Receiver<ChatEvent>,
}

impl Node {
    async fn start(network: &MemoryNetwork) -> Self {
        Self::start_with(network, NodeConfig::default()).await
    }

    async fn start_with(network: &MemoryNetwork, config: NodeConfig) -> Self {
        let transport = network.add_node();
        let session = NodeSession::start(config, transport.clone()).await.unwrap();
        let events = session.subscribe();
        Self {
            transport,
            session,
            events,
        }
    }

    fn peer(&self) -> libp2p::PeerId {
        self.transport.local_peer_id()
    }

    fn address(&self) -> String {
        self.transport.p2p_address()
    }

    async fn submit(&self, raw: &str) {
        self.session.queue().submit(raw).await.unwrap();
    }

    async fn wait_for<F>(&mut self, mut matches: F) -> ChatEvent
    where
        F: FnMut(&ChatEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_message(&mut self) -> (ContactId, String) {
        match self
            .wait_for(|e| matches!(e, ChatEvent::MessageReceived { .. }))
            .await
        {
            ChatEvent::MessageReceived { contact, text, .. } => (contact, text),
            _ => unreachable!(),
        }
    }

    async fn wait_for_failure(&mut self) -> (String, String) {
        match self
            .wait_for(|e| matches!(e, ChatEvent::CommandFailed { .. }))
            .await
        {
            ChatEvent::CommandFailed { command, error } => (command, error),
            _ => unreachable!(),
        }
    }

    async fn wait_for_registration(&mut self) -> ContactId {
        match self
            .wait_for(|e| matches!(e, ChatEvent::ContactRegistered { .. }))
            .await
        {
            ChatEvent::ContactRegistered { contact, .. } => contact,
            _ => unreachable!(),
        }
    }

    fn stream_deadlines(&self) -> Vec<Option<Duration>> {
        self.transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::NewStream {
                    protocol, deadline, ..
                } => {
                    assert_eq!(protocol, CHAT_PROTOCOL);
                    Some(deadline)
                }
                _ => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn test_hello_reaches_peer_verbatim() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let mut b = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    a.wait_for_registration().await;
    b.wait_for_registration().await;

    assert_eq!(a.session.registry().len(), 1);
    assert_eq!(b.session.registry().len(), 1);
    assert_eq!(a.session.registry().snapshot()[0].peer(), b.peer());
    assert_eq!(b.session.registry().snapshot()[0].peer(), a.peer());

    a.submit("hello").await;
    let (_, text) = b.wait_for_message().await;
    assert_eq!(text, "hello");

    // And back the other way over the same stream
    b.submit("hi a").await;
    let (_, text) = a.wait_for_message().await;
    assert_eq!(text, "hi a");
}

#[tokio::test]
async fn test_direct_connect_bounds_stream_open() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let b = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    a.wait_for_registration().await;

    assert_eq!(a.stream_deadlines(), vec![Some(DIAL_TIMEOUT)]);
}

#[tokio::test]
async fn test_circuit_connect_opens_stream_without_deadline() {
    let network = MemoryNetwork::new();
    let relay = Node::start(&network).await;
    let mut a = Node::start(&network).await;
    let b = Node::start(&network).await;

    let relay_addr = PeerAddress::parse(&relay.address()).unwrap();
    b.transport.reserve(&relay_addr, RESERVE_TIMEOUT).await.unwrap();

    a.submit(&format!("/connect {}/p2p-circuit/p2p/{}", relay.address(), b.peer()))
        .await;
    a.wait_for_registration().await;

    assert_eq!(a.stream_deadlines(), vec![None]);
    assert_eq!(a.session.registry().snapshot()[0].peer(), b.peer());
}

#[tokio::test]
async fn test_control_commands_without_address_touch_no_transport() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;

    for raw in ["/connect", "/relay", "/connect   ", "/dance /p2p/x"] {
        a.submit(raw).await;
        let (command, error) = a.wait_for_failure().await;
        assert_eq!(command, raw.trim());
        assert!(error.contains("Command parse error"), "{error}");
    }

    assert!(a.transport.calls().is_empty());
    assert!(a.session.registry().is_empty());
}

#[tokio::test]
async fn test_each_contact_gets_exactly_one_receiver() {
    let network = MemoryNetwork::new();
    let mut hub = Node::start(&network).await;
    let mut peers = Vec::new();
    for _ in 0..4 {
        peers.push(Node::start(&network).await);
    }

    for peer in &peers {
        peer.submit(&format!("/connect {}", hub.address())).await;
    }

    let mut registered = HashSet::new();
    let mut started = HashSet::new();
    while started.len() < peers.len() || registered.len() < peers.len() {
        match hub
            .wait_for(|e| {
                matches!(
                    e,
                    ChatEvent::ContactRegistered { .. } | ChatEvent::ReceiverStarted { .. }
                )
            })
            .await
        {
            ChatEvent::ContactRegistered { contact, .. } => {
                assert!(registered.insert(contact), "registered twice");
            }
            ChatEvent::ReceiverStarted { contact } => {
                assert!(started.insert(contact), "receiver started twice");
            }
            _ => unreachable!(),
        }
    }

    assert_eq!(registered, started);
    assert_eq!(hub.session.registry().len(), peers.len());
}

#[tokio::test]
async fn test_retry_after_dial_failure_needs_no_manual_cleanup() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let b = Node::start(&network).await;

    network.set_reachable(&b.peer(), false);
    a.submit(&format!("/connect {}", b.address())).await;
    let (_, error) = a.wait_for_failure().await;
    assert!(error.contains("Dial error"), "{error}");
    assert!(a.transport.is_backed_off(&b.peer()));

    network.set_reachable(&b.peer(), true);
    a.submit(&format!("/connect {}", b.address())).await;
    a.wait_for_registration().await;

    let clears = a
        .transport
        .calls()
        .into_iter()
        .filter(|call| *call == TransportCall::ClearBackoff { peer: b.peer() })
        .count();
    assert_eq!(clears, 2);
    assert_eq!(a.session.registry().len(), 1);
}

#[tokio::test]
async fn test_broadcast_reaches_every_contact_once() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let mut b = Node::start(&network).await;
    let mut c = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    a.submit(&format!("/connect {}", c.address())).await;
    a.wait_for_registration().await;
    a.wait_for_registration().await;

    a.submit("first").await;
    a.submit("second").await;

    for node in [&mut b, &mut c] {
        assert_eq!(node.wait_for_message().await.1, "first");
        assert_eq!(node.wait_for_message().await.1, "second");
    }
}

#[tokio::test]
async fn test_broadcast_skips_closed_contacts() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let mut b = Node::start(&network).await;
    let mut c = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    let to_b = a.wait_for_registration().await;
    a.submit(&format!("/connect {}", c.address())).await;
    a.wait_for_registration().await;

    a.session.registry().get(to_b).unwrap().close();
    match b
        .wait_for(|e| matches!(e, ChatEvent::ReceiverStopped { .. }))
        .await
    {
        ChatEvent::ReceiverStopped { reason, .. } => assert_eq!(reason, StopReason::Eof),
        _ => unreachable!(),
    }

    a.submit("still here").await;
    assert_eq!(c.wait_for_message().await.1, "still here");

    // The closed contact stays registered
    assert_eq!(a.session.registry().len(), 2);
    assert!(a.session.contacts().iter().any(|summary| summary.closed));
}

#[tokio::test]
async fn test_payload_with_no_contacts_is_harmless() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;

    a.submit("anyone?").await;
    a.submit("/connect").await;

    // The parse failure is only published after the payload was handled
    let (command, _) = a.wait_for_failure().await;
    assert_eq!(command, "/connect");
    assert!(a.transport.calls().is_empty());
}

#[tokio::test]
async fn test_relay_failure_leaves_registry_unchanged() {
    let network = MemoryNetwork::new();
    let relay = Node::start(&network).await;
    let mut a = Node::start(&network).await;
    network.set_accepts_reservations(&relay.peer(), false);

    a.submit(&format!("/relay {}", relay.address())).await;
    let (_, error) = a.wait_for_failure().await;

    assert!(error.contains("Reservation error"), "{error}");
    assert!(a.session.registry().is_empty());
    assert!(relay.session.registry().is_empty());
}

#[tokio::test]
async fn test_relay_reports_circuit_address() {
    let network = MemoryNetwork::new();
    let relay = Node::start(&network).await;
    let mut a = Node::start(&network).await;

    a.submit(&format!("/relay {}", relay.address())).await;
    let address = match a
        .wait_for(|e| matches!(e, ChatEvent::RelayAddress { .. }))
        .await
    {
        ChatEvent::RelayAddress { address } => address,
        _ => unreachable!(),
    };

    assert_eq!(
        address,
        format!("{}/p2p-circuit/p2p/{}", relay.address(), a.peer())
    );
    assert!(network.has_reservation(&relay.peer(), &a.peer()));
    assert!(a.session.registry().is_empty());
}

#[tokio::test]
async fn test_configured_relay_is_reserved_at_startup() {
    let network = MemoryNetwork::new();
    let relay = Node::start(&network).await;
    let config = NodeConfig {
        relay_address: Some(relay.address()),
        ..Default::default()
    };
    let a = Node::start_with(&network, config).await;

    tokio::time::timeout(WAIT, async {
        while !network.has_reservation(&relay.peer(), &a.peer()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("startup reservation never happened");
}

#[tokio::test]
async fn test_conversations_survive_shutdown() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let mut b = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    a.wait_for_registration().await;
    b.wait_for_registration().await;

    a.session.shutdown().await;
    assert!(a.session.queue().submit("too late").await.is_err());

    b.submit("are you still there?").await;
    let (_, text) = a.wait_for_message().await;
    assert_eq!(text, "are you still there?");
    assert!(!a.session.registry().snapshot()[0].is_closed());
}

#[tokio::test]
async fn test_transport_disconnect_closes_contacts() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let mut b = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    let contact = a.wait_for_registration().await;
    b.wait_for_registration().await;

    network.disconnect(&a.peer(), &b.peer());

    a.wait_for(|e| matches!(e, ChatEvent::ReceiverStopped { contact: c, .. } if *c == contact))
        .await;
    assert!(a.session.registry().get(contact).unwrap().is_closed());
}

#[tokio::test]
async fn test_burst_reaches_healthy_peer_in_full() {
    let network = MemoryNetwork::new();
    let mut a = Node::start(&network).await;
    let mut b = Node::start(&network).await;

    a.submit(&format!("/connect {}", b.address())).await;
    a.wait_for_registration().await;
    b.wait_for_registration().await;

    for n in 0..200 {
        a.submit(&format!("line {n}")).await;
    }
    for n in 0..200 {
        assert_eq!(b.wait_for_message().await.1, format!("line {n}"));
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_stalled_relay_connect() {
    let network = MemoryNetwork::new();
    let relay = Node::start(&network).await;
    let target = Node::start(&network).await;
    let a = Node::start(&network).await;

    target
        .transport
        .reserve(&PeerAddress::parse(&relay.address()).unwrap(), RESERVE_TIMEOUT)
        .await
        .unwrap();
    network.set_stall_streams(&a.peer(), true);

    a.submit(&format!(
        "/connect {}/p2p-circuit/p2p/{}",
        relay.address(),
        target.peer()
    ))
    .await;
    tokio::time::timeout(WAIT, async {
        while a.stream_deadlines().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream open never started");
    assert_eq!(a.stream_deadlines(), vec![None]);

    tokio::time::timeout(WAIT, a.session.shutdown())
        .await
        .expect("shutdown hung on a pending connect");
    assert!(a.session.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_while_contacts_are_added_concurrently() {
    const ADDERS: usize = 4;
    const PER_ADDER: usize = 25;
    const TOTAL: usize = ADDERS * PER_ADDER;

    let network = MemoryNetwork::new();
    let (events, _) = broadcast::channel(1024);
    let (registry, mut notifications) = ContactRegistry::new(events.clone());
    let registry = Arc::new(registry);
    let dispatcher = Dispatcher::new(network.add_node(), registry.clone(), events);

    let drain = tokio::spawn(async move {
        let mut ids = HashSet::new();
        while ids.len() < TOTAL {
            match notifications.recv().await {
                Some(contact) => {
                    ids.insert(contact.id());
                }
                None => break,
            }
        }
        ids
    });

    let adders: Vec<_> = (0..ADDERS)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut remotes = Vec::new();
                for _ in 0..PER_ADDER {
                    let (local, remote) = tokio::io::duplex(64 * 1024);
                    let contact = Contact::new(ChatStream::new(
                        libp2p::PeerId::random(),
                        Direction::Inbound,
                        local,
                        CancellationToken::new(),
                    ));
                    registry.add(contact).await.unwrap();
                    remotes.push(remote);
                    tokio::task::yield_now().await;
                }
                remotes
            })
        })
        .collect();

    let mut previous = 0;
    let mut broadcasts = 0;
    while registry.len() < TOTAL {
        let report = dispatcher.broadcast("tick");
        assert_eq!(report.skipped, 0);
        assert!(report.queued >= previous, "snapshots never shrink");
        assert!(report.queued <= TOTAL);
        previous = report.queued;
        broadcasts += 1;
        tokio::task::yield_now().await;
    }

    let mut remotes = Vec::new();
    for adder in adders {
        remotes.extend(tokio::time::timeout(WAIT, adder).await.unwrap().unwrap());
    }
    let ids = tokio::time::timeout(WAIT, drain).await.unwrap().unwrap();

    assert!(broadcasts > 0);
    assert_eq!(remotes.len(), TOTAL);
    assert_eq!(ids.len(), TOTAL, "every contact notified exactly once");
    assert_eq!(registry.len(), TOTAL);

    let snapshot_ids: HashSet<_> = registry.snapshot().iter().map(|c| c.id()).collect();
    assert_eq!(snapshot_ids, ids);
    assert_eq!(dispatcher.broadcast("last").queued, TOTAL);
}
