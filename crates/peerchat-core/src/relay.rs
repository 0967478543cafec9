//! Relay reservation
//!
//! Connects to a relay, reserves a slot on it and reports the circuit
//! addresses other peers can use to reach this node through it. A failed
//! reservation leaves the node without relay reachability; it is not
//! retried and nothing is registered for the relay itself.

use std::sync::Arc;

use libp2p::Multiaddr;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::address::{query_escape, relay_circuit_address, PeerAddress};
use crate::config::{DIAL_TIMEOUT, PERMANENT_ADDR_TTL, RESERVE_TIMEOUT};
use crate::error::ChatResult;
use crate::events::ChatEvent;
use crate::transport::Transport;

pub struct RelayManager {
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<ChatEvent>,
}

impl RelayManager {
    pub fn new(transport: Arc<dyn Transport>, events: broadcast::Sender<ChatEvent>) -> Self {
        Self { transport, events }
    }

    /// Reserve a slot on the relay at `address`.
    ///
    /// Returns one circuit address per known relay transport address.
    pub async fn connect_via_relay(&self, address: &str) -> ChatResult<Vec<Multiaddr>> {
        let relay = PeerAddress::parse(address)?;

        self.transport.clear_backoff(&relay.peer);
        self.transport
            .add_addresses(&relay.peer, &relay.addrs, PERMANENT_ADDR_TTL);

        if let Err(e) = self.transport.connect(&relay, DIAL_TIMEOUT).await {
            error!(relay = %relay, error = %e, "Connecting to relay failed");
            return Err(e);
        }

        let reservation = match self.transport.reserve(&relay, RESERVE_TIMEOUT).await {
            Ok(reservation) => reservation,
            Err(e) => {
                error!(relay = %relay, error = %e, "Reserve failed");
                return Err(e);
            }
        };
        info!(relay = %reservation.relay, "Relay reservation held");

        let local = self.transport.local_peer_id();
        let circuits: Vec<Multiaddr> = relay
            .addrs
            .iter()
            .map(|addr| relay_circuit_address(addr, &reservation.relay, &local))
            .collect();

        for circuit in &circuits {
            let address = circuit.to_string();
            info!("Your address via relay is {}", query_escape(&address));
            let _ = self.events.send(ChatEvent::RelayAddress { address });
        }

        Ok(circuits)
    }
}
