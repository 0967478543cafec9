//! Address store and dial backoff bookkeeping
//!
//! Transports consult the store before dialing: known addresses are merged
//! into the dial, and a peer that recently failed is refused until its
//! backoff window passes. The session layer clears the backoff before every
//! operator-requested dial so a retry is never penalized by earlier failures.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;

/// Backoff after the first failure
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Growth factor, multiplied by the square of previous failures
pub const BACKOFF_COEF: Duration = Duration::from_secs(1);

/// Ceiling of a single backoff window
pub const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: Multiaddr,
    /// `None` means the address never expires
    expires: Option<Instant>,
}

impl AddrEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    until: Instant,
}

#[derive(Debug, Default)]
struct PeerStoreInner {
    addrs: HashMap<PeerId, Vec<AddrEntry>>,
    backoff: HashMap<PeerId, Backoff>,
}

/// Thread-safe per-peer address book with dial backoff
#[derive(Debug, Default)]
pub struct PeerStore {
    inner: Mutex<PeerStoreInner>,
}

impl PeerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register addresses for a peer.
    ///
    /// An address already known keeps the later of the two expiries. A TTL
    /// too large to represent as an instant is stored as permanent.
    pub fn add_addresses(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        let expires = Instant::now().checked_add(ttl);
        let mut inner = self.inner.lock();
        let entries = inner.addrs.entry(*peer).or_default();

        for addr in addrs {
            match entries.iter_mut().find(|e| &e.addr == addr) {
                Some(entry) => {
                    entry.expires = match (entry.expires, expires) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                None => entries.push(AddrEntry {
                    addr: addr.clone(),
                    expires,
                }),
            }
        }
    }

    /// Unexpired addresses of a peer, in insertion order
    pub fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(entries) = inner.addrs.get_mut(peer) else {
            return Vec::new();
        };
        entries.retain(|e| e.is_live(now));
        entries.iter().map(|e| e.addr.clone()).collect()
    }

    /// Record a failed dial and return the backoff window it started.
    ///
    /// Window = `BACKOFF_BASE + BACKOFF_COEF * failures^2`, capped at
    /// `BACKOFF_MAX`, where `failures` counts earlier failures.
    pub fn record_dial_failure(&self, peer: &PeerId) -> Duration {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let failures = inner.backoff.get(peer).map(|b| b.failures).unwrap_or(0);
        let window = backoff_window(failures);

        inner.backoff.insert(
            *peer,
            Backoff {
                failures: failures.saturating_add(1),
                until: now + window,
            },
        );
        window
    }

    /// Whether dials to this peer are currently refused
    pub fn is_backed_off(&self, peer: &PeerId) -> bool {
        let inner = self.inner.lock();
        inner
            .backoff
            .get(peer)
            .map(|b| b.until > Instant::now())
            .unwrap_or(false)
    }

    /// Forget all recorded failures for a peer
    pub fn clear_backoff(&self, peer: &PeerId) {
        self.inner.lock().backoff.remove(peer);
    }

    /// A successful dial resets the failure history
    pub fn record_dial_success(&self, peer: &PeerId) {
        self.clear_backoff(peer);
    }
}

fn backoff_window(previous_failures: u32) -> Duration {
    let squared = previous_failures.saturating_mul(previous_failures);
    BACKOFF_BASE
        .saturating_add(BACKOFF_COEF.saturating_mul(squared))
        .min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_and_list_addresses() {
        let store = PeerStore::new();
        let peer = PeerId::random();

        store.add_addresses(&peer, &[addr("/ip4/1.2.3.4/tcp/1")], Duration::MAX);
        store.add_addresses(
            &peer,
            &[addr("/ip4/1.2.3.4/tcp/1"), addr("/ip4/5.6.7.8/tcp/2")],
            Duration::MAX,
        );

        let addrs = store.addresses(&peer);
        assert_eq!(addrs.len(), 2, "duplicate address must be merged");
        assert_eq!(addrs[0], addr("/ip4/1.2.3.4/tcp/1"));
    }

    #[test]
    fn test_unknown_peer_has_no_addresses() {
        let store = PeerStore::new();
        assert!(store.addresses(&PeerId::random()).is_empty());
    }

    #[test]
    fn test_expired_addresses_are_dropped() {
        let store = PeerStore::new();
        let peer = PeerId::random();

        store.add_addresses(&peer, &[addr("/ip4/1.2.3.4/tcp/1")], Duration::ZERO);
        assert!(store.addresses(&peer).is_empty());
    }

    #[test]
    fn test_permanent_ttl_survives_short_ttl_readd() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        let a = addr("/ip4/1.2.3.4/tcp/1");

        store.add_addresses(&peer, &[a.clone()], Duration::MAX);
        store.add_addresses(&peer, &[a.clone()], Duration::ZERO);
        assert_eq!(store.addresses(&peer), vec![a]);
    }

    #[test]
    fn test_backoff_lifecycle() {
        let store = PeerStore::new();
        let peer = PeerId::random();

        assert!(!store.is_backed_off(&peer));

        let first = store.record_dial_failure(&peer);
        assert_eq!(first, BACKOFF_BASE);
        assert!(store.is_backed_off(&peer));

        store.clear_backoff(&peer);
        assert!(!store.is_backed_off(&peer));
    }

    #[test]
    fn test_backoff_grows_quadratically_and_caps() {
        let store = PeerStore::new();
        let peer = PeerId::random();

        let windows: Vec<Duration> = (0..4).map(|_| store.record_dial_failure(&peer)).collect();
        assert_eq!(
            windows,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(6),
                Duration::from_secs(9),
                Duration::from_secs(14),
            ]
        );

        for _ in 0..100 {
            store.record_dial_failure(&peer);
        }
        assert_eq!(store.record_dial_failure(&peer), BACKOFF_MAX);
    }

    #[test]
    fn test_success_resets_failures() {
        let store = PeerStore::new();
        let peer = PeerId::random();

        store.record_dial_failure(&peer);
        store.record_dial_failure(&peer);
        store.record_dial_success(&peer);

        assert!(!store.is_backed_off(&peer));
        assert_eq!(store.record_dial_failure(&peer), BACKOFF_BASE);
    }

    #[test]
    fn test_backoff_is_per_peer() {
        let store = PeerStore::new();
        let a = PeerId::random();
        let b = PeerId::random();

        store.record_dial_failure(&a);
        assert!(store.is_backed_off(&a));
        assert!(!store.is_backed_off(&b));
    }
}
