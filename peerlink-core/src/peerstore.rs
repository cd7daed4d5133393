//! Peerstore: known peers and their addresses, each address with its own expiry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::time::Instant;

/// Boundary value meaning "this address never expires" (nanoseconds).
pub const PERMANENT_ADDR_TTL: u64 = u64::MAX;

/// How long an address stays in the peerstore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Permanent,
    For(Duration),
}

impl Ttl {
    /// Decode a boundary TTL in nanoseconds. [`PERMANENT_ADDR_TTL`] maps to [`Ttl::Permanent`].
    pub fn from_nanos(nanos: u64) -> Self {
        if nanos == PERMANENT_ADDR_TTL {
            Ttl::Permanent
        } else {
            Ttl::For(Duration::from_nanos(nanos))
        }
    }

    fn expiry(self, now: Instant) -> Option<Instant> {
        match self {
            Ttl::Permanent => None,
            // Too far out to represent: treat as permanent.
            Ttl::For(d) => now.checked_add(d),
        }
    }

    fn is_zero(self) -> bool {
        matches!(self, Ttl::For(d) if d.is_zero())
    }
}

/// `None` = never expires.
type Expiry = Option<Instant>;

fn outlives(a: Expiry, b: Expiry) -> bool {
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a > b,
    }
}

/// Shared address book. Cloning yields another view of the same store.
#[derive(Clone, Default)]
pub struct Peerstore {
    inner: Arc<RwLock<HashMap<PeerId, HashMap<Multiaddr, Expiry>>>>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `addrs` into the peer's address set. An address already present keeps whichever
    /// expiry is later. A zero TTL adds nothing.
    pub fn add_addrs(&self, peer: PeerId, addrs: &[Multiaddr], ttl: Ttl) {
        if ttl.is_zero() || addrs.is_empty() {
            return;
        }
        let now = Instant::now();
        let expiry = ttl.expiry(now);
        let mut book = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let known = book.entry(peer).or_default();
        known.retain(|_, exp| exp.map_or(true, |e| e > now));
        for addr in addrs {
            let slot = known.entry(addr.clone()).or_insert(expiry);
            if outlives(expiry, *slot) {
                *slot = expiry;
            }
        }
    }

    /// Unexpired addresses for `peer`, in no particular order.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let book = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        book.get(peer)
            .map(|known| {
                known
                    .iter()
                    .filter(|(_, exp)| exp.map_or(true, |e| e > now))
                    .map(|(a, _)| a.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every address recorded for `peer`.
    pub fn clear_addrs(&self, peer: &PeerId) {
        let mut book = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        book.remove(peer);
    }

    /// Peers with at least one unexpired address.
    pub fn peers_with_addrs(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let book = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        book.iter()
            .filter(|(_, known)| known.values().any(|exp| exp.map_or(true, |e| e > now)))
            .map(|(p, _)| *p)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn ttl_from_nanos() {
        assert_eq!(Ttl::from_nanos(PERMANENT_ADDR_TTL), Ttl::Permanent);
        assert_eq!(
            Ttl::from_nanos(1_500_000_000),
            Ttl::For(Duration::from_millis(1500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_survives_short_ttl_expires() {
        let ps = Peerstore::new();
        let peer = PeerId::random();
        let keep = addr("/ip4/10.0.0.1/tcp/4001");
        let fade = addr("/ip4/10.0.0.2/tcp/4001");
        ps.add_addrs(peer, &[keep.clone()], Ttl::Permanent);
        ps.add_addrs(peer, &[fade.clone()], Ttl::For(Duration::from_secs(10)));
        assert_eq!(ps.addrs(&peer).len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ps.addrs(&peer), vec![keep.clone()]);

        tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 3600)).await;
        assert_eq!(ps.addrs(&peer), vec![keep]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_add_merges_and_keeps_longer_expiry() {
        let ps = Peerstore::new();
        let peer = PeerId::random();
        let a = addr("/ip4/127.0.0.1/tcp/9000");
        ps.add_addrs(peer, &[a.clone()], Ttl::For(Duration::from_secs(60)));
        ps.add_addrs(peer, &[a.clone(), a.clone()], Ttl::For(Duration::from_secs(5)));
        assert_eq!(ps.addrs(&peer), vec![a.clone()]);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(ps.addrs(&peer), vec![a.clone()]);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(ps.addrs(&peer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_upgrade_is_kept() {
        let ps = Peerstore::new();
        let peer = PeerId::random();
        let a = addr("/ip4/127.0.0.1/tcp/9001");
        ps.add_addrs(peer, &[a.clone()], Ttl::For(Duration::from_secs(1)));
        ps.add_addrs(peer, &[a.clone()], Ttl::Permanent);
        ps.add_addrs(peer, &[a.clone()], Ttl::For(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(ps.addrs(&peer), vec![a]);
    }

    #[test]
    fn zero_ttl_adds_nothing() {
        let ps = Peerstore::new();
        let peer = PeerId::random();
        ps.add_addrs(peer, &[addr("/ip4/127.0.0.1/tcp/1")], Ttl::For(Duration::ZERO));
        assert!(ps.addrs(&peer).is_empty());
        assert!(ps.peers_with_addrs().is_empty());
    }

    #[test]
    fn clones_share_the_same_book() {
        let ps = Peerstore::new();
        let view = ps.clone();
        let peer = PeerId::random();
        ps.add_addrs(peer, &[addr("/ip4/127.0.0.1/tcp/2")], Ttl::Permanent);
        assert_eq!(view.addrs(&peer).len(), 1);
        assert_eq!(view.peers_with_addrs(), vec![peer]);
        view.clear_addrs(&peer);
        assert!(ps.addrs(&peer).is_empty());
    }

    #[test]
    fn unknown_peer_has_no_addrs() {
        let ps = Peerstore::new();
        assert!(ps.addrs(&PeerId::random()).is_empty());
    }
}
