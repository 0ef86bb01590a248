//! Peer registry
//!
//! The single owner of every [`Peer`]. Other threads borrow `Arc` handles
//! through snapshots. Disconnected peers move to a holding list and are only
//! released once no other thread still holds a handle.

use crate::net::peer::{ConnectionType, Peer, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type PeerRef = Arc<Peer>;

/// Active and disconnecting peers
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<PeerId, PeerRef>>,
    disconnected: Mutex<Vec<PeerRef>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next peer id
    pub fn next_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, peer: PeerRef) {
        self.peers.write().insert(peer.id, peer);
    }

    pub fn get(&self, id: PeerId) -> Option<PeerRef> {
        self.peers.read().get(&id).cloned()
    }

    /// Handles to all active peers, in id order
    pub fn snapshot(&self) -> Vec<PeerRef> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Active peers matching a predicate
    pub fn count(&self, pred: impl Fn(&Peer) -> bool) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| !p.is_disconnecting() && pred(p))
            .count()
    }

    pub fn count_type(&self, conn_type: ConnectionType) -> usize {
        self.count(|p| p.conn_type == conn_type)
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<PeerRef> {
        self.peers
            .read()
            .values()
            .find(|p| !p.is_disconnecting() && p.addr == *addr)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<PeerRef> {
        self.peers
            .read()
            .values()
            .find(|p| !p.is_disconnecting() && p.addr_name == name)
            .cloned()
    }

    /// Whether `nonce` is the version nonce of one of our outbound
    /// connections, i.e. we connected to ourselves
    pub fn is_local_nonce(&self, nonce: u64) -> bool {
        self.peers
            .read()
            .values()
            .any(|p| !p.is_inbound() && !p.version_received() && p.local_nonce == nonce)
    }

    /// Move peers flagged for disconnect out of the active map, closing
    /// their sockets. Returns the peers moved.
    pub fn collect_disconnected(&self, registry: Option<&mio::Registry>) -> Vec<PeerRef> {
        let flagged: Vec<PeerRef> = {
            let mut peers = self.peers.write();
            let ids: Vec<PeerId> = peers
                .values()
                .filter(|p| p.is_disconnecting())
                .map(|p| p.id)
                .collect();
            ids.iter().filter_map(|id| peers.remove(id)).collect()
        };
        if flagged.is_empty() {
            return flagged;
        }
        for peer in &flagged {
            peer.close_socket(registry);
        }
        self.disconnected.lock().extend(flagged.iter().cloned());
        flagged
    }

    /// Release disconnected peers nobody else references any more. The
    /// returned handles are the last ones; dropping them frees the peers.
    pub fn reap(&self) -> Vec<PeerRef> {
        let mut disconnected = self.disconnected.lock();
        let mut reaped = Vec::new();
        let mut i = 0;
        while i < disconnected.len() {
            if Arc::strong_count(&disconnected[i]) == 1 {
                reaped.push(disconnected.swap_remove(i));
            } else {
                i += 1;
            }
        }
        reaped
    }

    pub fn pending_reap(&self) -> usize {
        self.disconnected.lock().len()
    }

    /// Flag every peer for disconnect and move them all out
    pub fn disconnect_all(&self, registry: Option<&mio::Registry>) -> Vec<PeerRef> {
        for peer in self.snapshot() {
            peer.mark_disconnect("shutdown");
        }
        self.collect_disconnected(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::askfor::AskForTracker;
    use crate::net::counters::NetCounters;
    use crate::net::peer::PeerParams;
    use crate::protocol::header::PayloadLimits;

    fn peer(registry: &PeerRegistry, addr: &str, conn_type: ConnectionType) -> PeerRef {
        Arc::new(Peer::new(
            PeerParams {
                id: registry.next_id(),
                addr: addr.parse().unwrap(),
                addr_name: addr.to_string(),
                conn_type,
                whitelisted: false,
                keyed_netgroup: 0,
                local_nonce: 7,
                magic: [1, 2, 3, 4],
                limits: PayloadLimits {
                    max_payload: 1024,
                    max_block: 4096,
                },
            },
            None,
            NetCounters::new(),
            AskForTracker::new(10),
        ))
    }

    #[test]
    fn test_ids_monotonic() {
        let registry = PeerRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_deferred_reap() {
        let registry = PeerRegistry::new();
        let p = peer(&registry, "1.1.1.1:8333", ConnectionType::Inbound);
        registry.insert(p.clone());
        assert_eq!(registry.len(), 1);

        p.mark_disconnect("test");
        let moved = registry.collect_disconnected(None);
        assert_eq!(moved.len(), 1);
        assert!(registry.is_empty());
        drop(moved);

        // Still referenced by `p`
        assert!(registry.reap().is_empty());
        assert_eq!(registry.pending_reap(), 1);

        drop(p);
        assert_eq!(registry.reap().len(), 1);
        assert_eq!(registry.pending_reap(), 0);
    }

    #[test]
    fn test_counts_skip_disconnecting() {
        let registry = PeerRegistry::new();
        let a = peer(&registry, "1.1.1.1:8333", ConnectionType::Inbound);
        let b = peer(&registry, "2.2.2.2:8333", ConnectionType::Outbound);
        registry.insert(a.clone());
        registry.insert(b.clone());

        assert_eq!(registry.count_type(ConnectionType::Inbound), 1);
        a.mark_disconnect("test");
        assert_eq!(registry.count_type(ConnectionType::Inbound), 0);
        assert!(registry.find_by_addr(&"2.2.2.2:8333".parse().unwrap()).is_some());
        assert!(registry.find_by_addr(&"1.1.1.1:8333".parse().unwrap()).is_none());
    }

    #[test]
    fn test_self_connection_nonce() {
        let registry = PeerRegistry::new();
        registry.insert(peer(&registry, "3.3.3.3:8333", ConnectionType::Outbound));
        assert!(registry.is_local_nonce(7));
        assert!(!registry.is_local_nonce(8));
    }
}
