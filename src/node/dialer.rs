//! Outbound connection threads
//!
//! - `run_outbound` keeps the outbound slots filled from the address
//!   manager and opens a feeler now and then. With `connect_only` set it
//!   dials only those nodes.
//! - `run_added` keeps manually added nodes connected.

use crate::net::netaddr::netgroup;
use crate::net::peer::ConnectionType;
use crate::node::connman::Connman;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Pause between outbound attempts
const OUTBOUND_INTERVAL: Duration = Duration::from_millis(500);

/// Average spacing of feeler connections
const FEELER_INTERVAL: Duration = Duration::from_secs(120);

/// Pause between manual connection attempts
const MANUAL_ATTEMPT_SPACING: Duration = Duration::from_millis(500);

/// Retry interval once manual nodes were tried
const MANUAL_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Poll interval when every added node is connected
const ADDED_IDLE_INTERVAL: Duration = Duration::from_secs(2);

/// Address manager draws per attempt
const MAX_SELECT_TRIES: usize = 100;

pub(crate) fn run_outbound(connman: Arc<Connman>) {
    if !connman.config().connect_only.is_empty() {
        run_connect_only(&connman);
        return;
    }

    log::debug!("outbound connection thread started");
    let mut next_feeler = Instant::now() + feeler_delay();
    while connman.sleep(OUTBOUND_INTERVAL) {
        if !connman.network_active() {
            continue;
        }
        let config = connman.config();
        let outbound = connman.peers().count_type(ConnectionType::Outbound);
        let feelers = connman.peers().count_type(ConnectionType::Feeler);

        let now = Instant::now();
        let conn_type = if outbound < config.max_outbound {
            ConnectionType::Outbound
        } else if feelers < config.max_feeler && now >= next_feeler {
            next_feeler = now + feeler_delay();
            ConnectionType::Feeler
        } else {
            continue;
        };

        let Some(target) = select_candidate(&connman, conn_type == ConnectionType::Feeler) else {
            continue;
        };
        connman.addrman().attempt(&target);
        if let Err(e) = connman.open_connection(target, None, conn_type) {
            log::debug!("{:?} connection to {} failed: {}", conn_type, target, e);
        }
    }
    log::debug!("outbound connection thread exit");
}

/// Jittered feeler delay between half and one and a half intervals
fn feeler_delay() -> Duration {
    let base = FEELER_INTERVAL.as_millis() as u64;
    Duration::from_millis(base / 2 + rand::random::<u64>() % base.max(1))
}

/// Pick an address to dial: not connected, not banned and not in a network
/// group we already have an outbound connection to
pub(crate) fn select_candidate(connman: &Connman, new_only: bool) -> Option<SocketAddr> {
    let groups: HashSet<Vec<u8>> = connman
        .peers()
        .snapshot()
        .iter()
        .filter(|p| !p.is_inbound())
        .map(|p| netgroup(&p.addr.ip()))
        .collect();

    for _ in 0..MAX_SELECT_TRIES {
        let candidate = connman.addrman().select(new_only)?;
        let addr = candidate.addr;
        if groups.contains(&netgroup(&addr.ip())) {
            continue;
        }
        if connman.is_banned(&addr.ip()) {
            continue;
        }
        if connman.peers().find_by_addr(&addr).is_some() {
            continue;
        }
        return Some(addr);
    }
    None
}

fn is_connected(connman: &Connman, name: &str) -> bool {
    connman.peers().find_by_name(name).is_some()
        || name
            .parse::<SocketAddr>()
            .ok()
            .and_then(|a| connman.peers().find_by_addr(&a))
            .is_some()
}

fn run_connect_only(connman: &Connman) {
    log::debug!("connect-only thread started");
    let nodes = connman.config().connect_only.clone();
    loop {
        for node in &nodes {
            if connman.network_active() && !is_connected(connman, node) {
                if let Err(e) = connman.connect_node(node, ConnectionType::Manual) {
                    log::debug!("connection to {} failed: {}", node, e);
                }
            }
            if !connman.sleep(MANUAL_ATTEMPT_SPACING) {
                return;
            }
        }
        if !connman.sleep(MANUAL_RETRY_INTERVAL) {
            return;
        }
    }
}

pub(crate) fn run_added(connman: Arc<Connman>) {
    log::debug!("added node thread started");
    loop {
        let mut tried = false;
        for info in connman.get_added_node_info() {
            if info.connected || !connman.network_active() {
                continue;
            }
            if connman.peers().count_type(ConnectionType::Manual) >= connman.config().max_added {
                break;
            }
            tried = true;
            if let Err(e) = connman.connect_node(&info.node, ConnectionType::Manual) {
                log::debug!("connection to added node {} failed: {}", info.node, e);
            }
            if !connman.sleep(MANUAL_ATTEMPT_SPACING) {
                return;
            }
        }
        let wait = if tried {
            MANUAL_RETRY_INTERVAL
        } else {
            ADDED_IDLE_INTERVAL
        };
        if !connman.sleep(wait) {
            log::debug!("added node thread exit");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addrman::AddrManager;
    use crate::net::banman::{BanReason, MemoryBanStorage};
    use crate::net::config::{NetConfig, Network};
    use crate::net::interfaces::AddressManager;
    use crate::net::netaddr::SubNet;
    use crate::node::ConnectionManager;
    use crate::protocol::address::NetAddr;
    use crate::protocol::services::ServiceFlags;

    fn manager(addrman: Arc<AddrManager>) -> ConnectionManager {
        let mut config = NetConfig::for_network(Network::Regtest);
        config.dns_seed = false;
        ConnectionManager::builder(config)
            .ban_storage(Box::new(MemoryBanStorage::new()))
            .address_manager(addrman)
            .build()
            .unwrap()
    }

    #[test]
    fn test_select_candidate_empty() {
        let cm = manager(Arc::new(AddrManager::new()));
        assert!(select_candidate(&cm, false).is_none());
    }

    #[test]
    fn test_select_candidate_skips_banned() {
        let addrman = Arc::new(AddrManager::new());
        let addr: SocketAddr = "8.8.8.8:18444".parse().unwrap();
        addrman.add(&[NetAddr::new(addr, ServiceFlags::NODE_NETWORK)], None);
        let cm = manager(addrman);

        assert_eq!(select_candidate(&cm, false), Some(addr));
        cm.ban(SubNet::single(addr.ip()), BanReason::ManuallyAdded, None, false)
            .unwrap();
        assert!(select_candidate(&cm, false).is_none());
    }

    #[test]
    fn test_select_candidate_skips_used_netgroup() {
        let addrman = Arc::new(AddrManager::new());
        let addr: SocketAddr = "8.8.8.8:18444".parse().unwrap();
        addrman.add(&[NetAddr::new(addr, ServiceFlags::NODE_NETWORK)], None);
        let cm = manager(addrman);

        // An inbound peer in the same /16 doesn't count
        cm.admit_inbound(None, "8.8.4.4:5000".parse().unwrap()).unwrap();
        assert_eq!(select_candidate(&cm, false), Some(addr));

        // An outbound one does
        let outbound: SocketAddr = "8.8.4.4:18444".parse().unwrap();
        let peer = cm.add_peer(
            None,
            outbound,
            outbound.to_string(),
            ConnectionType::Outbound,
            false,
        );
        assert!(!peer.is_inbound());
        assert!(select_candidate(&cm, false).is_none());

        // Freed again once that peer is gone
        peer.mark_disconnect("test");
        cm.release_disconnected(None);
        assert_eq!(select_candidate(&cm, false), Some(addr));
    }

    #[test]
    fn test_feeler_delay_bounds() {
        for _ in 0..100 {
            let d = feeler_delay();
            assert!(d >= FEELER_INTERVAL / 2);
            assert!(d < FEELER_INTERVAL * 3 / 2);
        }
    }
}
