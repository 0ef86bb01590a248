//! Name resolution and seed bootstrap

use crate::net::error::{NetError, NetResult};
use crate::node::connman::{ConnectionDirection, Connman};
use crate::protocol::address::NetAddr;
use crate::protocol::services::ServiceFlags;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Wait before querying seeds when the address table already has entries
const SEED_DELAY: Duration = Duration::from_secs(11);

/// Outbound connections that make seeding unnecessary
const ENOUGH_OUTBOUND: usize = 2;

/// Resolve `host[:port]`, using `default_port` when no port is given
pub fn resolve(name: &str, default_port: u16) -> NetResult<Vec<SocketAddr>> {
    if let Ok(addr) = name.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, default_port)]);
    }

    let has_port = name
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    let addrs: Vec<SocketAddr> = if has_port {
        name.to_socket_addrs()
    } else {
        (name, default_port).to_socket_addrs()
    }
    .map_err(|e| NetError::InvalidAddress(format!("{}: {}", name, e)))?
    .collect();

    if addrs.is_empty() {
        return Err(NetError::InvalidAddress(name.to_string()));
    }
    Ok(addrs)
}

/// One-shot seed query
pub(crate) fn run(connman: Arc<Connman>) {
    if connman.addrman().size() > 0 {
        if !connman.sleep(SEED_DELAY) {
            return;
        }
        if connman.get_node_count(ConnectionDirection::Outbound) >= ENOUGH_OUTBOUND {
            log::info!("P2P peers available. Skipped DNS seeding.");
            return;
        }
    }

    log::info!("Loading addresses from DNS seeds");
    let port = connman.config().default_port();
    let mut found = 0;
    for seed in &connman.config().dns_seeds {
        if connman.is_interrupted() {
            return;
        }
        match resolve(seed, port) {
            Ok(addrs) => {
                let addrs: Vec<NetAddr> = addrs
                    .into_iter()
                    .map(|a| NetAddr::new(a, ServiceFlags::NODE_NETWORK))
                    .collect();
                found += connman.addrman().add(&addrs, None);
            }
            Err(e) => log::debug!("seed {} failed: {}", seed, e),
        }
    }
    log::info!("{} addresses found from DNS seeds", found);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal() {
        let addrs = resolve("127.0.0.1:9000", 8333).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse().unwrap()]);

        let addrs = resolve("127.0.0.1", 8333).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8333".parse().unwrap()]);

        let addrs = resolve("::1", 18444).unwrap();
        assert_eq!(addrs, vec!["[::1]:18444".parse().unwrap()]);
    }

    #[test]
    fn test_resolve_localhost() {
        let addrs = resolve("localhost", 8333).unwrap();
        assert!(addrs.iter().all(|a| a.port() == 8333));
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }

    #[test]
    fn test_resolve_garbage() {
        assert!(resolve("not a host name", 8333).is_err());
    }
}
