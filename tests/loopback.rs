//! Two connection managers talking over loopback sockets

use mini_p2p::net::{
    AddrManager, ConnectionType, EventReceiver, MemoryBanStorage, NetConfig, NetError, NetEvent,
    Network, PeerState, SubNet,
};
use mini_p2p::node::{ConnectionDirection, ConnectionManager};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn config(dir: &tempfile::TempDir) -> NetConfig {
    let mut config = NetConfig::for_network(Network::Regtest);
    config.bind = vec![SocketAddr::new(LOCALHOST, 0)];
    config.max_outbound = 0;
    config.max_feeler = 0;
    config.dns_seed = false;
    config.data_dir = dir.path().to_path_buf();
    config
}

fn manager(config: NetConfig) -> ConnectionManager {
    ConnectionManager::builder(config)
        .ban_storage(Box::new(MemoryBanStorage::new()))
        .address_manager(Arc::new(AddrManager::new()))
        .build()
        .unwrap()
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}

fn established(cm: &ConnectionManager) -> usize {
    cm.get_node_stats()
        .iter()
        .filter(|s| s.state == PeerState::Established)
        .count()
}

fn drain(events: &mut EventReceiver) -> Vec<NetEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[test]
fn test_handshake_ping_disconnect() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = manager(config(&dir_a));
    let mut b_config = config(&dir_b);
    b_config.listen = false;
    let b = manager(b_config);

    let mut a_events = a.take_events().unwrap();
    a.start().unwrap();
    b.start().unwrap();
    let target = a.local_addrs()[0];
    assert_ne!(target.port(), 0);
    assert!(b.local_addrs().is_empty());

    let peer = b
        .connect_node(&target.to_string(), ConnectionType::Manual)
        .unwrap();
    wait_for("handshake", || established(&a) == 1 && established(&b) == 1);
    assert_eq!(a.get_node_count(ConnectionDirection::Inbound), 1);
    assert_eq!(b.get_node_count(ConnectionDirection::Outbound), 1);

    // Both sides ping as soon as the handshake completes
    wait_for("ping round trip", || {
        a.get_node_stats()[0].min_ping_ms.is_some() && peer.min_ping().is_some()
    });

    let stats = &a.get_node_stats()[0];
    assert!(stats.bytes_recv_per_cmd.contains_key("version"));
    assert!(stats.bytes_recv_per_cmd.contains_key("verack"));
    assert!(stats.bytes_recv_per_cmd.contains_key("pong"));
    assert!(a.get_totals().total_bytes_recv > 0);
    assert!(b.get_totals().total_bytes_sent > 0);

    b.disconnect_node(peer.id).unwrap();
    wait_for("disconnect", || {
        a.get_node_count(ConnectionDirection::All) == 0
            && b.get_node_count(ConnectionDirection::All) == 0
    });

    let inbound_id = match drain(&mut a_events)
        .into_iter()
        .find(|e| matches!(e, NetEvent::HandshakeComplete { .. }))
    {
        Some(NetEvent::HandshakeComplete { id, .. }) => id,
        other => panic!("no handshake event: {:?}", other),
    };
    wait_for("disconnect event", || {
        drain(&mut a_events)
            .iter()
            .any(|e| matches!(e, NetEvent::PeerDisconnected { id, .. } if *id == inbound_id))
    });

    a.stop();
    b.stop();
}

#[test]
fn test_banned_peer_dropped() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = manager(config(&dir_a));
    let mut b_config = config(&dir_b);
    b_config.listen = false;
    let b = manager(b_config);
    a.start().unwrap();
    b.start().unwrap();

    a.ban(
        SubNet::single(LOCALHOST),
        mini_p2p::net::BanReason::ManuallyAdded,
        Some(3600),
        false,
    )
    .unwrap();
    let target = a.local_addrs()[0];
    // The TCP connect itself succeeds; the node drops it right away
    let _ = b.connect_node(&target.to_string(), ConnectionType::Manual);
    wait_for("rejected connection closed", || {
        b.get_node_count(ConnectionDirection::All) == 0
    });
    assert_eq!(a.get_node_count(ConnectionDirection::All), 0);
}

#[test]
fn test_self_connection_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(config(&dir));
    a.start().unwrap();
    let target = a.local_addrs()[0];

    a.connect_node(&target.to_string(), ConnectionType::Manual)
        .unwrap();
    wait_for("self connection dropped", || {
        a.get_node_count(ConnectionDirection::All) == 0
    });
    assert!(!a.is_banned(&LOCALHOST));
}

#[test]
fn test_oversized_message_bans_sender() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(config(&dir));
    a.start().unwrap();
    let target = a.local_addrs()[0];

    let mut stream = std::net::TcpStream::connect(target).unwrap();
    let mut header = Vec::new();
    header.extend_from_slice(&Network::Regtest.magic());
    let mut command = [0u8; 12];
    command[..2].copy_from_slice(b"tx");
    header.extend_from_slice(&command);
    header.extend_from_slice(&(64u32 * 1024 * 1024).to_le_bytes());
    header.extend_from_slice(&[0u8; 4]);
    stream.write_all(&header).unwrap();

    wait_for("sender banned", || a.is_banned(&LOCALHOST));
    wait_for("sender dropped", || {
        a.get_node_count(ConnectionDirection::All) == 0
    });
}

#[test]
fn test_bad_magic_disconnects_without_ban() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(config(&dir));
    a.start().unwrap();
    let target = a.local_addrs()[0];

    let mut stream = std::net::TcpStream::connect(target).unwrap();
    wait_for("connection admitted", || {
        a.get_node_count(ConnectionDirection::Inbound) == 1
    });
    let mut header = vec![0xde, 0xad, 0xbe, 0xef];
    header.extend_from_slice(b"ping\0\0\0\0\0\0\0\0");
    header.extend_from_slice(&8u32.to_le_bytes());
    header.extend_from_slice(&[0u8; 4]);
    header.extend_from_slice(&[0u8; 8]);
    stream.write_all(&header).unwrap();

    wait_for("bad magic dropped", || {
        a.get_node_count(ConnectionDirection::All) == 0
    });
    assert!(!a.is_banned(&LOCALHOST));
}

#[test]
fn test_start_twice_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let a = manager(config(&dir));
    a.start().unwrap();
    assert!(matches!(a.start(), Err(NetError::AlreadyRunning)));
    a.stop();
    assert!(!a.is_running());
    assert!(matches!(a.start(), Err(NetError::NotRunning)));
}

#[test]
fn test_bind_conflict_reported() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = manager(config(&dir_a));
    a.start().unwrap();

    let mut b_config = config(&dir_b);
    b_config.bind = a.local_addrs();
    let b = manager(b_config);
    assert!(matches!(b.start(), Err(NetError::Bind { .. })));
    assert!(!b.is_running());
}
