//! Socket readiness loop
//!
//! One thread owns the poller. Each pass it releases disconnected peers,
//! registers new sockets, accepts inbound connections and moves bytes
//! between sockets and peer queues. Sockets are edge-triggered so readiness
//! is remembered per peer until a read or write would block.

use crate::net::peer::{Peer, PeerId, TimeoutLimits};
use crate::node::connman::{Connman, PEER_TOKEN_BASE};
use mio::net::TcpListener;
use mio::{Events, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Poll timeout when no peer has pending work
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Bytes read from a socket per call
const RECV_CHUNK: usize = 64 * 1024;

/// Reads per peer per pass, so one busy peer can't starve the others
const MAX_READS_PER_PASS: usize = 16;

/// Interval for bandwidth sampling and timeout checks
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Remembered edge-triggered readiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Readiness {
    readable: bool,
    writable: bool,
}

pub(crate) fn peer_token(id: PeerId) -> Token {
    Token(PEER_TOKEN_BASE + id.0 as usize)
}

fn token_peer(token: Token) -> Option<PeerId> {
    token
        .0
        .checked_sub(PEER_TOKEN_BASE)
        .map(|id| PeerId(id as u64))
}

/// Whether a peer can make progress without waiting for the poller
fn has_work(peer: &Peer, ready: Readiness) -> bool {
    if peer.is_disconnecting() {
        return false;
    }
    if peer.has_pending_send() {
        ready.writable
    } else {
        ready.readable && !peer.is_recv_paused()
    }
}

pub(crate) fn run(connman: Arc<Connman>, mut poll: Poll, mut listeners: Vec<TcpListener>) {
    log::debug!("socket thread started");
    let mut events = Events::with_capacity(1024);
    let mut readiness: HashMap<PeerId, Readiness> = HashMap::new();
    let mut buf = vec![0u8; RECV_CHUNK];
    let mut last_housekeeping = Instant::now();

    while !connman.is_interrupted() {
        for id in connman.release_disconnected(Some(poll.registry())) {
            readiness.remove(&id);
        }

        let peers = connman.peers().snapshot();
        for peer in &peers {
            match peer.register(poll.registry(), peer_token(peer.id)) {
                // Events that fired before registration are lost, so assume both
                Ok(true) => {
                    readiness.insert(
                        peer.id,
                        Readiness {
                            readable: true,
                            writable: true,
                        },
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("{} {}: unable to register socket: {}", peer.id, peer.addr, e);
                    peer.mark_disconnect("register failed");
                }
            }
        }

        let busy = peers.iter().any(|p| {
            readiness
                .get(&p.id)
                .map(|r| has_work(p, *r))
                .unwrap_or(false)
        });
        let timeout = if busy { Duration::ZERO } else { POLL_TIMEOUT };
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("socket poll failed: {}", e);
                connman.sleep(POLL_TIMEOUT);
            }
            continue;
        }

        for event in events.iter() {
            let token = event.token();
            if let Some(listener) = listeners.get_mut(token.0) {
                accept_connections(&connman, listener);
                continue;
            }
            let Some(id) = token_peer(token) else {
                continue;
            };
            let entry = readiness.entry(id).or_default();
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                entry.readable = true;
            }
            if event.is_writable() || event.is_write_closed() {
                entry.writable = true;
            }
        }

        for peer in &peers {
            if peer.is_disconnecting() {
                continue;
            }
            if let Some(ready) = readiness.get_mut(&peer.id) {
                service_peer(&connman, peer, ready, &mut buf);
            }
        }

        if last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
            housekeeping(&connman, &peers);
            last_housekeeping = Instant::now();
        }
    }
    log::debug!("socket thread exit");
}

fn accept_connections(connman: &Connman, listener: &mut TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("unable to set TCP_NODELAY for {}: {}", addr, e);
                }
                connman.admit_inbound(Some(stream), addr);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("socket error accepting new connection: {}", e);
                break;
            }
        }
    }
}

/// Move bytes for one peer. A peer with queued sends only writes this pass.
fn service_peer(connman: &Connman, peer: &Peer, ready: &mut Readiness, buf: &mut [u8]) {
    if peer.has_pending_send() {
        if ready.writable {
            if let Some(progress) = connman.flush_peer(peer) {
                if progress.would_block {
                    ready.writable = false;
                }
            }
        }
        return;
    }
    if !ready.readable || peer.is_recv_paused() {
        return;
    }

    let flood_size = connman.config().receive_flood_size;
    let mut got_messages = false;
    for _ in 0..MAX_READS_PER_PASS {
        match peer.recv_from_socket(buf) {
            Ok(0) => {
                log::debug!("{} {}: socket closed by peer", peer.id, peer.addr);
                peer.mark_disconnect("closed by peer");
                break;
            }
            Ok(n) => {
                connman.counters().record_recv(n as u64);
                match peer.receive_bytes(&buf[..n], flood_size) {
                    Ok(progress) => got_messages |= progress.messages > 0,
                    Err(e) => {
                        log::warn!("{} {}: {}", peer.id, peer.addr, e);
                        if e.is_ban_worthy() {
                            peer.set_should_ban();
                        }
                        peer.mark_disconnect("framing error");
                        break;
                    }
                }
                if peer.is_recv_paused() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                ready.readable = false;
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("{} {}: socket recv error: {}", peer.id, peer.addr, e);
                peer.mark_disconnect("recv error");
                break;
            }
        }
    }
    if got_messages {
        connman.wake_handler();
    }
}

fn housekeeping(connman: &Connman, peers: &[Arc<Peer>]) {
    let config = connman.config();
    let limits = TimeoutLimits {
        idle: config.idle_timeout(),
        ping: config.ping_timeout(),
        handshake: config.handshake_timeout(),
    };
    let now = Instant::now();
    let now_secs = chrono::Utc::now().timestamp();
    for peer in peers {
        if peer.is_disconnecting() {
            continue;
        }
        peer.sample_bandwidth(now);
        if let Some(reason) = peer.check_timeouts(now_secs, now, &limits) {
            log::info!("{} {}: {}", peer.id, peer.addr, reason);
            peer.mark_disconnect("timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_mapping() {
        let id = PeerId(42);
        assert_eq!(token_peer(peer_token(id)), Some(id));
        assert_eq!(token_peer(Token(3)), None);
        assert_eq!(peer_token(PeerId(0)), Token(PEER_TOKEN_BASE));
    }

    #[test]
    fn test_readiness_default_idle() {
        let ready = Readiness::default();
        assert!(!ready.readable);
        assert!(!ready.writable);
    }
}
