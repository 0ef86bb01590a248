//! Inbound eviction
//!
//! When a new inbound connection arrives and every inbound slot is taken we
//! may drop one existing inbound peer to make room. Peers with properties an
//! attacker would find hard to fake are protected first:
//!
//! 1. the 4 peers with the highest keyed netgroup values
//! 2. the 8 peers with the lowest minimum ping
//! 3. the 4 peers that most recently sent us a new transaction
//! 4. the 4 peers that most recently sent us a new block
//! 5. the older half of whoever is left
//!
//! From the survivors, the netgroup with the most connections loses its most
//! recently connected member.

use crate::net::peer::PeerId;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const PROTECT_BY_NETGROUP: usize = 4;
const PROTECT_BY_PING: usize = 8;
const PROTECT_BY_TX: usize = 4;
const PROTECT_BY_BLOCK: usize = 4;

/// Snapshot of one inbound peer, taken only for an eviction decision
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: PeerId,
    pub connected: Instant,
    /// Lowest observed ping; `None` if never measured
    pub min_ping: Option<Duration>,
    /// When the peer last sent a block we didn't have
    pub last_block_time: Option<Instant>,
    /// When the peer last sent a transaction we didn't have
    pub last_tx_time: Option<Instant>,
    pub relevant_services: bool,
    pub relay_txes: bool,
    pub bloom_filter: bool,
    pub addr: SocketAddr,
    pub keyed_netgroup: u64,
}

fn compare_netgroup_keyed(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.keyed_netgroup.cmp(&b.keyed_netgroup)
}

/// Descending "badness": no ping sorts first, then highest ping
fn compare_min_ping(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    let a_ping = a.min_ping.unwrap_or(Duration::MAX);
    let b_ping = b.min_ping.unwrap_or(Duration::MAX);
    b_ping.cmp(&a_ping)
}

/// Most recently connected first
fn compare_connect_time(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    b.connected.cmp(&a.connected)
}

/// Oldest tx relay first; among peers that never relayed one, peers that
/// don't want transactions first
fn compare_tx_time(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    if a.last_tx_time != b.last_tx_time {
        return a.last_tx_time.cmp(&b.last_tx_time);
    }
    if a.relay_txes != b.relay_txes {
        return a.relay_txes.cmp(&b.relay_txes);
    }
    if a.bloom_filter != b.bloom_filter {
        return b.bloom_filter.cmp(&a.bloom_filter);
    }
    compare_connect_time(a, b)
}

/// Oldest block relay first; among ties, peers without relevant services first
fn compare_block_time(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    if a.last_block_time != b.last_block_time {
        return a.last_block_time.cmp(&b.last_block_time);
    }
    if a.relevant_services != b.relevant_services {
        return a.relevant_services.cmp(&b.relevant_services);
    }
    compare_connect_time(a, b)
}

/// Sort `candidates` so the protected peers end up at the back, then drop
/// the last `k`
fn erase_last_k(
    candidates: &mut Vec<EvictionCandidate>,
    cmp: fn(&EvictionCandidate, &EvictionCandidate) -> Ordering,
    k: usize,
) {
    candidates.sort_by(cmp);
    let keep = candidates.len().saturating_sub(k);
    candidates.truncate(keep);
}

/// Remove every protected peer from `candidates`, leaving only those that may
/// be evicted
pub fn protect_candidates(candidates: &mut Vec<EvictionCandidate>) {
    // Deterministic netgroups an attacker can't cheaply fill
    erase_last_k(candidates, compare_netgroup_keyed, PROTECT_BY_NETGROUP);
    // Lowest latency
    erase_last_k(candidates, compare_min_ping, PROTECT_BY_PING);
    // Useful transaction relayers
    erase_last_k(candidates, compare_tx_time, PROTECT_BY_TX);
    // Useful block relayers
    erase_last_k(candidates, compare_block_time, PROTECT_BY_BLOCK);
    // Long-lived connections
    let half = candidates.len() / 2;
    erase_last_k(candidates, compare_connect_time, half);
}

/// Choose which peer to evict from a set of evictable inbound peers.
///
/// Callers pass only inbound, non-whitelisted peers. Returns `None` when
/// every candidate is protected.
pub fn select_node_to_evict(mut candidates: Vec<EvictionCandidate>) -> Option<PeerId> {
    protect_candidates(&mut candidates);
    if candidates.is_empty() {
        return None;
    }

    // Group survivors by netgroup; pick the largest group, breaking ties in
    // favour of the group whose youngest member connected earliest
    let mut groups: HashMap<u64, Vec<&EvictionCandidate>> = HashMap::new();
    for candidate in &candidates {
        groups
            .entry(candidate.keyed_netgroup)
            .or_default()
            .push(candidate);
    }

    let youngest = |group: &Vec<&EvictionCandidate>| -> Option<Instant> {
        group.iter().map(|c| c.connected).max()
    };

    let chosen = groups.values().max_by(|a, b| {
        a.len()
            .cmp(&b.len())
            .then_with(|| youngest(b).cmp(&youngest(a)))
    })?;

    chosen
        .iter()
        .max_by(|a, b| a.connected.cmp(&b.connected).then(a.id.cmp(&b.id)))
        .map(|c| c.id)
}
