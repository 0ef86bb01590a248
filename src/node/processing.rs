//! Built-in message processing
//!
//! [`NetProcessor`] is the default [`MessageProcessor`]. It drives the
//! version handshake and the network-level messages:
//!
//! - version / verack / protoconf and self-connection detection
//! - ping / pong, sendheaders, sendcmpct, feefilter
//! - filterload / filteradd / filterclear
//! - addr / getaddr through the address manager
//! - inv / getdata / notfound through ask-for tracking and the validator
//! - tx and block validation, with blocks validated on the task pool
//!
//! Everything chain-specific is delegated to the [`Validator`].

use crate::crypto::double_sha256;
use crate::net::bloom::BloomFilter;
use crate::net::events::NetEvent;
use crate::net::interfaces::{MessageProcessor, ValidationOutcome};
use crate::net::interrupt::Interrupt;
use crate::net::peer::{ConnectionType, Peer, PeerId, INVENTORY_BROADCAST_MAX};
use crate::net::registry::PeerRef;
use crate::node::connman::Connman;
use crate::protocol::address::{decode_addr_list, encode_addr_list, NetAddr, MAX_ADDR_TO_SEND};
use crate::protocol::command;
use crate::protocol::inventory::{
    decode_inv_list, encode_inv_list, max_inv_entries, Hash256, InvItem, InvKind,
};
use crate::protocol::message::OutboundMessage;
use crate::protocol::payload::{
    decode_fee_filter, decode_filter_add, decode_nonce, encode_nonce, FilterLoad, Protoconf,
    SendCmpct, VersionMessage, FEEFILTER_VERSION, LEGACY_MAX_PROTOCOL_PAYLOAD_LENGTH,
    MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION, PROTOCONF_VERSION, SENDHEADERS_VERSION,
};
use crate::protocol::serialize::DecodeError;
use crate::protocol::services::ServiceFlags;
use crate::task::{BudgetPool, TimedCancellationSource};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Services we advertise
pub const LOCAL_SERVICES: ServiceFlags = ServiceFlags::NODE_NETWORK.union(ServiceFlags::NODE_BLOOM);

/// Largest element a filteradd may carry
pub const MAX_FILTER_ADD_SIZE: usize = 520;

/// Total money supply in satoshis; larger fee filters are ignored
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Size of a serialized block header
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Wall-clock budget for validating one block
pub const BLOCK_VALIDATION_BUDGET: Duration = Duration::from_secs(10);

/// Below this many known addresses we ask new outbound peers for more
const GETADDR_THRESHOLD: usize = 1000;

/// Ask-for requests sent per pass
const MAX_GETDATA_PER_PASS: usize = 1000;

// =============================================================================
// Processor
// =============================================================================

/// Default network-level message processor
pub struct NetProcessor {
    /// getdata requests not answered yet, per peer
    deferred: Mutex<HashMap<PeerId, VecDeque<InvItem>>>,
    /// Unused block validation time carried between blocks
    budget: Arc<BudgetPool>,
    block_budget: Duration,
}

impl NetProcessor {
    pub fn new() -> Self {
        Self::with_block_budget(BLOCK_VALIDATION_BUDGET)
    }

    pub fn with_block_budget(block_budget: Duration) -> Self {
        Self {
            deferred: Mutex::new(HashMap::new()),
            budget: BudgetPool::new(),
            block_budget,
        }
    }

    fn has_deferred(&self, peer: PeerId) -> bool {
        self.deferred
            .lock()
            .get(&peer)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    fn push_version(&self, connman: &Connman, peer: &Peer) {
        let msg = VersionMessage {
            version: PROTOCOL_VERSION,
            services: LOCAL_SERVICES,
            timestamp: chrono::Utc::now().timestamp(),
            addr_recv: NetAddr::new(peer.addr, peer.services()),
            addr_from: NetAddr::new(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                LOCAL_SERVICES,
            ),
            nonce: peer.local_nonce,
            user_agent: connman.config().user_agent.clone(),
            start_height: connman.validator().best_height(),
            relay: true,
        };
        peer.mark_version_sent();
        connman.push_message(peer, OutboundMessage::new(command::VERSION, msg.encode()));
        log::debug!(
            "send version message: version {}, blocks={}, peer={}",
            PROTOCOL_VERSION,
            msg.start_height,
            peer.id
        );
    }

    fn dispatch(&self, connman: &Connman, peer: &PeerRef, cmd: &str, payload: Bytes) {
        if cmd == command::VERSION {
            self.on_version(connman, peer, &payload);
            return;
        }
        if !peer.version_received() {
            connman.misbehaving(peer, 1, "non-version message before version handshake");
            return;
        }
        if cmd == command::VERACK {
            self.on_verack(connman, peer);
            return;
        }
        if !peer.verack_received() && cmd != command::PROTOCONF {
            log::debug!("unsupported message \"{}\" prior to verack from peer={}", cmd, peer.id);
            return;
        }

        match cmd {
            command::PROTOCONF => self.on_protoconf(connman, peer, &payload),
            command::PING => {
                if let Ok(nonce) = decode_nonce(&payload) {
                    connman.push_message(peer, OutboundMessage::new(command::PONG, encode_nonce(nonce)));
                }
            }
            command::PONG => match decode_nonce(&payload) {
                Ok(nonce) => match peer.receive_pong(nonce, Instant::now()) {
                    Some(rtt) => log::trace!("pong from peer={} in {:?}", peer.id, rtt),
                    None => log::debug!("pong peer={}: nonce mismatch", peer.id),
                },
                Err(_) => log::debug!("pong peer={}: short payload", peer.id),
            },
            command::SENDHEADERS => peer.set_prefer_headers(true),
            command::SENDCMPCT => {
                if let Ok(cmpct) = SendCmpct::decode(&payload) {
                    if cmpct.version == 1 {
                        peer.set_send_cmpct(cmpct.announce);
                    }
                }
            }
            command::FEEFILTER => {
                if let Ok(fee) = decode_fee_filter(&payload) {
                    if (0..=MAX_MONEY).contains(&fee) {
                        peer.set_fee_filter(fee);
                        log::debug!("received: feefilter of {} from peer={}", fee, peer.id);
                    }
                }
            }
            command::FILTERLOAD => match FilterLoad::decode(&payload) {
                Ok(load) => {
                    let filter = BloomFilter::from_filterload(&load);
                    if filter.is_within_size_constraints() {
                        peer.load_bloom_filter(filter);
                    } else {
                        connman.misbehaving(peer, 100, "oversized bloom filter");
                    }
                }
                Err(_) => connman.misbehaving(peer, 100, "malformed filterload"),
            },
            command::FILTERADD => match decode_filter_add(&payload) {
                Ok(data) if data.len() > MAX_FILTER_ADD_SIZE => {
                    connman.misbehaving(peer, 100, "oversized filteradd element")
                }
                Ok(data) => {
                    if !peer.add_to_bloom_filter(&data) {
                        connman.misbehaving(peer, 100, "filteradd without filter");
                    }
                }
                Err(_) => connman.misbehaving(peer, 100, "malformed filteradd"),
            },
            command::FILTERCLEAR => peer.clear_bloom_filter(),
            command::GETADDR => self.on_getaddr(connman, peer),
            command::ADDR => self.on_addr(connman, peer, payload),
            command::INV => self.on_inv(connman, peer, payload),
            command::GETDATA => self.on_getdata(connman, peer, payload),
            command::NOTFOUND => {
                if let Ok(items) = decode_inv_list(&mut payload.clone()) {
                    for item in items {
                        peer.inventory_not_found(&item.hash);
                    }
                }
            }
            command::TX => self.on_tx(connman, peer, payload),
            command::BLOCK => self.on_block(connman, peer, payload),
            other if command::is_known(other) => {
                log::debug!("ignoring \"{}\" from peer={}", other, peer.id)
            }
            other => log::debug!("unknown command \"{}\" from peer={}", other, peer.id),
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    fn on_version(&self, connman: &Connman, peer: &PeerRef, payload: &[u8]) {
        if peer.version_received() {
            connman.misbehaving(peer, 1, "multiple version messages");
            return;
        }
        let version = match VersionMessage::decode(payload) {
            Ok(version) => version,
            Err(e) => {
                connman.misbehaving(peer, 1, &format!("invalid version message: {}", e));
                peer.mark_disconnect("invalid version");
                return;
            }
        };
        if version.version < MIN_PEER_PROTO_VERSION {
            log::info!(
                "peer={} using obsolete version {}; disconnecting",
                peer.id,
                version.version
            );
            peer.mark_disconnect("obsolete version");
            return;
        }
        if peer.is_inbound() && connman.peers().is_local_nonce(version.nonce) {
            log::info!("connected to self at {}, disconnecting", peer.addr);
            peer.mark_disconnect("self connection");
            return;
        }

        peer.set_version(
            version.version,
            version.services,
            version.start_height,
            version.user_agent.clone(),
        );
        peer.set_relay_txes(version.relay);
        log::info!(
            "receive version message: {}: version {}, blocks={}, peer={}",
            version.user_agent,
            version.version,
            version.start_height,
            peer.id
        );

        if peer.is_inbound() {
            self.push_version(connman, peer);
        }
        connman.push_message(peer, OutboundMessage::empty(command::VERACK));
        peer.mark_verack_sent();

        if peer.conn_type == ConnectionType::Feeler {
            log::debug!("feeler connection completed peer={}", peer.id);
            peer.mark_disconnect("feeler");
        }
    }

    fn on_verack(&self, connman: &Connman, peer: &PeerRef) {
        if peer.verack_received() {
            log::debug!("ignoring duplicate verack from peer={}", peer.id);
            return;
        }
        peer.mark_verack_received();
        if !peer.is_established() {
            return;
        }

        connman.publish(NetEvent::HandshakeComplete {
            id: peer.id,
            version: peer.version(),
            services: peer.services(),
            start_height: peer.start_height(),
            user_agent: peer.subver(),
        });
        if !peer.is_inbound() {
            connman.addrman().good(&peer.addr);
            if connman.addrman().size() < GETADDR_THRESHOLD {
                connman.push_message(peer, OutboundMessage::empty(command::GETADDR));
            }
        }
        if peer.version() >= PROTOCONF_VERSION {
            let max = connman.config().max_recv_payload_length as u32;
            connman.push_message(
                peer,
                OutboundMessage::new(command::PROTOCONF, Protoconf::new(max).encode()),
            );
        }
        if peer.version() >= SENDHEADERS_VERSION {
            connman.push_message(peer, OutboundMessage::empty(command::SENDHEADERS));
        }
        if peer.version() >= FEEFILTER_VERSION {
            log::trace!("peer={} supports feefilter", peer.id);
        }
    }

    fn on_protoconf(&self, connman: &Connman, peer: &Peer, payload: &[u8]) {
        match Protoconf::decode(payload) {
            Ok(conf) => {
                let max = conf
                    .max_recv_payload_length
                    .max(LEGACY_MAX_PROTOCOL_PAYLOAD_LENGTH);
                peer.set_max_send_payload(u64::from(max));
                log::debug!("protoconf from peer={}: max payload {}", peer.id, max);
            }
            Err(e) => connman.misbehaving(peer, 1, &format!("invalid protoconf: {}", e)),
        }
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    fn on_getaddr(&self, connman: &Connman, peer: &Peer) {
        if !peer.is_inbound() {
            log::debug!("ignoring getaddr from outbound peer={}", peer.id);
            return;
        }
        let addrs = connman.addrman().get_addr(MAX_ADDR_TO_SEND);
        let mut buf = BytesMut::new();
        encode_addr_list(&addrs, &mut buf);
        connman.push_message(peer, OutboundMessage::new(command::ADDR, buf.freeze()));
    }

    fn on_addr(&self, connman: &Connman, peer: &Peer, mut payload: Bytes) {
        match decode_addr_list(&mut payload) {
            Ok(addrs) => {
                let added = connman.addrman().add(&addrs, Some(peer.addr.ip()));
                log::debug!(
                    "received {} addresses ({} new) from peer={}",
                    addrs.len(),
                    added,
                    peer.id
                );
            }
            Err(DecodeError::SizeTooLarge(n)) => {
                connman.misbehaving(peer, 20, &format!("addr message size = {}", n))
            }
            Err(e) => connman.misbehaving(peer, 1, &format!("malformed addr: {}", e)),
        }
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    fn on_inv(&self, connman: &Connman, peer: &Peer, mut payload: Bytes) {
        let items = match decode_inv_list(&mut payload) {
            Ok(items) => items,
            Err(DecodeError::SizeTooLarge(n)) => {
                connman.misbehaving(peer, 20, &format!("inv message size = {}", n));
                return;
            }
            Err(e) => {
                connman.misbehaving(peer, 1, &format!("malformed inv: {}", e));
                return;
            }
        };
        let now = Instant::now();
        for item in items {
            peer.add_known_inventory(&item.hash);
            if !matches!(item.kind, InvKind::Tx | InvKind::Block) {
                continue;
            }
            if connman.validator().already_have(&item) {
                continue;
            }
            log::trace!("got inv: {:?} {} new peer={}", item.kind, item.hash, peer.id);
            peer.ask_for(item, now);
        }
    }

    fn on_getdata(&self, connman: &Connman, peer: &Peer, mut payload: Bytes) {
        let items = match decode_inv_list(&mut payload) {
            Ok(items) => items,
            Err(DecodeError::SizeTooLarge(n)) => {
                connman.misbehaving(peer, 20, &format!("getdata message size = {}", n));
                return;
            }
            Err(e) => {
                connman.misbehaving(peer, 1, &format!("malformed getdata: {}", e));
                return;
            }
        };
        self.deferred
            .lock()
            .entry(peer.id)
            .or_default()
            .extend(items);
        self.serve_deferred(connman, peer);
    }

    /// Answer queued getdata requests until the peer's send queue fills or
    /// block responses are paused globally
    fn serve_deferred(&self, connman: &Connman, peer: &Peer) {
        let validator = connman.validator();
        let mut responses = Vec::new();
        let mut not_found = Vec::new();
        {
            let mut deferred = self.deferred.lock();
            let Some(queue) = deferred.get_mut(&peer.id) else {
                return;
            };
            while let Some(item) = queue.front().copied() {
                if peer.is_send_paused() || peer.is_disconnecting() {
                    break;
                }
                let is_block = item.kind.is_block();
                if is_block && connman.block_responses_paused() {
                    log::debug!("block responses paused, deferring getdata from peer={}", peer.id);
                    break;
                }
                queue.pop_front();

                if is_block
                    && !peer.whitelisted
                    && validator.is_historical(&item)
                    && connman.limiter().target_reached(true, Instant::now())
                {
                    log::info!(
                        "historical block serving limit reached, disconnect peer={}",
                        peer.id
                    );
                    peer.mark_disconnect("outbound target reached");
                    queue.clear();
                    break;
                }

                match (response_command(item.kind), validator.fetch_inventory(&item)) {
                    (Some(cmd), Some(data)) => responses.push(OutboundMessage::new(cmd, data)),
                    _ => not_found.push(item),
                }
                // One block per pass so the send queue drains between them
                if is_block {
                    break;
                }
            }
            if queue.is_empty() {
                deferred.remove(&peer.id);
            }
        }

        for msg in responses {
            connman.push_message(peer, msg);
        }
        if !not_found.is_empty() {
            for chunk in not_found.chunks(max_inv_entries(peer.max_send_payload()).max(1)) {
                connman.push_message(peer, inv_message(command::NOTFOUND, chunk));
            }
        }
    }

    // =========================================================================
    // Transactions and blocks
    // =========================================================================

    fn on_tx(&self, connman: &Connman, peer: &Peer, payload: Bytes) {
        let hash = Hash256(double_sha256(&payload));
        peer.add_known_inventory(&hash);
        peer.inventory_received(&hash);

        let validator = connman.validator();
        match validator.validate_transaction(peer.id, &hash, &payload) {
            ValidationOutcome::Accepted => {
                peer.mark_tx_received(Instant::now());
                let relayed = connman.relay_inventory(InvItem::tx(hash), validator.fee_rate(&hash));
                log::debug!("accepted tx {} from peer={}, relayed to {}", hash, peer.id, relayed);
            }
            ValidationOutcome::Rejected { reason, ban_score } => {
                log::debug!("tx {} from peer={} rejected: {}", hash, peer.id, reason);
                connman.misbehaving(peer, ban_score, &reason);
            }
            other => log::debug!("tx {} from peer={}: {:?}", hash, peer.id, other),
        }
    }

    fn on_block(&self, connman: &Connman, peer: &PeerRef, payload: Bytes) {
        if payload.len() < BLOCK_HEADER_SIZE {
            connman.misbehaving(peer, 100, "truncated block");
            return;
        }
        let hash = Hash256(double_sha256(&payload[..BLOCK_HEADER_SIZE]));
        peer.add_known_inventory(&hash);

        let Some(handle) = connman.handle() else {
            return;
        };
        let weak = Arc::downgrade(&handle);
        drop(handle);

        let budget = TimedCancellationSource::new(self.block_budget, Some(self.budget.clone()));
        let extra = budget.token();
        let task_peer = peer.clone();
        let spawned = connman.tasks().spawn(peer.id, Some(extra), move |token| {
            let _budget = budget;
            let Some(connman) = weak.upgrade() else {
                return;
            };
            let outcome = connman
                .validator()
                .validate_block(task_peer.id, &hash, &payload, &token);
            block_validated(&connman, &task_peer, hash, outcome);
            connman.wake_handler();
        });
        if let Err(e) = spawned {
            log::debug!("block {} from peer={} not validated: {}", hash, peer.id, e);
        }
    }
}

impl Default for NetProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn block_validated(connman: &Connman, peer: &Peer, hash: Hash256, outcome: ValidationOutcome) {
    match outcome {
        ValidationOutcome::Accepted => {
            peer.inventory_received(&hash);
            peer.mark_block_received(Instant::now());
            let relayed = connman.relay_inventory(InvItem::block(hash), None);
            log::info!("accepted block {} from peer={}, relayed to {}", hash, peer.id, relayed);
        }
        ValidationOutcome::Rejected { reason, ban_score } => {
            peer.inventory_received(&hash);
            log::info!("block {} from peer={} rejected: {}", hash, peer.id, reason);
            connman.misbehaving(peer, ban_score, &reason);
        }
        ValidationOutcome::Retry => {
            log::debug!("validation of block {} from peer={} cancelled", hash, peer.id);
        }
        other => {
            peer.inventory_received(&hash);
            log::debug!("block {} from peer={}: {:?}", hash, peer.id, other);
        }
    }
}

/// Command used to answer a getdata item
fn response_command(kind: InvKind) -> Option<&'static str> {
    match kind {
        InvKind::Tx => Some(command::TX),
        InvKind::DataRefTx => Some(command::DATAREFTX),
        InvKind::Block => Some(command::BLOCK),
        InvKind::FilteredBlock => Some(command::MERKLEBLOCK),
        InvKind::CompactBlock => Some(command::CMPCTBLOCK),
        InvKind::Error | InvKind::Unknown(_) => None,
    }
}

fn inv_message(cmd: &str, items: &[InvItem]) -> OutboundMessage {
    let mut buf = BytesMut::with_capacity(9 + items.len() * 36);
    encode_inv_list(items, &mut buf);
    OutboundMessage::new(cmd, buf.freeze())
}

impl MessageProcessor for NetProcessor {
    fn initialize_peer(&self, connman: &Connman, peer: &PeerRef) {
        if !peer.is_inbound() {
            self.push_version(connman, peer);
        }
    }

    fn process_messages(&self, connman: &Connman, peer: &PeerRef, interrupt: &Interrupt) -> bool {
        if peer.is_disconnecting() {
            return false;
        }
        if self.has_deferred(peer.id) {
            self.serve_deferred(connman, peer);
            if self.has_deferred(peer.id) {
                return false;
            }
        }
        if peer.is_send_paused() {
            return false;
        }

        let Some((msg, more)) = peer.poll_message(connman.config().receive_flood_size) else {
            return false;
        };
        if interrupt.is_set() {
            return false;
        }
        let cmd = msg.command().to_string();
        log::trace!("received: {} ({} bytes) peer={}", cmd, msg.received_size(), peer.id);
        self.dispatch(connman, peer, &cmd, msg.into_payload());

        (more || self.has_deferred(peer.id)) && !peer.is_disconnecting()
    }

    fn send_messages(&self, connman: &Connman, peer: &PeerRef) {
        if !peer.is_established() {
            return;
        }
        let now = Instant::now();

        if peer.ping_due(now, connman.config().ping_interval()) {
            let nonce = rand::random::<u64>().max(1);
            peer.start_ping(nonce, now);
            connman.push_message(peer, OutboundMessage::new(command::PING, encode_nonce(nonce)));
        }

        self.serve_deferred(connman, peer);

        let batch = max_inv_entries(peer.max_send_payload()).max(1);

        // Headers announcements go out as block inv
        let (mut items, headers) = peer.take_announcements(INVENTORY_BROADCAST_MAX);
        items.extend(headers.into_iter().map(InvItem::block));
        for chunk in items.chunks(batch) {
            connman.push_message(peer, inv_message(command::INV, chunk));
        }

        let validator = connman.validator();
        let wanted: Vec<InvItem> = peer
            .take_due_requests(now, MAX_GETDATA_PER_PASS)
            .into_iter()
            .filter(|item| {
                if validator.already_have(item) {
                    peer.inventory_received(&item.hash);
                    false
                } else {
                    true
                }
            })
            .collect();
        for chunk in wanted.chunks(batch) {
            connman.push_message(peer, inv_message(command::GETDATA, chunk));
        }
    }

    fn finalize_peer(&self, connman: &Connman, peer: &Peer) {
        self.deferred.lock().remove(&peer.id);
        connman.addrman().disconnected(&peer.addr);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addrman::AddrManager;
    use crate::net::banman::MemoryBanStorage;
    use crate::net::config::{NetConfig, Network};
    use crate::net::interfaces::Validator;
    use crate::node::handler;
    use crate::node::ConnectionManager;
    use crate::task::CancellationToken;
    use std::sync::mpsc;

    /// Accepts everything and serves one known transaction
    struct TestValidator {
        tx: Bytes,
    }

    impl Validator for TestValidator {
        fn validate_transaction(&self, _: PeerId, _: &Hash256, payload: &Bytes) -> ValidationOutcome {
            if payload.as_ref() == b"bad" {
                ValidationOutcome::Rejected {
                    reason: "bad tx".into(),
                    ban_score: 10,
                }
            } else {
                ValidationOutcome::Accepted
            }
        }

        fn validate_block(&self, _: PeerId, _: &Hash256, _: &Bytes, _: &CancellationToken) -> ValidationOutcome {
            ValidationOutcome::Accepted
        }

        fn already_have(&self, _: &InvItem) -> bool {
            false
        }

        fn fetch_inventory(&self, item: &InvItem) -> Option<Bytes> {
            (item.kind == InvKind::Tx && item.hash == Hash256(double_sha256(&self.tx)))
                .then(|| self.tx.clone())
        }
    }

    fn manager() -> ConnectionManager {
        manager_with(Arc::new(TestValidator {
            tx: Bytes::from_static(b"known tx"),
        }))
    }

    fn inbound(cm: &ConnectionManager, last: u8) -> PeerRef {
        cm.admit_inbound(None, SocketAddr::from(([11, 0, 0, last], 7000)))
            .unwrap()
    }

    /// Hands back every block validation only once released
    struct GatedValidator {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl Validator for GatedValidator {
        fn validate_transaction(&self, _: PeerId, _: &Hash256, _: &Bytes) -> ValidationOutcome {
            ValidationOutcome::Accepted
        }

        fn validate_block(&self, _: PeerId, _: &Hash256, _: &Bytes, _: &CancellationToken) -> ValidationOutcome {
            let _ = self.gate.lock().recv_timeout(Duration::from_secs(10));
            ValidationOutcome::Accepted
        }

        fn already_have(&self, _: &InvItem) -> bool {
            false
        }

        fn fetch_inventory(&self, _: &InvItem) -> Option<Bytes> {
            None
        }
    }

    fn manager_with(validator: Arc<dyn Validator>) -> ConnectionManager {
        let mut config = NetConfig::for_network(Network::Regtest);
        config.dns_seed = false;
        ConnectionManager::builder(config)
            .ban_storage(Box::new(MemoryBanStorage::new()))
            .address_manager(Arc::new(AddrManager::new()))
            .validator(validator)
            .build()
            .unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not met in time");
    }

    /// Put a framed message on the peer's receive queue without processing it
    fn queue(cm: &ConnectionManager, peer: &PeerRef, cmd: &str, payload: impl Into<Bytes>) {
        let msg = OutboundMessage::new(cmd, payload);
        let mut wire = msg.header(cm.config().magic()).to_bytes().to_vec();
        wire.extend_from_slice(&msg.payload);
        peer.receive_bytes(&wire, u64::MAX).unwrap();
    }

    fn deliver(cm: &ConnectionManager, peer: &PeerRef, cmd: &str, payload: impl Into<Bytes>) {
        queue(cm, peer, cmd, payload);

        let interrupt = Interrupt::new();
        let processor = cm.processor();
        while processor.process_messages(cm, peer, &interrupt) {}
    }

    fn sent(peer: &Peer, cmd: &str) -> bool {
        peer.stats().bytes_sent_per_cmd.contains_key(cmd)
    }

    fn version_payload(nonce: u64) -> Bytes {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: 0,
            addr_recv: NetAddr::new(SocketAddr::from(([127, 0, 0, 1], 1)), ServiceFlags::empty()),
            addr_from: NetAddr::new(SocketAddr::from(([127, 0, 0, 1], 2)), ServiceFlags::empty()),
            nonce,
            user_agent: "/test:1.0/".into(),
            start_height: 7,
            relay: true,
        }
        .encode()
    }

    fn establish(cm: &ConnectionManager, peer: &PeerRef) {
        deliver(cm, peer, command::VERSION, version_payload(99));
        deliver(cm, peer, command::VERACK, Bytes::new());
        assert!(peer.is_established());
    }

    #[test]
    fn test_message_before_version() {
        let cm = manager();
        let peer = inbound(&cm, 1);
        deliver(&cm, &peer, command::PING, encode_nonce(5));
        assert_eq!(peer.ban_score(), 1);
        assert!(!sent(&peer, command::PONG));
    }

    #[test]
    fn test_inbound_handshake() {
        let cm = manager();
        let mut events = cm.take_events().unwrap();
        let peer = inbound(&cm, 2);

        deliver(&cm, &peer, command::VERSION, version_payload(99));
        assert!(sent(&peer, command::VERSION));
        assert!(sent(&peer, command::VERACK));
        assert!(!peer.is_established());
        assert_eq!(peer.start_height(), 7);
        assert_eq!(peer.subver(), "/test:1.0/");

        deliver(&cm, &peer, command::VERACK, Bytes::new());
        assert!(peer.is_established());
        assert!(sent(&peer, command::PROTOCONF));
        assert!(sent(&peer, command::SENDHEADERS));

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let NetEvent::HandshakeComplete { id, start_height, .. } = event {
                assert_eq!(id, peer.id);
                assert_eq!(start_height, 7);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[test]
    fn test_duplicate_version() {
        let cm = manager();
        let peer = inbound(&cm, 3);
        deliver(&cm, &peer, command::VERSION, version_payload(99));
        deliver(&cm, &peer, command::VERSION, version_payload(99));
        assert_eq!(peer.ban_score(), 1);
    }

    #[test]
    fn test_obsolete_version_disconnects() {
        let cm = manager();
        let peer = inbound(&cm, 4);
        let mut version = VersionMessage::decode(&version_payload(1)).unwrap();
        version.version = MIN_PEER_PROTO_VERSION - 1;
        deliver(&cm, &peer, command::VERSION, version.encode());
        assert!(peer.is_disconnecting());
    }

    #[test]
    fn test_self_connection_detected() {
        let cm = manager();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        let outbound = cm
            .open_connection(target, None, ConnectionType::Outbound)
            .unwrap();
        assert!(sent(&outbound, command::VERSION));

        let peer = inbound(&cm, 5);
        deliver(&cm, &peer, command::VERSION, version_payload(outbound.local_nonce));
        assert!(peer.is_disconnecting());
    }

    #[test]
    fn test_ping_answered() {
        let cm = manager();
        let peer = inbound(&cm, 6);
        establish(&cm, &peer);
        deliver(&cm, &peer, command::PING, encode_nonce(1234));
        assert!(sent(&peer, command::PONG));
    }

    #[test]
    fn test_send_messages_pings() {
        let cm = manager();
        let peer = inbound(&cm, 7);
        establish(&cm, &peer);
        cm.processor().send_messages(&cm, &peer);
        assert!(sent(&peer, command::PING));
        assert!(peer.stats().ping_wait_ms.is_some());
    }

    #[test]
    fn test_protoconf_floor() {
        let cm = manager();
        let peer = inbound(&cm, 8);
        establish(&cm, &peer);
        deliver(&cm, &peer, command::PROTOCONF, Protoconf::new(1000).encode());
        assert_eq!(
            peer.max_send_payload(),
            u64::from(LEGACY_MAX_PROTOCOL_PAYLOAD_LENGTH)
        );
        deliver(&cm, &peer, command::PROTOCONF, Protoconf::new(4 * 1024 * 1024).encode());
        assert_eq!(peer.max_send_payload(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_filteradd_without_filter_bans() {
        let cm = manager();
        let peer = inbound(&cm, 9);
        establish(&cm, &peer);
        let mut payload = vec![3u8];
        payload.extend_from_slice(b"abc");
        deliver(&cm, &peer, command::FILTERADD, payload);
        assert_eq!(peer.ban_score(), 100);
        assert!(peer.is_disconnecting());
    }

    #[test]
    fn test_sendcmpct_recorded_in_stats() {
        let cm = manager();
        let peer = inbound(&cm, 18);
        establish(&cm, &peer);
        let cmpct = |version| SendCmpct {
            announce: true,
            version,
        };
        deliver(&cm, &peer, command::SENDCMPCT, cmpct(2).encode());
        assert!(!peer.stats().send_cmpct);
        deliver(&cm, &peer, command::SENDCMPCT, cmpct(1).encode());
        assert!(peer.stats().send_cmpct);
        assert!(!peer.stats().bloom_filter);
    }

    #[test]
    fn test_truncated_block_bans() {
        let cm = manager();
        let peer = inbound(&cm, 10);
        establish(&cm, &peer);
        deliver(&cm, &peer, command::BLOCK, vec![0u8; 79]);
        assert!(peer.is_disconnecting());
    }

    #[test]
    fn test_tx_relayed_to_other_peers() {
        let cm = manager();
        let a = inbound(&cm, 11);
        let b = inbound(&cm, 12);
        establish(&cm, &a);
        establish(&cm, &b);

        deliver(&cm, &a, command::TX, Bytes::from_static(b"some tx"));
        assert_eq!(b.pending_announcements(), 1);
        assert_eq!(a.pending_announcements(), 0);

        cm.processor().send_messages(&cm, &b);
        assert!(sent(&b, command::INV));
        assert_eq!(b.pending_announcements(), 0);
    }

    #[test]
    fn test_rejected_tx_scores() {
        let cm = manager();
        let peer = inbound(&cm, 13);
        establish(&cm, &peer);
        deliver(&cm, &peer, command::TX, Bytes::from_static(b"bad"));
        assert_eq!(peer.ban_score(), 10);
    }

    #[test]
    fn test_getdata_served_and_notfound() {
        let cm = manager();
        let peer = inbound(&cm, 14);
        establish(&cm, &peer);

        let known = InvItem::tx(Hash256(double_sha256(b"known tx")));
        let unknown = InvItem::tx(Hash256([7; 32]));
        deliver(&cm, &peer, command::GETDATA, inv_message(command::GETDATA, &[known, unknown]).payload);
        assert!(sent(&peer, command::TX));
        assert!(sent(&peer, command::NOTFOUND));
    }

    #[test]
    fn test_inv_schedules_getdata() {
        let cm = manager();
        let peer = inbound(&cm, 15);
        establish(&cm, &peer);

        let item = InvItem::tx(Hash256([9; 32]));
        deliver(&cm, &peer, command::INV, inv_message(command::INV, &[item]).payload);
        assert!(peer.knows_inventory(&item.hash));
        assert_eq!(peer.ask_for_len(), 1);

        cm.processor().send_messages(&cm, &peer);
        assert!(sent(&peer, command::GETDATA));
    }

    #[test]
    fn test_oversized_addr_scores() {
        let cm = manager();
        let peer = inbound(&cm, 16);
        establish(&cm, &peer);
        // compact size 1001 with no entries
        deliver(&cm, &peer, command::ADDR, vec![0xfd, 0xe9, 0x03]);
        assert_eq!(peer.ban_score(), 20);
    }

    #[test]
    fn test_block_tasks_capped_per_peer() {
        let (release, gate) = mpsc::channel();
        let cm = manager_with(Arc::new(GatedValidator {
            gate: Mutex::new(gate),
        }));
        let peer = inbound(&cm, 17);
        establish(&cm, &peer);
        assert_eq!(cm.tasks().soft_limit(), 3);

        for i in 0..5u8 {
            queue(&cm, &peer, command::BLOCK, vec![i; 100]);
        }
        let processor = cm.processor();
        for _ in 0..10 {
            handler::run_pass(&cm, processor.as_ref());
        }
        // The remaining blocks wait on the receive queue
        assert_eq!(cm.tasks().task_count(peer.id), 3);
        assert!(peer.has_pending_messages());

        release.send(()).unwrap();
        wait_for(|| cm.tasks().task_count(peer.id) == 2);
        handler::run_pass(&cm, processor.as_ref());
        assert_eq!(cm.tasks().task_count(peer.id), 3);
        for _ in 0..10 {
            handler::run_pass(&cm, processor.as_ref());
        }
        assert_eq!(cm.tasks().task_count(peer.id), 3);
        assert!(peer.has_pending_messages());

        // Closing the gate lets every validation finish
        drop(release);
        wait_for(|| {
            handler::run_pass(&cm, processor.as_ref());
            !peer.has_pending_messages() && cm.tasks().task_count(peer.id) == 0
        });
        assert!(!peer.is_disconnecting());
    }

    #[test]
    fn test_response_commands() {
        assert_eq!(response_command(InvKind::Tx), Some(command::TX));
        assert_eq!(response_command(InvKind::FilteredBlock), Some(command::MERKLEBLOCK));
        assert_eq!(response_command(InvKind::Unknown(9)), None);
    }
}
