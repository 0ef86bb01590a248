//! Per-connection peer state
//!
//! A [`Peer`] is shared between the socket thread, the message handler, the
//! dialers and async tasks through `Arc`. Its state is split across small
//! locks, one per concern, so no thread ever waits on another's unrelated
//! work:
//!
//! - socket: the mio stream, taken exactly once when the peer is closed
//! - send: queued outbound chunks plus the resumable partial-write offset
//! - recv: the incremental decoder for the message currently arriving
//! - process queue: complete messages waiting for the handler
//! - inventory: known set, announcement queues and ask-for schedule
//! - filter: relay preferences (bloom filter, fee filter)
//!
//! Lock order when more than one is needed: send before socket.

use crate::net::askfor::{AskFor, AskForOutcome, AskForTracker};
use crate::net::bandwidth::BandwidthMeter;
use crate::net::bloom::{BloomFilter, RollingBloomFilter};
use crate::net::counters::{NetCounters, SendQueueCounter};
use crate::protocol::error::FramingError;
use crate::protocol::header::{Magic, PayloadLimits};
use crate::protocol::inventory::{Hash256, InvItem, InvKind};
use crate::protocol::message::{MessageCodec, NetMessage, OutboundMessage};
use crate::protocol::payload::LEGACY_MAX_PROTOCOL_PAYLOAD_LENGTH;
use crate::protocol::services::ServiceFlags;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use mio::net::TcpStream;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::codec::Decoder;

// =============================================================================
// Constants
// =============================================================================

/// Entries remembered in the known-inventory filter
pub const KNOWN_INVENTORY_SIZE: usize = 50_000;

/// Grace period before a silent connection is dropped
pub const NO_TRAFFIC_GRACE: Duration = Duration::from_secs(60);

/// Maximum transactions announced per inv
pub const INVENTORY_BROADCAST_MAX: usize = 1000;

// =============================================================================
// Identity
// =============================================================================

/// Unique, monotonically increasing peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={}", self.0)
    }
}

/// How the connection came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Inbound,
    Outbound,
    /// Short-lived connection to test an untried address
    Feeler,
    /// Manually added node
    Manual,
}

impl ConnectionType {
    pub fn is_inbound(&self) -> bool {
        matches!(self, ConnectionType::Inbound)
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connecting,
    Handshaking,
    Established,
    Disconnecting,
    Closed,
}

/// Why the socket thread timed a peer out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    NoTraffic,
    SendIdle,
    RecvIdle,
    Ping,
    Handshake,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutReason::NoTraffic => "socket no message in first 60 seconds",
            TimeoutReason::SendIdle => "socket sending timeout",
            TimeoutReason::RecvIdle => "socket receive timeout",
            TimeoutReason::Ping => "ping timeout",
            TimeoutReason::Handshake => "version handshake timeout",
        };
        f.write_str(s)
    }
}

/// Timeout thresholds applied by [`Peer::check_timeouts`]
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLimits {
    pub idle: Duration,
    pub ping: Duration,
    pub handshake: Duration,
}

// =============================================================================
// Sub-states
// =============================================================================

/// Outbound bytes, chunked as they were queued
struct SendState {
    queue: VecDeque<Bytes>,
    /// Bytes of the front chunk already written
    offset: usize,
    counter: SendQueueCounter,
    bytes_per_cmd: BTreeMap<String, u64>,
    total_bytes: u64,
}

struct RecvState {
    codec: MessageCodec,
    buffer: BytesMut,
    bytes_per_cmd: BTreeMap<String, u64>,
    total_bytes: u64,
    bandwidth: BandwidthMeter,
}

#[derive(Default)]
struct ProcessQueue {
    messages: VecDeque<NetMessage>,
    size: u64,
}

struct InventoryState {
    known: RollingBloomFilter,
    tx_to_send: Vec<Hash256>,
    blocks_to_send: Vec<Hash256>,
    headers_to_announce: Vec<Hash256>,
    ask_for: AskFor,
}

/// Relay preferences the peer asked for
#[derive(Debug, Clone)]
pub struct RelayFilter {
    pub relay_txes: bool,
    pub bloom: Option<BloomFilter>,
    /// Minimum fee rate in satoshis per kB; 0 means no filter
    pub fee_filter: i64,
}

impl Default for RelayFilter {
    fn default() -> Self {
        Self {
            relay_txes: true,
            bloom: None,
            fee_filter: 0,
        }
    }
}

#[derive(Debug, Default)]
struct PingState {
    nonce_sent: u64,
    started: Option<Instant>,
    last: Option<Duration>,
    min: Option<Duration>,
    queued: bool,
}

/// Outcome of draining the send queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendProgress {
    pub written: usize,
    /// The socket refused more data; wait for the next writable event
    pub would_block: bool,
    /// Everything queued has been written
    pub drained: bool,
}

/// What a call to [`Peer::receive_bytes`] produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvProgress {
    /// Complete messages moved to the process queue
    pub messages: usize,
    /// Messages dropped for a bad checksum
    pub bad_checksums: usize,
}

/// Everything needed to construct a peer
#[derive(Debug, Clone)]
pub struct PeerParams {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub addr_name: String,
    pub conn_type: ConnectionType,
    pub whitelisted: bool,
    pub keyed_netgroup: u64,
    pub local_nonce: u64,
    pub magic: Magic,
    pub limits: PayloadLimits,
}

// =============================================================================
// Peer
// =============================================================================

/// One connection to a remote node
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Name the connection was opened with (may be a hostname)
    pub addr_name: String,
    pub conn_type: ConnectionType,
    pub whitelisted: bool,
    pub keyed_netgroup: u64,
    /// Nonce sent in our version message, for self-connection detection
    pub local_nonce: u64,
    pub connected_at: Instant,
    /// Unix seconds
    pub connected_time: i64,
    magic: Magic,

    socket: Mutex<Option<TcpStream>>,
    registered: AtomicBool,
    state: Mutex<PeerState>,
    disconnect: AtomicBool,

    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    process: Mutex<ProcessQueue>,
    pause_send: AtomicBool,
    pause_recv: AtomicBool,

    inventory: Mutex<InventoryState>,
    filter: Mutex<RelayFilter>,
    ping: Mutex<PingState>,

    last_send: AtomicI64,
    last_recv: AtomicI64,
    last_block_time: Mutex<Option<Instant>>,
    last_tx_time: Mutex<Option<Instant>>,

    version: AtomicI32,
    services: AtomicU64,
    start_height: AtomicI32,
    subver: Mutex<String>,
    version_sent: AtomicBool,
    version_received: AtomicBool,
    verack_received: AtomicBool,
    verack_sent: AtomicBool,
    prefer_headers: AtomicBool,
    send_cmpct: AtomicBool,
    /// Largest payload the peer told us it accepts
    max_send_payload: AtomicU64,

    misbehaviour: AtomicU32,
    should_ban: AtomicBool,
}

impl Peer {
    pub fn new(
        params: PeerParams,
        socket: Option<TcpStream>,
        counters: Arc<NetCounters>,
        ask_for: Arc<AskForTracker>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: params.id,
            addr: params.addr,
            addr_name: params.addr_name,
            conn_type: params.conn_type,
            whitelisted: params.whitelisted,
            keyed_netgroup: params.keyed_netgroup,
            local_nonce: params.local_nonce,
            connected_at: now,
            connected_time: Utc::now().timestamp(),
            magic: params.magic,
            socket: Mutex::new(socket),
            registered: AtomicBool::new(false),
            state: Mutex::new(PeerState::Connecting),
            disconnect: AtomicBool::new(false),
            send: Mutex::new(SendState {
                queue: VecDeque::new(),
                offset: 0,
                counter: SendQueueCounter::new(counters),
                bytes_per_cmd: BTreeMap::new(),
                total_bytes: 0,
            }),
            recv: Mutex::new(RecvState {
                codec: MessageCodec::new(params.magic, params.limits),
                buffer: BytesMut::new(),
                bytes_per_cmd: BTreeMap::new(),
                total_bytes: 0,
                bandwidth: BandwidthMeter::new(now),
            }),
            process: Mutex::new(ProcessQueue::default()),
            pause_send: AtomicBool::new(false),
            pause_recv: AtomicBool::new(false),
            inventory: Mutex::new(InventoryState {
                known: RollingBloomFilter::new(KNOWN_INVENTORY_SIZE, 0.000_001),
                tx_to_send: Vec::new(),
                blocks_to_send: Vec::new(),
                headers_to_announce: Vec::new(),
                ask_for: AskFor::new(ask_for),
            }),
            filter: Mutex::new(RelayFilter::default()),
            ping: Mutex::new(PingState::default()),
            last_send: AtomicI64::new(0),
            last_recv: AtomicI64::new(0),
            last_block_time: Mutex::new(None),
            last_tx_time: Mutex::new(None),
            version: AtomicI32::new(0),
            services: AtomicU64::new(0),
            start_height: AtomicI32::new(-1),
            subver: Mutex::new(String::new()),
            version_sent: AtomicBool::new(false),
            version_received: AtomicBool::new(false),
            verack_received: AtomicBool::new(false),
            verack_sent: AtomicBool::new(false),
            prefer_headers: AtomicBool::new(false),
            send_cmpct: AtomicBool::new(false),
            max_send_payload: AtomicU64::new(LEGACY_MAX_PROTOCOL_PAYLOAD_LENGTH as u64),
            misbehaviour: AtomicU32::new(0),
            should_ban: AtomicBool::new(false),
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.conn_type.is_inbound()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// Move forward in the lifecycle. Backward transitions are ignored.
    pub fn advance_state(&self, next: PeerState) {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
        }
    }

    /// Flag the peer for disconnection. Returns `true` only for the call that
    /// actually set the flag.
    pub fn mark_disconnect(&self, reason: &str) -> bool {
        if self.disconnect.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::debug!("disconnecting {} {}: {}", self.id, self.addr, reason);
        self.advance_state(PeerState::Disconnecting);
        true
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Close the socket. Only the first call does anything.
    pub fn close_socket(&self, registry: Option<&mio::Registry>) -> bool {
        let stream = self.socket.lock().take();
        let closed = match stream {
            Some(mut stream) => {
                if self.registered.swap(false, Ordering::AcqRel) {
                    if let Some(registry) = registry {
                        let _ = registry.deregister(&mut stream);
                    }
                }
                let _ = stream.shutdown(std::net::Shutdown::Both);
                log::debug!("closed socket {} {}", self.id, self.addr);
                true
            }
            None => false,
        };
        self.advance_state(PeerState::Closed);
        closed
    }

    pub fn has_socket(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Register the socket with the event loop's poller, once
    pub fn register(&self, registry: &mio::Registry, token: mio::Token) -> io::Result<bool> {
        if self.registered.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut socket = self.socket.lock();
        match socket.as_mut() {
            Some(stream) => {
                registry.register(
                    stream,
                    token,
                    mio::Interest::READABLE | mio::Interest::WRITABLE,
                )?;
                self.registered.store(true, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue a message. Returns the framed size and whether the queue was
    /// empty beforehand (so an immediate write may be attempted).
    pub fn push_message(&self, msg: OutboundMessage, send_buffer_size: u64) -> (u64, bool) {
        let header = msg.header(self.magic).to_bytes();
        let size = (header.len() + msg.payload.len()) as u64;
        let mut send = self.send.lock();
        let was_empty = send.queue.is_empty();
        *send.bytes_per_cmd.entry(msg.command.clone()).or_insert(0) += size;
        send.queue.push_back(header);
        if !msg.payload.is_empty() {
            send.queue.push_back(msg.payload);
        }
        send.counter.add(size);
        if send.counter.get() > send_buffer_size {
            self.pause_send.store(true, Ordering::Release);
        }
        (size, was_empty)
    }

    /// Write as much of the send queue as the socket accepts
    pub fn send_data(&self, send_buffer_size: u64) -> io::Result<SendProgress> {
        let mut send = self.send.lock();
        let mut progress = SendProgress::default();
        {
            let mut socket = self.socket.lock();
            let stream = match socket.as_mut() {
                Some(s) => s,
                None => return Ok(progress),
            };
            while let Some(chunk) = send.queue.front() {
                let chunk = chunk.clone();
                let offset = send.offset;
                match stream.write(&chunk[offset..]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => {
                        progress.written += n;
                        send.counter.sub(n as u64);
                        if offset + n == chunk.len() {
                            send.queue.pop_front();
                            send.offset = 0;
                        } else {
                            send.offset = offset + n;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        progress.would_block = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        progress.drained = send.queue.is_empty();
        if progress.written > 0 {
            send.total_bytes += progress.written as u64;
            self.last_send
                .store(Utc::now().timestamp(), Ordering::Relaxed);
        }
        if send.counter.get() < send_buffer_size {
            self.pause_send.store(false, Ordering::Release);
        }
        Ok(progress)
    }

    pub fn send_queue_bytes(&self) -> u64 {
        self.send.lock().counter.get()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send.lock().queue.is_empty()
    }

    pub fn is_send_paused(&self) -> bool {
        self.pause_send.load(Ordering::Acquire)
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Read once from the socket into `buf`
    pub fn recv_from_socket(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.socket.lock();
        match socket.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Feed received bytes through the decoder, moving complete messages to
    /// the process queue. Pauses receiving once the queue exceeds
    /// `flood_size`.
    pub fn receive_bytes(&self, data: &[u8], flood_size: u64) -> Result<RecvProgress, FramingError> {
        let mut progress = RecvProgress::default();
        let mut complete = Vec::new();
        let mut failure = None;
        {
            let mut recv = self.recv.lock();
            recv.total_bytes += data.len() as u64;
            recv.bandwidth.record(data.len() as u64);
            recv.buffer.extend_from_slice(data);

            loop {
                let RecvState { codec, buffer, .. } = &mut *recv;
                let mut msg = match codec.decode(buffer) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    // Messages decoded before the bad header are still queued
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                let size = msg.received_size();
                let cmd = msg.command().to_string();
                *recv.bytes_per_cmd.entry(cmd.clone()).or_insert(0) += size;

                if !msg.verify_checksum() {
                    log::warn!(
                        "{} {}: checksum mismatch for {} ({} bytes), dropping",
                        self.id,
                        self.addr,
                        cmd,
                        size
                    );
                    progress.bad_checksums += 1;
                    continue;
                }
                complete.push(msg);
            }
        }
        self.last_recv
            .store(Utc::now().timestamp(), Ordering::Relaxed);

        if !complete.is_empty() {
            progress.messages = complete.len();
            let mut queue = self.process.lock();
            for msg in complete {
                queue.size += msg.received_size();
                queue.messages.push_back(msg);
            }
            self.pause_recv
                .store(queue.size > flood_size, Ordering::Release);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(progress),
        }
    }

    /// Take the next message for processing, and whether more are waiting
    pub fn poll_message(&self, flood_size: u64) -> Option<(NetMessage, bool)> {
        let mut queue = self.process.lock();
        let msg = queue.messages.pop_front()?;
        queue.size = queue.size.saturating_sub(msg.received_size());
        self.pause_recv
            .store(queue.size > flood_size, Ordering::Release);
        Some((msg, !queue.messages.is_empty()))
    }

    pub fn process_queue_bytes(&self) -> u64 {
        self.process.lock().size
    }

    pub fn has_pending_messages(&self) -> bool {
        !self.process.lock().messages.is_empty()
    }

    pub fn is_recv_paused(&self) -> bool {
        self.pause_recv.load(Ordering::Acquire)
    }

    /// Apply new payload limits to messages not yet started
    pub fn set_recv_limits(&self, limits: PayloadLimits) {
        self.recv.lock().codec.set_limits(limits);
    }

    /// Take a bandwidth sample if one is due
    pub fn sample_bandwidth(&self, now: Instant) {
        self.recv.lock().bandwidth.sample(now);
    }

    pub fn average_bandwidth(&self) -> f64 {
        self.recv.lock().bandwidth.average()
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    /// Check liveness; `now_secs` is unix time
    pub fn check_timeouts(
        &self,
        now_secs: i64,
        now: Instant,
        limits: &TimeoutLimits,
    ) -> Option<TimeoutReason> {
        let age = now.saturating_duration_since(self.connected_at);
        if !self.is_established() && age > limits.handshake {
            return Some(TimeoutReason::Handshake);
        }
        if age <= NO_TRAFFIC_GRACE {
            return None;
        }
        let last_send = self.last_send.load(Ordering::Relaxed);
        let last_recv = self.last_recv.load(Ordering::Relaxed);
        let idle = limits.idle.as_secs() as i64;
        if last_send == 0 || last_recv == 0 {
            return Some(TimeoutReason::NoTraffic);
        }
        if now_secs - last_send > idle {
            return Some(TimeoutReason::SendIdle);
        }
        if now_secs - last_recv > idle {
            return Some(TimeoutReason::RecvIdle);
        }
        let ping = self.ping.lock();
        if ping.nonce_sent != 0 {
            if let Some(started) = ping.started {
                if now.saturating_duration_since(started) > limits.ping {
                    return Some(TimeoutReason::Ping);
                }
            }
        }
        None
    }

    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    pub fn last_recv(&self) -> i64 {
        self.last_recv.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    pub fn set_version(&self, version: i32, services: ServiceFlags, start_height: i32, subver: String) {
        self.version.store(version, Ordering::Release);
        self.services.store(services.bits(), Ordering::Release);
        self.start_height.store(start_height, Ordering::Release);
        *self.subver.lock() = subver;
        self.version_received.store(true, Ordering::Release);
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_wire(self.services.load(Ordering::Acquire))
    }

    pub fn start_height(&self) -> i32 {
        self.start_height.load(Ordering::Acquire)
    }

    pub fn subver(&self) -> String {
        self.subver.lock().clone()
    }

    pub fn mark_version_sent(&self) {
        self.version_sent.store(true, Ordering::Release);
        self.advance_state(PeerState::Handshaking);
    }

    pub fn version_sent(&self) -> bool {
        self.version_sent.load(Ordering::Acquire)
    }

    pub fn version_received(&self) -> bool {
        self.version_received.load(Ordering::Acquire)
    }

    pub fn mark_verack_sent(&self) {
        self.verack_sent.store(true, Ordering::Release);
        self.update_established();
    }

    pub fn mark_verack_received(&self) {
        self.verack_received.store(true, Ordering::Release);
        self.update_established();
    }

    pub fn verack_received(&self) -> bool {
        self.verack_received.load(Ordering::Acquire)
    }

    fn update_established(&self) {
        if self.version_received()
            && self.version_sent()
            && self.verack_received()
            && self.verack_sent.load(Ordering::Acquire)
        {
            self.advance_state(PeerState::Established);
        }
    }

    /// Both sides exchanged version and verack
    pub fn is_established(&self) -> bool {
        self.state() >= PeerState::Established && !self.is_disconnecting()
    }

    pub fn set_prefer_headers(&self, on: bool) {
        self.prefer_headers.store(on, Ordering::Release);
    }

    pub fn prefers_headers(&self) -> bool {
        self.prefer_headers.load(Ordering::Acquire)
    }

    pub fn set_send_cmpct(&self, on: bool) {
        self.send_cmpct.store(on, Ordering::Release);
    }

    pub fn set_max_send_payload(&self, len: u64) {
        self.max_send_payload.store(len, Ordering::Release);
    }

    pub fn max_send_payload(&self) -> u64 {
        self.max_send_payload.load(Ordering::Acquire)
    }

    // =========================================================================
    // Relay filter
    // =========================================================================

    pub fn relay_filter(&self) -> RelayFilter {
        self.filter.lock().clone()
    }

    pub fn set_relay_txes(&self, relay: bool) {
        self.filter.lock().relay_txes = relay;
    }

    pub fn set_fee_filter(&self, fee_per_kb: i64) {
        self.filter.lock().fee_filter = fee_per_kb;
    }

    pub fn fee_filter(&self) -> i64 {
        self.filter.lock().fee_filter
    }

    /// Install a bloom filter; a loaded filter also turns tx relay on
    pub fn load_bloom_filter(&self, bloom: BloomFilter) {
        let mut filter = self.filter.lock();
        filter.bloom = Some(bloom);
        filter.relay_txes = true;
    }

    /// Add data to the loaded filter. Returns false when no filter is loaded.
    pub fn add_to_bloom_filter(&self, data: &[u8]) -> bool {
        let mut filter = self.filter.lock();
        match filter.bloom.as_mut() {
            Some(bloom) => {
                bloom.insert(data);
                true
            }
            None => false,
        }
    }

    pub fn clear_bloom_filter(&self) {
        let mut filter = self.filter.lock();
        filter.bloom = None;
        filter.relay_txes = true;
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Record that the peer knows about an item
    pub fn add_known_inventory(&self, hash: &Hash256) {
        self.inventory.lock().known.insert(hash.as_bytes());
    }

    pub fn knows_inventory(&self, hash: &Hash256) -> bool {
        self.inventory.lock().known.contains(hash.as_bytes())
    }

    /// Queue an item for announcement.
    ///
    /// Transactions are skipped when the peer already knows them, doesn't
    /// relay transactions, or set a fee filter above `fee_rate`. Blocks are
    /// always queued. Returns whether the item was queued.
    pub fn push_inventory(&self, item: InvItem, fee_rate: Option<i64>) -> bool {
        match item.kind {
            InvKind::Block | InvKind::CompactBlock | InvKind::FilteredBlock => {
                let mut inv = self.inventory.lock();
                if self.prefers_headers() {
                    inv.headers_to_announce.push(item.hash);
                } else {
                    inv.blocks_to_send.push(item.hash);
                }
                true
            }
            _ => {
                {
                    let filter = self.filter.lock();
                    if !filter.relay_txes {
                        return false;
                    }
                    if let Some(rate) = fee_rate {
                        if filter.fee_filter > 0 && rate < filter.fee_filter {
                            return false;
                        }
                    }
                }
                let mut inv = self.inventory.lock();
                if inv.known.contains(item.hash.as_bytes()) {
                    return false;
                }
                inv.tx_to_send.push(item.hash);
                true
            }
        }
    }

    /// Drain queued announcements into inv items, marking them known.
    /// Returns (items for inv, block hashes to announce as headers).
    pub fn take_announcements(&self, max_tx: usize) -> (Vec<InvItem>, Vec<Hash256>) {
        let mut inv = self.inventory.lock();
        let mut items = Vec::new();

        let blocks = std::mem::take(&mut inv.blocks_to_send);
        for hash in blocks {
            if !inv.known.contains(hash.as_bytes()) {
                inv.known.insert(hash.as_bytes());
                items.push(InvItem::block(hash));
            }
        }

        let take = inv.tx_to_send.len().min(max_tx);
        let txs: Vec<Hash256> = inv.tx_to_send.drain(..take).collect();
        for hash in txs {
            if !inv.known.contains(hash.as_bytes()) {
                inv.known.insert(hash.as_bytes());
                items.push(InvItem::tx(hash));
            }
        }

        let headers: Vec<Hash256> = std::mem::take(&mut inv.headers_to_announce);
        for hash in &headers {
            inv.known.insert(hash.as_bytes());
        }
        (items, headers)
    }

    pub fn pending_announcements(&self) -> usize {
        let inv = self.inventory.lock();
        inv.tx_to_send.len() + inv.blocks_to_send.len() + inv.headers_to_announce.len()
    }

    pub fn ask_for(&self, item: InvItem, now: Instant) -> AskForOutcome {
        self.inventory.lock().ask_for.ask_for(item, now)
    }

    pub fn take_due_requests(&self, now: Instant, limit: usize) -> Vec<InvItem> {
        let mut inv = self.inventory.lock();
        inv.ask_for.expire(now);
        inv.ask_for.take_due(now, limit)
    }

    pub fn inventory_received(&self, hash: &Hash256) {
        let mut inv = self.inventory.lock();
        inv.known.insert(hash.as_bytes());
        inv.ask_for.received(hash);
    }

    pub fn inventory_not_found(&self, hash: &Hash256) {
        self.inventory.lock().ask_for.not_found(hash);
    }

    pub fn ask_for_len(&self) -> usize {
        self.inventory.lock().ask_for.len()
    }

    pub fn mark_block_received(&self, now: Instant) {
        *self.last_block_time.lock() = Some(now);
    }

    pub fn mark_tx_received(&self, now: Instant) {
        *self.last_tx_time.lock() = Some(now);
    }

    pub fn last_block_time(&self) -> Option<Instant> {
        *self.last_block_time.lock()
    }

    pub fn last_tx_time(&self) -> Option<Instant> {
        *self.last_tx_time.lock()
    }

    // =========================================================================
    // Ping
    // =========================================================================

    /// Ask for a ping to go out on the next send pass
    pub fn queue_ping(&self) {
        self.ping.lock().queued = true;
    }

    /// Whether a ping should be sent now
    pub fn ping_due(&self, now: Instant, interval: Duration) -> bool {
        let ping = self.ping.lock();
        if ping.nonce_sent != 0 {
            return false;
        }
        if ping.queued {
            return true;
        }
        match ping.started {
            Some(started) => now.saturating_duration_since(started) > interval,
            None => true,
        }
    }

    /// Record an outgoing ping
    pub fn start_ping(&self, nonce: u64, now: Instant) {
        let mut ping = self.ping.lock();
        ping.nonce_sent = nonce;
        ping.started = Some(now);
        ping.queued = false;
    }

    /// Match a pong against the outstanding ping. Returns the round trip when
    /// it matches.
    pub fn receive_pong(&self, nonce: u64, now: Instant) -> Option<Duration> {
        let mut ping = self.ping.lock();
        if ping.nonce_sent == 0 || nonce != ping.nonce_sent {
            return None;
        }
        let rtt = now.saturating_duration_since(ping.started?);
        ping.nonce_sent = 0;
        ping.last = Some(rtt);
        ping.min = Some(ping.min.map_or(rtt, |m| m.min(rtt)));
        Some(rtt)
    }

    pub fn min_ping(&self) -> Option<Duration> {
        self.ping.lock().min
    }

    // =========================================================================
    // Misbehaviour
    // =========================================================================

    /// Add to the ban score. Returns the new score.
    pub fn misbehave(&self, score: u32, threshold: u32) -> u32 {
        let total = self.misbehaviour.fetch_add(score, Ordering::AcqRel) + score;
        if total >= threshold && total - score < threshold && !self.whitelisted {
            self.should_ban.store(true, Ordering::Release);
        }
        total
    }

    pub fn ban_score(&self) -> u32 {
        self.misbehaviour.load(Ordering::Acquire)
    }

    /// Flag the peer for banning regardless of score
    pub fn set_should_ban(&self) {
        if !self.whitelisted {
            self.should_ban.store(true, Ordering::Release);
        }
    }

    /// Consume the ban flag
    pub fn take_should_ban(&self) -> bool {
        self.should_ban.swap(false, Ordering::AcqRel)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn stats(&self) -> NodeStats {
        let (bytes_sent, bytes_sent_per_cmd, send_queue_bytes) = {
            let send = self.send.lock();
            (send.total_bytes, send.bytes_per_cmd.clone(), send.counter.get())
        };
        let (bytes_recv, bytes_recv_per_cmd, avg_recv_bandwidth) = {
            let recv = self.recv.lock();
            (
                recv.total_bytes,
                recv.bytes_per_cmd.clone(),
                recv.bandwidth.average(),
            )
        };
        let (ping_time, min_ping, ping_wait) = {
            let ping = self.ping.lock();
            let wait = if ping.nonce_sent != 0 {
                ping.started.map(|s| s.elapsed())
            } else {
                None
            };
            (ping.last, ping.min, wait)
        };
        let filter = self.relay_filter();
        NodeStats {
            id: self.id,
            addr: self.addr,
            addr_name: self.addr_name.clone(),
            conn_type: self.conn_type,
            state: self.state(),
            services: self.services().bits(),
            version: self.version(),
            subver: self.subver(),
            start_height: self.start_height(),
            connected_time: self.connected_time,
            last_send: self.last_send(),
            last_recv: self.last_recv(),
            bytes_sent,
            bytes_recv,
            bytes_sent_per_cmd,
            bytes_recv_per_cmd,
            ping_time_ms: ping_time.map(|d| d.as_millis() as u64),
            min_ping_ms: min_ping.map(|d| d.as_millis() as u64),
            ping_wait_ms: ping_wait.map(|d| d.as_millis() as u64),
            whitelisted: self.whitelisted,
            ban_score: self.ban_score(),
            send_queue_bytes,
            process_queue_bytes: self.process_queue_bytes(),
            avg_recv_bandwidth,
            pause_send: self.is_send_paused(),
            pause_recv: self.is_recv_paused(),
            relay_txes: filter.relay_txes,
            fee_filter: filter.fee_filter,
            bloom_filter: filter.bloom.is_some(),
            send_cmpct: self.send_cmpct.load(Ordering::Acquire),
            async_tasks: 0,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id.0)
            .field("addr", &self.addr)
            .field("conn_type", &self.conn_type)
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time statistics for one peer
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub addr_name: String,
    pub conn_type: ConnectionType,
    pub state: PeerState,
    pub services: u64,
    pub version: i32,
    pub subver: String,
    pub start_height: i32,
    pub connected_time: i64,
    pub last_send: i64,
    pub last_recv: i64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub bytes_sent_per_cmd: BTreeMap<String, u64>,
    pub bytes_recv_per_cmd: BTreeMap<String, u64>,
    pub ping_time_ms: Option<u64>,
    pub min_ping_ms: Option<u64>,
    pub ping_wait_ms: Option<u64>,
    pub whitelisted: bool,
    pub ban_score: u32,
    pub send_queue_bytes: u64,
    pub process_queue_bytes: u64,
    /// Bytes per second averaged over the last minute
    pub avg_recv_bandwidth: f64,
    pub pause_send: bool,
    pub pause_recv: bool,
    pub relay_txes: bool,
    pub fee_filter: i64,
    pub bloom_filter: bool,
    /// Peer asked for compact block announcements
    pub send_cmpct: bool,
    /// Outstanding async tasks for this peer
    pub async_tasks: usize,
}
