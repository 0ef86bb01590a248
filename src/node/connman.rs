//! Connection manager
//!
//! [`Connman`] is the state every network thread shares: the peer registry,
//! ban list, outbound limiter, task pool and the collaborators.
//! [`ConnectionManager`] owns it together with the threads that drive it:
//!
//! - `p2p-socket`: readiness loop over listen and peer sockets
//! - `p2p-msghand`: message processing and send scheduling
//! - `p2p-opencon`: automatic outbound and feeler connections
//! - `p2p-addcon`: manually added nodes
//! - `p2p-dnsseed`: one-shot seed bootstrap

use crate::net::addrman::AddrManager;
use crate::net::askfor::AskForTracker;
use crate::net::bandwidth::OutboundLimiter;
use crate::net::banman::{BanManager, BanMap, BanReason, BanStorage, JsonBanStorage};
use crate::net::config::NetConfig;
use crate::net::counters::{NetCounters, NetTotals};
use crate::net::error::{NetError, NetResult};
use crate::net::events::{EventBus, EventReceiver, NetEvent};
use crate::net::eviction::{select_node_to_evict, EvictionCandidate};
use crate::net::interfaces::{AddressManager, MessageProcessor, NullValidator, Validator};
use crate::net::interrupt::{Interrupt, Signal};
use crate::net::netaddr::{keyed_netgroup, SubNet};
use crate::net::peer::{ConnectionType, NodeStats, Peer, PeerId, PeerParams};
use crate::net::registry::{PeerRef, PeerRegistry};
use crate::node::processing::NetProcessor;
use crate::node::{dialer, handler, seeds, socket_loop};
use crate::protocol::message::OutboundMessage;
use crate::protocol::inventory::InvItem;
use crate::task::AsyncTaskPool;
use mio::net::TcpStream;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// File descriptors reserved for everything but peer sockets
pub const MIN_CORE_FILEDESCRIPTORS: u64 = 150;

/// Time allowed for an outbound TCP connect
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the ban list and address table are written out
pub const DUMP_ADDRESSES_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Tokens below this belong to listen sockets
pub(crate) const PEER_TOKEN_BASE: usize = 1024;

/// Which connections [`Connman::get_node_count`] counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    All,
    Inbound,
    Outbound,
}

/// Status of one manually added node
#[derive(Debug, Clone, Serialize)]
pub struct AddedNodeInfo {
    pub node: String,
    pub connected: bool,
    pub addr: Option<SocketAddr>,
    pub inbound: bool,
}

// =============================================================================
// Connman
// =============================================================================

/// State shared by the network threads
pub struct Connman {
    config: NetConfig,
    peers: PeerRegistry,
    counters: Arc<NetCounters>,
    ask_for: Arc<AskForTracker>,
    bans: BanManager,
    addrman: Arc<dyn AddressManager>,
    validator: Arc<dyn Validator>,
    processor: Arc<dyn MessageProcessor>,
    limiter: OutboundLimiter,
    tasks: AsyncTaskPool,
    events: EventBus,
    event_rx: Mutex<Option<EventReceiver>>,
    added_nodes: Mutex<Vec<String>>,
    network_active: AtomicBool,
    interrupt: Interrupt,
    handler_wake: Signal,
    netgroup_secret: u64,
    this: Weak<Connman>,
}

impl Connman {
    pub fn new(
        config: NetConfig,
        bans: BanManager,
        addrman: Arc<dyn AddressManager>,
        validator: Arc<dyn Validator>,
        processor: Arc<dyn MessageProcessor>,
    ) -> NetResult<Arc<Self>> {
        config.validate()?;
        let tasks = AsyncTaskPool::new(config.async_task_threads, config.async_task_soft_limit)?;
        let limiter = OutboundLimiter::new(
            config.max_outbound_target,
            config.max_outbound_timeframe(),
            config.max_block_size,
        );
        for subnet in &config.whitelist {
            bans.add_whitelist(*subnet);
        }
        let (events, event_rx) = EventBus::new();
        let network_active = AtomicBool::new(config.network_active);
        let added_nodes = Mutex::new(config.added_nodes.clone());
        let ask_for = AskForTracker::new(config.ask_for_global_cap);

        Ok(Arc::new_cyclic(|this| Self {
            config,
            peers: PeerRegistry::new(),
            counters: NetCounters::new(),
            ask_for,
            bans,
            addrman,
            validator,
            processor,
            limiter,
            tasks,
            events,
            event_rx: Mutex::new(Some(event_rx)),
            added_nodes,
            network_active,
            interrupt: Interrupt::new(),
            handler_wake: Signal::new(),
            netgroup_secret: rand::random(),
            this: this.clone(),
        }))
    }

    /// A strong handle to ourselves, for work that outlives a borrow
    pub fn handle(&self) -> Option<Arc<Connman>> {
        self.this.upgrade()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn bans(&self) -> &BanManager {
        &self.bans
    }

    pub fn addrman(&self) -> &Arc<dyn AddressManager> {
        &self.addrman
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    pub fn processor(&self) -> Arc<dyn MessageProcessor> {
        self.processor.clone()
    }

    pub fn limiter(&self) -> &OutboundLimiter {
        &self.limiter
    }

    pub fn tasks(&self) -> &AsyncTaskPool {
        &self.tasks
    }

    pub fn counters(&self) -> &Arc<NetCounters> {
        &self.counters
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.event_rx.lock().take()
    }

    pub fn publish(&self, event: NetEvent) {
        self.events.publish(event);
    }

    // =========================================================================
    // Thread coordination
    // =========================================================================

    pub fn interrupt(&self) {
        self.interrupt.trigger();
        self.handler_wake.notify();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub(crate) fn interrupt_handle(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Sleep on the interrupt. Returns `false` if interrupted.
    pub(crate) fn sleep(&self, dur: Duration) -> bool {
        self.interrupt.sleep_for(dur)
    }

    pub fn wake_handler(&self) {
        self.handler_wake.notify();
    }

    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        self.handler_wake.wait_timeout(timeout);
    }

    // =========================================================================
    // Connections
    // =========================================================================

    pub fn network_active(&self) -> bool {
        self.network_active.load(Ordering::Acquire)
    }

    /// Enable or disable networking; disabling drops every connection
    pub fn set_network_active(&self, active: bool) {
        let was = self.network_active.swap(active, Ordering::AcqRel);
        if was == active {
            return;
        }
        log::info!("set_network_active: {}", active);
        if !active {
            for peer in self.peers.snapshot() {
                peer.mark_disconnect("network disabled");
            }
        }
    }

    /// Decide whether to take an inbound connection, evicting an existing
    /// inbound peer if every slot is full. Rejected sockets are dropped.
    pub fn admit_inbound(&self, socket: Option<TcpStream>, addr: SocketAddr) -> Option<PeerRef> {
        if !self.network_active() {
            log::debug!("connection from {} dropped: not accepting new connections", addr);
            return None;
        }
        let ip = addr.ip();
        let whitelisted = self.bans.is_whitelisted(&ip);
        if !whitelisted && self.bans.is_banned(&ip) {
            log::debug!("connection from {} dropped (banned)", addr);
            return None;
        }

        let inbound = self.peers.count_type(ConnectionType::Inbound);
        if inbound >= self.config.max_inbound() && !self.attempt_to_evict() {
            log::debug!("failed to find an eviction candidate - connection from {} dropped (full)", addr);
            return None;
        }

        Some(self.add_peer(socket, addr, addr.to_string(), ConnectionType::Inbound, whitelisted))
    }

    /// Evict one inbound peer. Returns whether one was found.
    pub fn attempt_to_evict(&self) -> bool {
        let candidates: Vec<EvictionCandidate> = self
            .peers
            .snapshot()
            .iter()
            .filter(|p| p.is_inbound() && !p.whitelisted && !p.is_disconnecting())
            .map(|p| {
                let filter = p.relay_filter();
                EvictionCandidate {
                    id: p.id,
                    connected: p.connected_at,
                    min_ping: p.min_ping(),
                    last_block_time: p.last_block_time(),
                    last_tx_time: p.last_tx_time(),
                    relevant_services: p.services().has_relevant(),
                    relay_txes: filter.relay_txes,
                    bloom_filter: filter.bloom.is_some(),
                    addr: p.addr,
                    keyed_netgroup: p.keyed_netgroup,
                }
            })
            .collect();

        let Some(id) = select_node_to_evict(candidates) else {
            return false;
        };
        match self.peers.get(id) {
            Some(peer) => {
                log::info!("evicting {} {} to make room", peer.id, peer.addr);
                peer.mark_disconnect("evicted")
            }
            None => false,
        }
    }

    /// Open an outbound connection to a resolved address
    pub fn open_connection(
        &self,
        target: SocketAddr,
        name: Option<&str>,
        conn_type: ConnectionType,
    ) -> NetResult<PeerRef> {
        if self.is_interrupted() {
            return Err(NetError::NotRunning);
        }
        if !self.network_active() {
            return Err(NetError::ConnectionFailed("network is disabled".into()));
        }
        if self.peers.find_by_addr(&target).is_some() {
            return Err(NetError::AlreadyConnected(target.to_string()));
        }
        if let Some(name) = name {
            if self.peers.find_by_name(name).is_some() {
                return Err(NetError::AlreadyConnected(name.to_string()));
            }
        }
        let ip = target.ip();
        let whitelisted = self.bans.is_whitelisted(&ip);
        if conn_type != ConnectionType::Manual && self.bans.is_banned(&ip) {
            return Err(NetError::Banned(target.to_string()));
        }

        log::debug!("trying connection {}", target);
        let stream = std::net::TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
            .map_err(|e| NetError::ConnectionFailed(format!("{}: {}", target, e)))?;
        stream.set_nonblocking(true)?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("unable to set TCP_NODELAY for {}: {}", target, e);
        }
        let stream = TcpStream::from_std(stream);

        let name = name.map(str::to_string).unwrap_or_else(|| target.to_string());
        Ok(self.add_peer(Some(stream), target, name, conn_type, whitelisted))
    }

    /// Resolve `name` and connect to the first address that answers
    pub fn connect_node(&self, name: &str, conn_type: ConnectionType) -> NetResult<PeerRef> {
        let addrs = seeds::resolve(name, self.config.default_port())?;
        let mut last_err = NetError::InvalidAddress(name.to_string());
        for addr in addrs {
            match self.open_connection(addr, Some(name), conn_type) {
                Ok(peer) => return Ok(peer),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub(crate) fn add_peer(
        &self,
        socket: Option<TcpStream>,
        addr: SocketAddr,
        addr_name: String,
        conn_type: ConnectionType,
        whitelisted: bool,
    ) -> PeerRef {
        let params = PeerParams {
            id: self.peers.next_id(),
            addr,
            addr_name,
            conn_type,
            whitelisted,
            keyed_netgroup: keyed_netgroup(&addr.ip(), self.netgroup_secret),
            local_nonce: rand::random::<u64>().max(1),
            magic: self.config.magic(),
            limits: self.config.payload_limits(),
        };
        let peer = Arc::new(Peer::new(
            params,
            socket,
            self.counters.clone(),
            self.ask_for.clone(),
        ));
        self.peers.insert(peer.clone());
        log::info!("{} {} connected ({:?})", peer.id, peer.addr, conn_type);

        self.events.publish(NetEvent::PeerConnected {
            id: peer.id,
            addr,
            conn_type,
        });
        self.processor.initialize_peer(self, &peer);
        self.wake_handler();
        peer
    }

    /// Move flagged peers out of the registry, apply pending bans and
    /// release whatever nobody references any more. Returns the ids
    /// removed from the registry.
    pub fn release_disconnected(&self, registry: Option<&mio::Registry>) -> Vec<PeerId> {
        let gone = self.peers.collect_disconnected(registry);
        let ids = self.finalize_peers(&gone);
        drop(gone);

        let reaped = self.peers.reap();
        if !reaped.is_empty() {
            log::debug!("released {} peers", reaped.len());
        }
        ids
    }

    fn finalize_peers(&self, gone: &[PeerRef]) -> Vec<PeerId> {
        let mut ids = Vec::with_capacity(gone.len());
        for peer in gone {
            if peer.take_should_ban() {
                let subnet = SubNet::single(peer.addr.ip());
                if let Err(e) = self.ban(subnet, BanReason::NodeMisbehaving, None, false) {
                    log::warn!("failed to ban {}: {}", peer.addr, e);
                }
            }
            self.tasks.cancel_peer(peer.id);
            self.processor.finalize_peer(self, peer);
            self.events.publish(NetEvent::PeerDisconnected {
                id: peer.id,
                addr: peer.addr,
            });
            log::info!("{} {} disconnected", peer.id, peer.addr);
            ids.push(peer.id);
        }
        ids
    }

    /// Disconnect every peer and release them
    pub(crate) fn disconnect_all(&self) {
        let gone = self.peers.disconnect_all(None);
        self.finalize_peers(&gone);
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue a message for a peer, writing immediately if the queue was idle
    pub fn push_message(&self, peer: &Peer, msg: OutboundMessage) {
        if peer.is_disconnecting() {
            return;
        }
        let command = msg.command.clone();
        let (size, was_empty) = peer.push_message(msg, self.config.send_buffer_size);
        log::trace!("sending {} ({} bytes) {}", command, size, peer.id);
        if was_empty {
            self.flush_peer(peer);
        }
    }

    pub fn push_message_to(&self, id: PeerId, msg: OutboundMessage) -> NetResult<()> {
        let peer = self.peers.get(id).ok_or(NetError::PeerNotFound(id))?;
        self.push_message(&peer, msg);
        Ok(())
    }

    /// Write as much queued data as the socket takes
    pub(crate) fn flush_peer(&self, peer: &Peer) -> Option<crate::net::peer::SendProgress> {
        match peer.send_data(self.config.send_buffer_size) {
            Ok(progress) => {
                if progress.written > 0 {
                    let written = progress.written as u64;
                    self.counters.record_sent(written);
                    self.limiter.record_sent(written, Instant::now());
                }
                Some(progress)
            }
            Err(e) => {
                log::debug!("{} {}: socket send error: {}", peer.id, peer.addr, e);
                peer.mark_disconnect("send error");
                None
            }
        }
    }

    /// Whether queued send data is high enough to hold back block responses
    pub fn block_responses_paused(&self) -> bool {
        self.counters.send_queue_bytes() > self.config.block_response_pause_threshold()
    }

    /// Queue an inventory announcement to every established peer. Returns
    /// how many peers queued it.
    pub fn relay_inventory(&self, item: InvItem, fee_rate: Option<i64>) -> usize {
        self.peers
            .snapshot()
            .iter()
            .filter(|p| p.is_established())
            .filter(|p| p.push_inventory(item, fee_rate))
            .count()
    }

    // =========================================================================
    // Misbehaviour and bans
    // =========================================================================

    /// Charge a peer with misbehaviour; crossing the threshold disconnects
    /// and bans it unless it is whitelisted
    pub fn misbehaving(&self, peer: &Peer, score: u32, reason: &str) {
        if score == 0 {
            return;
        }
        let threshold = self.config.ban_score_threshold;
        let total = peer.misbehave(score, threshold);
        let before = total - score;
        if total >= threshold && before < threshold {
            log::info!(
                "{} {}: misbehaving ({} -> {}) BAN THRESHOLD EXCEEDED: {}",
                peer.id,
                peer.addr,
                before,
                total,
                reason
            );
            if peer.whitelisted {
                log::warn!("not punishing whitelisted peer {} {}", peer.id, peer.addr);
            } else {
                peer.mark_disconnect("ban score exceeded");
            }
        } else {
            log::info!(
                "{} {}: misbehaving ({} -> {}): {}",
                peer.id,
                peer.addr,
                before,
                total,
                reason
            );
        }
    }

    /// Ban a subnet and drop every connection inside it
    pub fn ban(
        &self,
        subnet: SubNet,
        reason: BanReason,
        duration: Option<i64>,
        absolute: bool,
    ) -> NetResult<()> {
        self.bans.ban(subnet, reason, duration, absolute)?;
        for peer in self.peers.snapshot() {
            if subnet.contains(&peer.addr.ip()) {
                peer.mark_disconnect("banned");
            }
        }
        self.events.publish(NetEvent::BanListChanged);
        Ok(())
    }

    /// Lift a ban. Returns whether the subnet was banned.
    pub fn unban(&self, subnet: &SubNet) -> NetResult<bool> {
        let removed = self.bans.unban(subnet)?;
        if removed {
            self.events.publish(NetEvent::BanListChanged);
        }
        Ok(removed)
    }

    pub fn clear_banned(&self) -> NetResult<()> {
        self.bans.clear_banned()?;
        self.events.publish(NetEvent::BanListChanged);
        Ok(())
    }

    pub fn list_banned(&self) -> BanMap {
        self.bans.list_banned()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.bans.is_banned(ip)
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub fn disconnect_node(&self, id: PeerId) -> NetResult<()> {
        let peer = self.peers.get(id).ok_or(NetError::PeerNotFound(id))?;
        peer.mark_disconnect("disconnect requested");
        Ok(())
    }

    /// Disconnect by `ip:port` or by the name the connection was opened with
    pub fn disconnect_node_by_addr(&self, addr: &str) -> NetResult<()> {
        let peer = addr
            .parse::<SocketAddr>()
            .ok()
            .and_then(|a| self.peers.find_by_addr(&a))
            .or_else(|| self.peers.find_by_name(addr))
            .ok_or_else(|| NetError::InvalidAddress(format!("node not connected: {}", addr)))?;
        peer.mark_disconnect("disconnect requested");
        Ok(())
    }

    pub fn add_node(&self, node: &str) -> NetResult<()> {
        let mut added = self.added_nodes.lock();
        if added.iter().any(|n| n == node) {
            return Err(NetError::AlreadyAdded(node.to_string()));
        }
        added.push(node.to_string());
        log::info!("added node {}", node);
        Ok(())
    }

    pub fn remove_node(&self, node: &str) -> NetResult<()> {
        let mut added = self.added_nodes.lock();
        let before = added.len();
        added.retain(|n| n != node);
        if added.len() == before {
            return Err(NetError::NotAdded(node.to_string()));
        }
        log::info!("removed node {}", node);
        Ok(())
    }

    pub fn get_added_node_info(&self) -> Vec<AddedNodeInfo> {
        let added = self.added_nodes.lock().clone();
        added
            .into_iter()
            .map(|node| {
                let peer = self.peers.find_by_name(&node).or_else(|| {
                    node.parse::<SocketAddr>()
                        .ok()
                        .and_then(|a| self.peers.find_by_addr(&a))
                });
                AddedNodeInfo {
                    connected: peer.is_some(),
                    addr: peer.as_ref().map(|p| p.addr),
                    inbound: peer.as_ref().map(|p| p.is_inbound()).unwrap_or(false),
                    node,
                }
            })
            .collect()
    }

    pub fn get_node_count(&self, direction: ConnectionDirection) -> usize {
        match direction {
            ConnectionDirection::All => self.peers.count(|_| true),
            ConnectionDirection::Inbound => self.peers.count(|p| p.is_inbound()),
            ConnectionDirection::Outbound => self.peers.count(|p| !p.is_inbound()),
        }
    }

    pub fn get_node_stats(&self) -> Vec<NodeStats> {
        let tasks = self.tasks.task_counts();
        self.peers
            .snapshot()
            .iter()
            .map(|p| {
                let mut stats = p.stats();
                stats.async_tasks = tasks.get(&p.id).copied().unwrap_or(0);
                stats
            })
            .collect()
    }

    pub fn get_totals(&self) -> NetTotals {
        NetTotals {
            total_bytes_recv: self.counters.total_bytes_recv(),
            total_bytes_sent: self.counters.total_bytes_sent(),
            send_queue_bytes: self.counters.send_queue_bytes(),
            time_millis: chrono::Utc::now().timestamp_millis(),
            upload_target: self.limiter.status(Instant::now()),
        }
    }

    pub fn set_max_outbound_target(&self, bytes: u64) {
        self.limiter.set_target(bytes);
    }

    pub(crate) fn added_nodes(&self) -> Vec<String> {
        self.added_nodes.lock().clone()
    }

    /// Persist the ban list and the address table
    pub fn flush(&self) {
        if let Err(e) = self.bans.flush() {
            log::warn!("failed to write ban list: {}", e);
        }
        if let Err(e) = self.addrman.flush() {
            log::warn!("failed to write address table: {}", e);
        }
    }
}

impl std::fmt::Debug for Connman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connman")
            .field("network", &self.config.network)
            .field("peers", &self.peers.len())
            .finish()
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owner of the shared [`Connman`] and its threads. Dereferences to
/// [`Connman`] for the administrative API.
pub struct ConnectionManager {
    connman: Arc<Connman>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    running: AtomicBool,
}

impl ConnectionManager {
    /// Create with the default collaborators, persisting to `data_dir`
    pub fn new(config: NetConfig) -> NetResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: NetConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new(config)
    }

    pub fn connman(&self) -> &Arc<Connman> {
        &self.connman
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Addresses the listen sockets are bound to
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    /// Bind the listen sockets and start the network threads.
    ///
    /// A stopped manager can't be started again.
    pub fn start(&self) -> NetResult<()> {
        if self.connman.tasks.is_shut_down() {
            return Err(NetError::NotRunning);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyRunning);
        }
        let result = self.start_threads();
        if result.is_err() {
            self.connman.interrupt();
            self.join_threads();
            self.running.store(false, Ordering::Release);
        }
        result
    }

    fn start_threads(&self) -> NetResult<()> {
        let config = &self.connman.config;

        let required = config.max_connections as u64 + MIN_CORE_FILEDESCRIPTORS + config.max_added as u64;
        let available = raise_fd_limit(required);
        if available < MIN_CORE_FILEDESCRIPTORS {
            log::error!("not enough file descriptors available: {}", available);
            return Err(NetError::FdLimit {
                available,
                required: MIN_CORE_FILEDESCRIPTORS,
            });
        }
        if available < required {
            log::warn!(
                "only {} file descriptors available, {} wanted for {} connections",
                available,
                required,
                config.max_connections
            );
        }

        self.connman.interrupt.reset();
        let poll = mio::Poll::new()?;
        let listeners = if config.listen {
            bind_listeners(config)?
        } else {
            Vec::new()
        };
        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut listeners = listeners;
        for (i, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, mio::Token(i), mio::Interest::READABLE)?;
            local_addrs.push(listener.local_addr()?);
        }
        *self.local_addrs.lock() = local_addrs;

        let connman = self.connman.clone();
        self.spawn("p2p-socket", move || socket_loop::run(connman, poll, listeners))?;

        let connman = self.connman.clone();
        self.spawn("p2p-msghand", move || handler::run(connman))?;

        let connman = self.connman.clone();
        self.spawn("p2p-opencon", move || dialer::run_outbound(connman))?;

        let connman = self.connman.clone();
        self.spawn("p2p-addcon", move || dialer::run_added(connman))?;

        if config.dns_seed && config.connect_only.is_empty() && !config.dns_seeds.is_empty() {
            let connman = self.connman.clone();
            self.spawn("p2p-dnsseed", move || seeds::run(connman))?;
        }

        log::info!(
            "network started on {:?} ({} listen sockets)",
            config.network,
            self.local_addrs.lock().len()
        );
        Ok(())
    }

    fn spawn<F>(&self, name: &str, body: F) -> NetResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Ask every thread to stop without waiting for them
    pub fn interrupt(&self) {
        self.connman.interrupt();
    }

    /// Stop the threads, drop every connection, drain the task pool and
    /// persist state
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("stopping network");
        self.connman.interrupt();
        self.join_threads();

        self.connman.disconnect_all();
        self.connman.tasks.shutdown();
        self.connman.flush();
        log::info!("network stopped");
    }

    fn join_threads(&self) {
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or("p2p").to_string();
            if handle.join().is_err() {
                log::error!("thread {} panicked", name);
            }
        }
    }
}

impl Deref for ConnectionManager {
    type Target = Connman;

    fn deref(&self) -> &Connman {
        &self.connman
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listeners(config: &NetConfig) -> NetResult<Vec<mio::net::TcpListener>> {
    let addrs = if config.bind.is_empty() {
        vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.default_port(),
        )]
    } else {
        config.bind.clone()
    };
    if addrs.len() >= PEER_TOKEN_BASE {
        return Err(NetError::Config("too many bind addresses".into()));
    }

    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = mio::net::TcpListener::bind(addr).map_err(|source| {
            log::error!("unable to bind to {}: {}", addr, source);
            NetError::Bind { addr, source }
        })?;
        log::info!("Bound to {}", addr);
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Raise the open file limit towards `wanted`. Returns the limit in effect.
#[cfg(unix)]
pub fn raise_fd_limit(wanted: u64) -> u64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return wanted;
    }
    if (limit.rlim_cur as u64) < wanted {
        limit.rlim_cur = (wanted as libc::rlim_t).min(limit.rlim_max);
        // SAFETY: `limit` is a valid rlimit read back from the kernel
        unsafe {
            libc::setrlimit(libc::RLIMIT_NOFILE, &limit);
            libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit);
        }
    }
    limit.rlim_cur as u64
}

#[cfg(not(unix))]
pub fn raise_fd_limit(wanted: u64) -> u64 {
    wanted
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`ConnectionManager`] with custom collaborators
pub struct ConnectionManagerBuilder {
    config: NetConfig,
    validator: Option<Arc<dyn Validator>>,
    addrman: Option<Arc<dyn AddressManager>>,
    ban_storage: Option<Box<dyn BanStorage>>,
    processor: Option<Arc<dyn MessageProcessor>>,
}

impl ConnectionManagerBuilder {
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            validator: None,
            addrman: None,
            ban_storage: None,
            processor: None,
        }
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn address_manager(mut self, addrman: Arc<dyn AddressManager>) -> Self {
        self.addrman = Some(addrman);
        self
    }

    pub fn ban_storage(mut self, storage: Box<dyn BanStorage>) -> Self {
        self.ban_storage = Some(storage);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn build(self) -> NetResult<ConnectionManager> {
        let config = self.config;
        config.validate()?;

        let storage = match self.ban_storage {
            Some(storage) => storage,
            None => {
                std::fs::create_dir_all(&config.data_dir)?;
                Box::new(JsonBanStorage::new(config.banlist_path()))
            }
        };
        let addrman: Arc<dyn AddressManager> = match self.addrman {
            Some(addrman) => addrman,
            None => {
                std::fs::create_dir_all(&config.data_dir)?;
                Arc::new(AddrManager::with_file(config.data_dir.join("peers.json"))?)
            }
        };
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(NullValidator));
        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(NetProcessor::new()));

        let bans = BanManager::new(storage, config.whitelist.clone(), config.ban_time_secs)?;
        let connman = Connman::new(config, bans, addrman, validator, processor)?;
        Ok(ConnectionManager {
            connman,
            threads: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
