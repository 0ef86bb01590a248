//! Mini-P2P: the peer-to-peer networking core of a Bitcoin-style full node
//!
//! This crate provides:
//! - Wire message framing with basic and extended (64-bit length) headers
//! - Per-peer state with bounded send/receive queues and flow control
//! - Inbound eviction, ban/whitelist store and misbehaviour scoring
//! - Outbound upload limiting and per-peer bandwidth sampling
//! - A bounded async task pool with cancellation and time budgets
//! - A connection manager running the socket, message and dialer threads
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_p2p::net::{NetConfig, Network};
//! use mini_p2p::node::ConnectionManager;
//!
//! let config = NetConfig::for_network(Network::Regtest);
//! let manager = ConnectionManager::new(config).unwrap();
//! manager.start().unwrap();
//!
//! for stats in manager.get_node_stats() {
//!     println!("{} {} {:?}", stats.id, stats.addr, stats.state);
//! }
//!
//! manager.stop();
//! ```

pub mod crypto;
pub mod net;
pub mod node;
pub mod protocol;
pub mod task;

// Re-export commonly used types
pub use net::{
    AddrManager, AddressManager, BanManager, BanReason, ConnectionType, MessageProcessor,
    NetConfig, NetError, NetEvent, NetResult, NetTotals, Network, NodeStats, Peer, PeerId,
    SubNet, ValidationOutcome, Validator,
};
pub use node::{
    AddedNodeInfo, ConnectionDirection, ConnectionManager, ConnectionManagerBuilder, Connman,
    NetProcessor,
};
pub use protocol::{Hash256, InvItem, InvKind, NetMessage, OutboundMessage, ServiceFlags};
pub use task::{AsyncTaskPool, CancellationSource, CancellationToken, TimedCancellationSource};
