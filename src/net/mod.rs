//! Peer state and the policies around it
//!
//! This module provides:
//! - Per-connection peer state with send/receive queues
//! - Ask-for tracking, bandwidth sampling and the outbound limiter
//! - Inbound eviction and the ban/whitelist store
//! - The peer registry with deferred release
//! - Collaborator interfaces and the default address manager

pub mod addrman;
pub mod askfor;
pub mod bandwidth;
pub mod banman;
pub mod bloom;
pub mod config;
pub mod counters;
pub mod error;
pub mod events;
pub mod eviction;
pub mod interfaces;
pub mod interrupt;
pub mod netaddr;
pub mod peer;
pub mod registry;

pub use addrman::AddrManager;
pub use askfor::{AskFor, AskForOutcome, AskForTracker};
pub use bandwidth::{BandwidthMeter, OutboundLimiter, UploadTargetStatus};
pub use banman::{
    BanEntry, BanManager, BanMap, BanReason, BanStorage, BanStoreError, JsonBanStorage,
    MemoryBanStorage,
};
pub use bloom::{BloomFilter, RollingBloomFilter};
pub use config::{NetConfig, Network};
pub use counters::{NetCounters, NetTotals};
pub use error::{NetError, NetResult};
pub use events::{EventReceiver, NetEvent};
pub use eviction::{select_node_to_evict, EvictionCandidate};
pub use interfaces::{AddressManager, MessageProcessor, NullValidator, ValidationOutcome, Validator};
pub use interrupt::{Interrupt, Signal};
pub use netaddr::SubNet;
pub use peer::{ConnectionType, NodeStats, Peer, PeerId, PeerState};
pub use registry::{PeerRef, PeerRegistry};
