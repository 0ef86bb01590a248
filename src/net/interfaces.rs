//! Collaborator interfaces
//!
//! The networking core doesn't validate transactions or blocks, doesn't know
//! the address table's storage format and doesn't interpret application
//! messages. Those live behind these traits.

use crate::net::interrupt::Interrupt;
use crate::net::peer::{Peer, PeerId};
use crate::net::registry::PeerRef;
use crate::node::Connman;
use crate::protocol::address::NetAddr;
use crate::protocol::inventory::{Hash256, InvItem};
use crate::task::CancellationToken;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};

/// Verdict of a validation callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    /// Invalid. A non-zero `ban_score` is charged to the sending peer.
    Rejected { reason: String, ban_score: u32 },
    /// Missing parents; may become valid later
    Orphan,
    AlreadyKnown,
    /// Could not decide now (e.g. cancelled); ask again later
    Retry,
}

/// Transaction and block validation, plus access to data we can serve
pub trait Validator: Send + Sync {
    /// Validate a transaction inline on the message handler thread
    fn validate_transaction(&self, peer: PeerId, hash: &Hash256, payload: &Bytes)
        -> ValidationOutcome;

    /// Validate a block on the async task pool. Implementations should poll
    /// `cancel` and give up with [`ValidationOutcome::Retry`] once cancelled.
    fn validate_block(
        &self,
        peer: PeerId,
        hash: &Hash256,
        payload: &Bytes,
        cancel: &CancellationToken,
    ) -> ValidationOutcome;

    /// Whether we already have an announced item
    fn already_have(&self, item: &InvItem) -> bool;

    /// Whether serving `item` counts as historical block serving, which
    /// stops once the outbound target is reached
    fn is_historical(&self, _item: &InvItem) -> bool {
        false
    }

    /// Serialized item for a getdata response; `None` sends notfound
    fn fetch_inventory(&self, item: &InvItem) -> Option<Bytes>;

    /// Fee rate of a transaction in satoshis per kB, for fee filters
    fn fee_rate(&self, _hash: &Hash256) -> Option<i64> {
        None
    }

    /// Our best chain height, advertised in version messages
    fn best_height(&self) -> i32 {
        0
    }
}

/// Validator that accepts everything and serves nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullValidator;

impl Validator for NullValidator {
    fn validate_transaction(&self, _: PeerId, _: &Hash256, _: &Bytes) -> ValidationOutcome {
        ValidationOutcome::Accepted
    }

    fn validate_block(
        &self,
        _: PeerId,
        _: &Hash256,
        _: &Bytes,
        _: &CancellationToken,
    ) -> ValidationOutcome {
        ValidationOutcome::Accepted
    }

    fn already_have(&self, _: &InvItem) -> bool {
        false
    }

    fn fetch_inventory(&self, _: &InvItem) -> Option<Bytes> {
        None
    }
}

/// Source of outbound candidates and sink for learned addresses
pub trait AddressManager: Send + Sync {
    /// Add addresses learned from `source`. Returns how many were new.
    fn add(&self, addrs: &[NetAddr], source: Option<IpAddr>) -> usize;

    /// Pick an address to dial; `new_only` biases towards untried entries
    /// (used for feelers)
    fn select(&self, new_only: bool) -> Option<NetAddr>;

    /// A connection attempt is being made
    fn attempt(&self, addr: &SocketAddr);

    /// A connection completed its handshake
    fn good(&self, addr: &SocketAddr);

    /// Refresh the last-seen time of a connected peer
    fn connected(&self, addr: &SocketAddr);

    /// The connection to `addr` went away
    fn disconnected(&self, _addr: &SocketAddr) {}

    /// Addresses to share in response to getaddr
    fn get_addr(&self, max: usize) -> Vec<NetAddr>;

    fn size(&self) -> usize;

    /// Persist the table, if the implementation keeps one
    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Per-peer message processing, driven by the message handler thread
pub trait MessageProcessor: Send + Sync {
    /// A new connection was registered; outbound peers send version here
    fn initialize_peer(&self, connman: &Connman, peer: &PeerRef);

    /// Process received messages. Returns whether more work is pending.
    fn process_messages(&self, connman: &Connman, peer: &PeerRef, interrupt: &Interrupt) -> bool;

    /// Queue outgoing traffic: pings, announcements, getdata
    fn send_messages(&self, connman: &Connman, peer: &PeerRef);

    /// The peer is being released
    fn finalize_peer(&self, connman: &Connman, peer: &Peer);
}
