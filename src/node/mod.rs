//! Connection manager and its threads
//!
//! This module provides:
//! - [`ConnectionManager`] and the shared [`Connman`] state
//! - The socket readiness loop and the message handler thread
//! - Outbound, added-node and seed connection threads
//! - [`NetProcessor`], the built-in handshake and message processor

pub mod connman;
pub mod dialer;
pub mod handler;
pub mod processing;
pub mod seeds;
pub mod socket_loop;

pub use connman::{
    raise_fd_limit, AddedNodeInfo, ConnectionDirection, ConnectionManager,
    ConnectionManagerBuilder, Connman,
};
pub use processing::NetProcessor;
