//! Lifecycle notifications
//!
//! The connection manager publishes these on an unbounded channel so that
//! observers never block the network threads.

use crate::net::peer::{ConnectionType, PeerId};
use crate::protocol::services::ServiceFlags;
use std::net::SocketAddr;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    PeerConnected {
        id: PeerId,
        addr: SocketAddr,
        conn_type: ConnectionType,
    },
    HandshakeComplete {
        id: PeerId,
        version: i32,
        services: ServiceFlags,
        start_height: i32,
        user_agent: String,
    },
    PeerDisconnected {
        id: PeerId,
        addr: SocketAddr,
    },
    BanListChanged,
}

pub type EventSender = mpsc::UnboundedSender<NetEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NetEvent>;

/// Publishing side of the event channel. Sending never fails: once the
/// receiver is gone events are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: EventSender,
}

impl EventBus {
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: NetEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_receive() {
        let (bus, mut rx) = EventBus::new();
        bus.publish(NetEvent::BanListChanged);
        assert_eq!(rx.try_recv().unwrap(), NetEvent::BanListChanged);
    }

    #[test]
    fn test_publish_without_receiver() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.publish(NetEvent::BanListChanged);
    }
}
