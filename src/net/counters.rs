//! Global traffic counters
//!
//! [`NetCounters`] owns the process-wide aggregates. The aggregate of queued
//! send bytes is only ever changed through a [`SendQueueCounter`], which each
//! peer owns inside its send-queue lock: every increment and decrement is
//! mirrored into the aggregate, and whatever the peer still holds is released
//! when the counter is dropped with the peer.

use crate::net::bandwidth::UploadTargetStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide byte counters
#[derive(Debug, Default)]
pub struct NetCounters {
    send_queue_bytes: AtomicU64,
    total_bytes_recv: AtomicU64,
    total_bytes_sent: AtomicU64,
}

impl NetCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes queued for sending across all peers
    pub fn send_queue_bytes(&self) -> u64 {
        self.send_queue_bytes.load(Ordering::Acquire)
    }

    pub fn total_bytes_recv(&self) -> u64 {
        self.total_bytes_recv.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn record_recv(&self, bytes: u64) {
        self.total_bytes_recv.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.total_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// One peer's share of the aggregate send-queue counter
#[derive(Debug)]
pub struct SendQueueCounter {
    global: Arc<NetCounters>,
    local: u64,
}

impl SendQueueCounter {
    pub fn new(global: Arc<NetCounters>) -> Self {
        Self { global, local: 0 }
    }

    pub fn get(&self) -> u64 {
        self.local
    }

    pub fn add(&mut self, bytes: u64) {
        self.local += bytes;
        self.global
            .send_queue_bytes
            .fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub(&mut self, bytes: u64) {
        let bytes = bytes.min(self.local);
        self.local -= bytes;
        self.global
            .send_queue_bytes
            .fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl Drop for SendQueueCounter {
    fn drop(&mut self) {
        if self.local > 0 {
            self.global
                .send_queue_bytes
                .fetch_sub(self.local, Ordering::AcqRel);
        }
    }
}

/// Snapshot of global traffic
#[derive(Debug, Clone, Serialize)]
pub struct NetTotals {
    pub total_bytes_recv: u64,
    pub total_bytes_sent: u64,
    pub send_queue_bytes: u64,
    /// Milliseconds since the unix epoch when the snapshot was taken
    pub time_millis: i64,
    pub upload_target: UploadTargetStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_mirrors_peers() {
        let global = NetCounters::new();
        let mut a = SendQueueCounter::new(global.clone());
        let mut b = SendQueueCounter::new(global.clone());

        a.add(100);
        b.add(50);
        a.sub(30);
        assert_eq!(global.send_queue_bytes(), a.get() + b.get());
        assert_eq!(global.send_queue_bytes(), 120);
    }

    #[test]
    fn test_drop_releases_remaining() {
        let global = NetCounters::new();
        let mut a = SendQueueCounter::new(global.clone());
        a.add(500);
        {
            let mut b = SendQueueCounter::new(global.clone());
            b.add(250);
            assert_eq!(global.send_queue_bytes(), 750);
        }
        assert_eq!(global.send_queue_bytes(), 500);
        drop(a);
        assert_eq!(global.send_queue_bytes(), 0);
    }

    #[test]
    fn test_sub_never_underflows() {
        let global = NetCounters::new();
        let mut a = SendQueueCounter::new(global.clone());
        a.add(10);
        a.sub(20);
        assert_eq!(a.get(), 0);
        assert_eq!(global.send_queue_bytes(), 0);
    }
}
