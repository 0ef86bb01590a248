//! Ask-for tracking
//!
//! When a peer announces an item we don't have, we schedule a getdata for it.
//! Each peer keeps its own schedule ([`AskFor`]), indexed both by hash and by
//! the time the request becomes due. A shared [`AskForTracker`] remembers when
//! each hash was last requested from anyone, so that a second peer announcing
//! the same item is only asked once the first request had time to complete.

use crate::protocol::inventory::{Hash256, InvItem, MAX_INV_SZ};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum time between two requests for the same item
pub const GETDATA_INTERVAL: Duration = Duration::from_secs(60);

/// Per-peer bound on scheduled requests
pub const MAX_ASK_FOR_PER_PEER: usize = MAX_INV_SZ;

/// Result of asking for an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskForOutcome {
    /// Request scheduled to go out at the given time
    Scheduled(Instant),
    /// An unexpired request for this item already exists for this peer
    AlreadyPending,
    /// A per-peer or global capacity limit was reached
    Dropped,
}

// =============================================================================
// Global tracker
// =============================================================================

/// Last request time for every item requested from any peer
#[derive(Debug)]
pub struct AskForTracker {
    last_request: Mutex<HashMap<Hash256, Instant>>,
    cap: usize,
}

impl AskForTracker {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            last_request: Mutex::new(HashMap::new()),
            cap,
        })
    }

    pub fn len(&self) -> usize {
        self.last_request.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the next request slot for `hash`. Returns `None` once the
    /// tracker is full.
    fn schedule(&self, hash: Hash256, now: Instant) -> Option<Instant> {
        let mut map = self.last_request.lock();
        if !map.contains_key(&hash) && map.len() >= self.cap {
            // Entries whose retry window has passed no longer constrain anything
            map.retain(|_, last| *last + GETDATA_INTERVAL > now);
            if map.len() >= self.cap {
                return None;
            }
        }
        let request_at = match map.get(&hash) {
            Some(last) => (*last + GETDATA_INTERVAL).max(now),
            None => now,
        };
        map.insert(hash, request_at);
        Some(request_at)
    }

    /// Forget an item once it arrived or nobody has it
    pub fn forget(&self, hash: &Hash256) {
        self.last_request.lock().remove(hash);
    }

    pub fn last_request(&self, hash: &Hash256) -> Option<Instant> {
        self.last_request.lock().get(hash).copied()
    }
}

// =============================================================================
// Per-peer schedule
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct AskEntry {
    item: InvItem,
    request_at: Instant,
    seq: u64,
    sent: bool,
}

impl AskEntry {
    fn retry_at(&self) -> Instant {
        self.request_at + GETDATA_INTERVAL
    }
}

/// One peer's outstanding requests
#[derive(Debug)]
pub struct AskFor {
    tracker: Arc<AskForTracker>,
    by_hash: HashMap<Hash256, AskEntry>,
    by_time: BTreeMap<(Instant, u64), Hash256>,
    next_seq: u64,
}

impl AskFor {
    pub fn new(tracker: Arc<AskForTracker>) -> Self {
        Self {
            tracker,
            by_hash: HashMap::new(),
            by_time: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Schedule a request for `item`
    pub fn ask_for(&mut self, item: InvItem, now: Instant) -> AskForOutcome {
        if let Some(entry) = self.by_hash.get(&item.hash) {
            if now < entry.retry_at() {
                return AskForOutcome::AlreadyPending;
            }
            let key = (entry.request_at, entry.seq);
            self.by_time.remove(&key);
            self.by_hash.remove(&item.hash);
        }
        if self.by_hash.len() >= MAX_ASK_FOR_PER_PEER {
            return AskForOutcome::Dropped;
        }
        let request_at = match self.tracker.schedule(item.hash, now) {
            Some(at) => at,
            None => return AskForOutcome::Dropped,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_hash.insert(
            item.hash,
            AskEntry {
                item,
                request_at,
                seq,
                sent: false,
            },
        );
        self.by_time.insert((request_at, seq), item.hash);
        AskForOutcome::Scheduled(request_at)
    }

    /// Pop every request due at `now`, oldest first. Popped entries stay in
    /// the hash index until they arrive or their retry time passes.
    pub fn take_due(&mut self, now: Instant, limit: usize) -> Vec<InvItem> {
        let mut due = Vec::new();
        while due.len() < limit {
            let key = match self.by_time.keys().next() {
                Some(key) if key.0 <= now => *key,
                _ => break,
            };
            if let Some(hash) = self.by_time.remove(&key) {
                if let Some(entry) = self.by_hash.get_mut(&hash) {
                    entry.sent = true;
                    due.push(entry.item);
                }
            }
        }
        due
    }

    /// The item arrived: drop it here and in the shared tracker
    pub fn received(&mut self, hash: &Hash256) {
        if let Some(entry) = self.by_hash.remove(hash) {
            self.by_time.remove(&(entry.request_at, entry.seq));
        }
        self.tracker.forget(hash);
    }

    /// The peer said it doesn't have the item
    pub fn not_found(&mut self, hash: &Hash256) {
        if let Some(entry) = self.by_hash.remove(hash) {
            self.by_time.remove(&(entry.request_at, entry.seq));
        }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Requests that went out and have not been answered
    pub fn in_flight(&self) -> usize {
        self.by_hash.values().filter(|e| e.sent).count()
    }

    /// Requests waiting to go out
    pub fn scheduled(&self) -> usize {
        self.by_time.len()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Drop answered-or-abandoned entries whose retry window passed
    pub fn expire(&mut self, now: Instant) {
        self.by_hash
            .retain(|_, entry| !(entry.sent && entry.retry_at() <= now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: u8) -> InvItem {
        InvItem::tx(Hash256([n; 32]))
    }

    #[test]
    fn test_duplicate_request_is_noop() {
        let tracker = AskForTracker::new(100);
        let mut ask = AskFor::new(tracker.clone());
        let now = Instant::now();

        assert_eq!(ask.ask_for(item(1), now), AskForOutcome::Scheduled(now));
        assert_eq!(
            ask.ask_for(item(1), now + Duration::from_secs(10)),
            AskForOutcome::AlreadyPending
        );
        assert_eq!(ask.len(), 1);
        assert_eq!(ask.scheduled(), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_retry_after_expiry_respects_interval() {
        let tracker = AskForTracker::new(100);
        let mut ask = AskFor::new(tracker.clone());
        let now = Instant::now();

        ask.ask_for(item(1), now);
        assert_eq!(ask.take_due(now, 10), vec![item(1)]);

        let later = now + GETDATA_INTERVAL;
        match ask.ask_for(item(1), later) {
            AskForOutcome::Scheduled(at) => assert!(at >= now + GETDATA_INTERVAL),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ask.len(), 1);
    }

    #[test]
    fn test_second_peer_waits_for_first_request() {
        let tracker = AskForTracker::new(100);
        let mut first = AskFor::new(tracker.clone());
        let mut second = AskFor::new(tracker.clone());
        let now = Instant::now();

        first.ask_for(item(7), now);
        let at = match second.ask_for(item(7), now) {
            AskForOutcome::Scheduled(at) => at,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(at, now + GETDATA_INTERVAL);
        assert!(second.take_due(now, 10).is_empty());
        assert_eq!(second.take_due(at, 10), vec![item(7)]);
    }

    #[test]
    fn test_global_cap_drops_new_requests() {
        let tracker = AskForTracker::new(2);
        let mut ask = AskFor::new(tracker.clone());
        let now = Instant::now();

        assert!(matches!(ask.ask_for(item(1), now), AskForOutcome::Scheduled(_)));
        assert!(matches!(ask.ask_for(item(2), now), AskForOutcome::Scheduled(_)));
        assert_eq!(ask.ask_for(item(3), now), AskForOutcome::Dropped);
        assert_eq!(ask.len(), 2);
    }

    #[test]
    fn test_received_clears_entry() {
        let tracker = AskForTracker::new(100);
        let mut ask = AskFor::new(tracker.clone());
        let now = Instant::now();

        ask.ask_for(item(1), now);
        ask.take_due(now, 10);
        assert_eq!(ask.in_flight(), 1);

        ask.received(&item(1).hash);
        assert!(ask.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_take_due_in_time_order() {
        let tracker = AskForTracker::new(100);
        let mut ask = AskFor::new(tracker);
        let now = Instant::now();

        ask.ask_for(item(3), now);
        ask.ask_for(item(1), now);
        ask.ask_for(item(2), now);
        assert_eq!(ask.take_due(now, 2), vec![item(3), item(1)]);
        assert_eq!(ask.take_due(now, 10), vec![item(2)]);
    }
}
