//! Address manager for peer discovery
//!
//! Bucketed address table that maintains:
//! - New addresses: heard about but never successfully connected
//! - Tried addresses: completed a handshake at least once
//!
//! Bucket placement is keyed by a random secret so a single source can't
//! fill the table.

use crate::net::interfaces::AddressManager;
use crate::protocol::address::{NetAddr, MAX_ADDR_TO_SEND};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

// =============================================================================
// Constants
// =============================================================================

/// Number of buckets for new addresses
const NEW_BUCKET_COUNT: usize = 256;

/// Number of entries per new bucket
const NEW_BUCKET_SIZE: usize = 64;

/// Number of buckets for tried addresses
const TRIED_BUCKET_COUNT: usize = 64;

/// Number of entries per tried bucket
const TRIED_BUCKET_SIZE: usize = 64;

/// Addresses not seen for this long are not shared (30 days)
const MAX_ADDR_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Failed attempts without a success before an address is terrible
const MAX_FAILURES: u32 = 3;

// =============================================================================
// Address Entry
// =============================================================================

/// Address with connection history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrEntry {
    pub addr: NetAddr,
    /// Peer that told us about this address
    pub source: Option<IpAddr>,
    /// Attempts since the last success
    pub attempts: u32,
    pub successes: u32,
    /// Unix time of the last successful connection
    pub last_success: Option<i64>,
    /// Unix time of the last connection attempt
    pub last_attempt: Option<i64>,
    pub in_tried: bool,
    /// How many sources reported this address
    pub ref_count: u32,
}

impl AddrEntry {
    pub fn new(addr: NetAddr, source: Option<IpAddr>) -> Self {
        Self {
            addr,
            source,
            attempts: 0,
            successes: 0,
            last_success: None,
            last_attempt: None,
            in_tried: false,
            ref_count: 1,
        }
    }

    /// Too many failures, or too old to be worth sharing
    pub fn is_terrible(&self, now: i64) -> bool {
        if self.last_attempt.is_some() && self.successes == 0 && self.attempts >= MAX_FAILURES {
            return true;
        }
        self.last_success.is_none() && now - i64::from(self.addr.time) > MAX_ADDR_AGE_SECS
    }

    /// Relative selection weight
    pub fn get_chance(&self) -> f64 {
        let mut chance = 1.0;
        if self.attempts > 0 {
            chance *= 0.66_f64.powi(self.attempts.min(8) as i32);
        }
        if self.successes > 0 {
            chance *= 2.0;
        }
        chance.max(0.001)
    }

    fn attempt(&mut self, now: i64) {
        self.attempts += 1;
        self.last_attempt = Some(now);
    }

    fn good(&mut self, now: i64) {
        self.successes += 1;
        self.last_success = Some(now);
        self.attempts = 0;
        self.addr.time = now.max(0) as u32;
    }
}

// =============================================================================
// Address Table
// =============================================================================

#[derive(Debug)]
struct AddrTable {
    by_addr: HashMap<SocketAddr, AddrEntry>,
    new_table: Vec<Vec<SocketAddr>>,
    tried_table: Vec<Vec<SocketAddr>>,
    connected: HashSet<SocketAddr>,
    key: u64,
}

impl AddrTable {
    fn new() -> Self {
        Self {
            by_addr: HashMap::new(),
            new_table: vec![Vec::with_capacity(NEW_BUCKET_SIZE); NEW_BUCKET_COUNT],
            tried_table: vec![Vec::with_capacity(TRIED_BUCKET_SIZE); TRIED_BUCKET_COUNT],
            connected: HashSet::new(),
            key: rand::thread_rng().gen(),
        }
    }

    fn new_count(&self) -> usize {
        self.by_addr.values().filter(|e| !e.in_tried).count()
    }

    fn tried_count(&self) -> usize {
        self.by_addr.values().filter(|e| e.in_tried).count()
    }

    fn add(&mut self, addr: NetAddr, source: Option<IpAddr>) -> bool {
        if !addr.is_routable() {
            return false;
        }
        let key = addr.addr;

        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.ref_count += 1;
            if addr.time > entry.addr.time {
                entry.addr.time = addr.time;
            }
            entry.addr.services |= addr.services;
            return false;
        }

        let bucket = self.new_bucket(&key, source.as_ref());
        if self.new_table[bucket].len() >= NEW_BUCKET_SIZE {
            // Evict the worst entry in the bucket to make room
            let now = chrono::Utc::now().timestamp();
            let victim = self.new_table[bucket]
                .iter()
                .enumerate()
                .filter_map(|(i, a)| self.by_addr.get(a).map(|e| (i, e)))
                .min_by(|(_, a), (_, b)| {
                    a.is_terrible(now)
                        .cmp(&b.is_terrible(now))
                        .reverse()
                        .then(a.get_chance().total_cmp(&b.get_chance()))
                })
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    let evicted = self.new_table[bucket].swap_remove(i);
                    self.by_addr.remove(&evicted);
                }
                None => return false,
            }
        }

        self.by_addr.insert(key, AddrEntry::new(addr, source));
        self.new_table[bucket].push(key);
        true
    }

    fn select(&self, new_only: bool, now: i64) -> Option<NetAddr> {
        let mut rng = rand::thread_rng();

        let use_new = if new_only {
            true
        } else {
            let new_count = self.new_count();
            let tried_count = self.tried_count();
            if tried_count == 0 {
                true
            } else if new_count == 0 {
                false
            } else {
                rng.gen::<bool>()
            }
        };

        let eligible_in = |from_new: bool| -> Vec<&AddrEntry> {
            self.by_addr
                .iter()
                .filter(|(k, e)| {
                    !self.connected.contains(*k) && !e.is_terrible(now) && from_new != e.in_tried
                })
                .map(|(_, e)| e)
                .collect()
        };

        let mut eligible = eligible_in(use_new);
        if eligible.is_empty() && !new_only {
            eligible = eligible_in(!use_new);
        }
        if eligible.is_empty() {
            return None;
        }

        // Weighted random selection based on chance
        let total_weight: f64 = eligible.iter().map(|e| e.get_chance()).sum();
        let mut target = rng.gen::<f64>() * total_weight;
        for entry in &eligible {
            target -= entry.get_chance();
            if target <= 0.0 {
                return Some(entry.addr.clone());
            }
        }
        eligible.first().map(|e| e.addr.clone())
    }

    fn get_addr(&self, count: usize, now: i64) -> Vec<NetAddr> {
        let mut rng = rand::thread_rng();
        let count = count.min(MAX_ADDR_TO_SEND);

        let mut addrs: Vec<NetAddr> = self
            .by_addr
            .values()
            .filter(|e| !e.is_terrible(now))
            .map(|e| e.addr.clone())
            .collect();

        // Fisher-Yates, then take the requested count
        for i in (1..addrs.len()).rev() {
            let j = rng.gen_range(0..=i);
            addrs.swap(i, j);
        }
        addrs.truncate(count);
        addrs
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn new_bucket(&self, addr: &SocketAddr, source: Option<&IpAddr>) -> usize {
        (self.hash_addr(addr, source) as usize) % NEW_BUCKET_COUNT
    }

    fn tried_bucket(&self, addr: &SocketAddr) -> usize {
        (self.hash_addr(addr, None) as usize) % TRIED_BUCKET_COUNT
    }

    fn hash_addr(&self, addr: &SocketAddr, source: Option<&IpAddr>) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.key.hash(&mut hasher);
        addr.hash(&mut hasher);
        source.hash(&mut hasher);
        hasher.finish()
    }

    /// Move an address from the new table to the tried table
    fn make_tried(&mut self, addr: &SocketAddr) {
        let already_tried = self.by_addr.get(addr).map(|e| e.in_tried).unwrap_or(true);
        if already_tried {
            return;
        }

        for bucket in &mut self.new_table {
            bucket.retain(|a| a != addr);
        }

        let bucket = self.tried_bucket(addr);
        if self.tried_table[bucket].len() >= TRIED_BUCKET_SIZE {
            // Demote the oldest tried entry back to new
            let oldest = self.tried_table[bucket]
                .iter()
                .enumerate()
                .min_by_key(|(_, a)| self.by_addr.get(*a).and_then(|e| e.last_success))
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                let demoted = self.tried_table[bucket].swap_remove(i);
                let source = self.by_addr.get(&demoted).and_then(|e| e.source);
                let new_bucket = self.new_bucket(&demoted, source.as_ref());
                if self.new_table[new_bucket].len() < NEW_BUCKET_SIZE {
                    self.new_table[new_bucket].push(demoted);
                    if let Some(entry) = self.by_addr.get_mut(&demoted) {
                        entry.in_tried = false;
                    }
                } else {
                    self.by_addr.remove(&demoted);
                }
            }
        }
        self.tried_table[bucket].push(*addr);

        if let Some(entry) = self.by_addr.get_mut(addr) {
            entry.in_tried = true;
        }
    }

    fn rebuild(entries: Vec<AddrEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            let key = entry.addr.addr;
            if entry.in_tried {
                let bucket = table.tried_bucket(&key);
                if table.tried_table[bucket].len() >= TRIED_BUCKET_SIZE {
                    continue;
                }
                table.tried_table[bucket].push(key);
            } else {
                let bucket = table.new_bucket(&key, entry.source.as_ref());
                if table.new_table[bucket].len() >= NEW_BUCKET_SIZE {
                    continue;
                }
                table.new_table[bucket].push(key);
            }
            table.by_addr.insert(key, entry);
        }
        table
    }
}

// =============================================================================
// Address Manager
// =============================================================================

/// Thread-safe address manager, optionally persisted as JSON
#[derive(Debug)]
pub struct AddrManager {
    table: Mutex<AddrTable>,
    path: Option<PathBuf>,
}

impl AddrManager {
    /// Create an in-memory address manager
    pub fn new() -> Self {
        Self {
            table: Mutex::new(AddrTable::new()),
            path: None,
        }
    }

    /// Create an address manager backed by a JSON file, loading any
    /// existing entries
    pub fn with_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            let entries: Vec<AddrEntry> = serde_json::from_str(&json)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            log::info!("Loaded {} addresses from {}", entries.len(), path.display());
            AddrTable::rebuild(entries)
        } else {
            AddrTable::new()
        };
        Ok(Self {
            table: Mutex::new(table),
            path: Some(path),
        })
    }

    pub fn new_count(&self) -> usize {
        self.table.lock().new_count()
    }

    pub fn tried_count(&self) -> usize {
        self.table.lock().tried_count()
    }

    pub fn entry(&self, addr: &SocketAddr) -> Option<AddrEntry> {
        self.table.lock().by_addr.get(addr).cloned()
    }
}

impl Default for AddrManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressManager for AddrManager {
    fn add(&self, addrs: &[NetAddr], source: Option<IpAddr>) -> usize {
        let mut table = self.table.lock();
        addrs
            .iter()
            .take(MAX_ADDR_TO_SEND)
            .filter(|addr| table.add((*addr).clone(), source))
            .count()
    }

    fn select(&self, new_only: bool) -> Option<NetAddr> {
        self.table.lock().select(new_only, chrono::Utc::now().timestamp())
    }

    fn attempt(&self, addr: &SocketAddr) {
        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.table.lock().by_addr.get_mut(addr) {
            entry.attempt(now);
        }
    }

    fn good(&self, addr: &SocketAddr) {
        let now = chrono::Utc::now().timestamp();
        let mut table = self.table.lock();
        table.connected.insert(*addr);
        if let Some(entry) = table.by_addr.get_mut(addr) {
            entry.good(now);
            if !entry.in_tried {
                table.make_tried(addr);
            }
        }
    }

    fn connected(&self, addr: &SocketAddr) {
        let now = chrono::Utc::now().timestamp().max(0) as u32;
        let mut table = self.table.lock();
        table.connected.insert(*addr);
        if let Some(entry) = table.by_addr.get_mut(addr) {
            entry.addr.time = now;
        }
    }

    fn disconnected(&self, addr: &SocketAddr) {
        self.table.lock().connected.remove(addr);
    }

    fn get_addr(&self, max: usize) -> Vec<NetAddr> {
        self.table.lock().get_addr(max, chrono::Utc::now().timestamp())
    }

    fn size(&self) -> usize {
        self.table.lock().by_addr.len()
    }

    fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: Vec<AddrEntry> = self.table.lock().by_addr.values().cloned().collect();
        let json = serde_json::to_string(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, path)?;
        log::debug!("Saved {} addresses to {}", entries.len(), path.display());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::services::ServiceFlags;

    fn addr(s: &str) -> NetAddr {
        NetAddr::new(s.parse().unwrap(), ServiceFlags::NODE_NETWORK)
    }

    #[test]
    fn test_add_address() {
        let mgr = AddrManager::new();

        assert_eq!(mgr.add(&[addr("8.8.8.8:8333")], None), 1);
        // Adding same address again is not new
        assert_eq!(mgr.add(&[addr("8.8.8.8:8333")], None), 0);

        assert_eq!(mgr.size(), 1);
        assert_eq!(mgr.new_count(), 1);
        assert_eq!(mgr.tried_count(), 0);
    }

    #[test]
    fn test_unroutable_rejected() {
        let mgr = AddrManager::new();
        assert_eq!(mgr.add(&[addr("127.0.0.1:8333"), addr("10.0.0.1:8333")], None), 0);
        assert_eq!(mgr.size(), 0);
    }

    #[test]
    fn test_good_moves_to_tried() {
        let mgr = AddrManager::new();
        mgr.add(&[addr("8.8.8.8:8333")], None);

        mgr.good(&"8.8.8.8:8333".parse().unwrap());

        assert_eq!(mgr.new_count(), 0);
        assert_eq!(mgr.tried_count(), 1);
    }

    #[test]
    fn test_select_skips_connected() {
        let mgr = AddrManager::new();
        mgr.add(&[addr("1.1.1.1:8333"), addr("8.8.8.8:8333")], None);
        assert!(mgr.select(false).is_some());

        mgr.connected(&"1.1.1.1:8333".parse().unwrap());
        for _ in 0..20 {
            assert_eq!(mgr.select(false).unwrap().addr, "8.8.8.8:8333".parse().unwrap());
        }

        mgr.connected(&"8.8.8.8:8333".parse().unwrap());
        assert!(mgr.select(false).is_none());
        mgr.disconnected(&"8.8.8.8:8333".parse().unwrap());
        assert!(mgr.select(false).is_some());
    }

    #[test]
    fn test_select_new_only() {
        let mgr = AddrManager::new();
        mgr.add(&[addr("1.1.1.1:8333"), addr("8.8.8.8:8333")], None);
        mgr.good(&"1.1.1.1:8333".parse().unwrap());
        mgr.disconnected(&"1.1.1.1:8333".parse().unwrap());

        for _ in 0..20 {
            assert_eq!(mgr.select(true).unwrap().addr, "8.8.8.8:8333".parse().unwrap());
        }
    }

    #[test]
    fn test_failed_attempts_make_terrible() {
        let mgr = AddrManager::new();
        let a: SocketAddr = "8.8.8.8:8333".parse().unwrap();
        mgr.add(&[addr("8.8.8.8:8333")], None);
        for _ in 0..MAX_FAILURES {
            mgr.attempt(&a);
        }
        assert!(mgr.select(false).is_none());
        assert!(mgr.get_addr(10).is_empty());
    }

    #[test]
    fn test_get_addr() {
        let mgr = AddrManager::new();
        let addrs: Vec<NetAddr> = (1..10).map(|i| addr(&format!("8.8.8.{}:8333", i))).collect();
        mgr.add(&addrs, None);

        assert_eq!(mgr.get_addr(5).len(), 5);
        assert_eq!(mgr.get_addr(100).len(), 9);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let mgr = AddrManager::with_file(&path).unwrap();
        mgr.add(&[addr("1.1.1.1:8333"), addr("8.8.8.8:8333")], None);
        mgr.good(&"8.8.8.8:8333".parse().unwrap());
        mgr.flush().unwrap();

        let reloaded = AddrManager::with_file(&path).unwrap();
        assert_eq!(reloaded.size(), 2);
        assert_eq!(reloaded.tried_count(), 1);
        assert_eq!(
            reloaded.entry(&"8.8.8.8:8333".parse().unwrap()).unwrap().successes,
            1
        );
    }
}
