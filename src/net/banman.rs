//! Ban list and whitelist
//!
//! Bans map a subnet to a reason and an expiry time. Expired entries are
//! swept lazily whenever the list is read, and every mutation is written
//! through to a [`BanStorage`]. Whitelisted ranges bypass ban checks (and
//! eviction) unconditionally.

use crate::net::netaddr::SubNet;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Ban persistence errors
#[derive(Error, Debug)]
pub enum BanStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why an entry was banned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanReason {
    Unknown,
    NodeMisbehaving,
    ManuallyAdded,
}

impl std::fmt::Display for BanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BanReason::Unknown => "unknown",
            BanReason::NodeMisbehaving => "node misbehaving",
            BanReason::ManuallyAdded => "manually added",
        };
        f.write_str(s)
    }
}

/// One ban: unix timestamps in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub create_time: i64,
    pub ban_until: i64,
    pub reason: BanReason,
}

impl BanEntry {
    pub fn is_expired(&self, now: i64) -> bool {
        self.ban_until <= now
    }
}

pub type BanMap = BTreeMap<SubNet, BanEntry>;

// =============================================================================
// Storage
// =============================================================================

/// Where the ban list lives between runs
pub trait BanStorage: Send + Sync {
    fn load(&self) -> Result<BanMap, BanStoreError>;
    fn save(&self, bans: &BanMap) -> Result<(), BanStoreError>;
}

/// Ban list stored as a JSON file, written through a temp file and renamed
#[derive(Debug, Clone)]
pub struct JsonBanStorage {
    path: PathBuf,
}

impl JsonBanStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl BanStorage for JsonBanStorage {
    fn load(&self) -> Result<BanMap, BanStoreError> {
        if !self.path.exists() {
            return Ok(BanMap::new());
        }
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    fn save(&self, bans: &BanMap) -> Result<(), BanStoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let temp_path = self.path.with_extension("json.tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, bans)?;

        // Atomic rename
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Ban list kept only in memory
#[derive(Debug, Default)]
pub struct MemoryBanStorage {
    bans: Mutex<BanMap>,
}

impl MemoryBanStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BanStorage for MemoryBanStorage {
    fn load(&self) -> Result<BanMap, BanStoreError> {
        Ok(self.bans.lock().clone())
    }

    fn save(&self, bans: &BanMap) -> Result<(), BanStoreError> {
        *self.bans.lock() = bans.clone();
        Ok(())
    }
}

// =============================================================================
// Ban Manager
// =============================================================================

/// Ban and whitelist store
pub struct BanManager {
    bans: Mutex<BanMap>,
    whitelist: RwLock<Vec<SubNet>>,
    storage: Box<dyn BanStorage>,
    default_ban_time: i64,
}

impl BanManager {
    /// Load persisted bans, dropping any that expired while we were down
    pub fn new(
        storage: Box<dyn BanStorage>,
        whitelist: Vec<SubNet>,
        default_ban_time: i64,
    ) -> Result<Self, BanStoreError> {
        let mut bans = storage.load()?;
        let now = Utc::now().timestamp();
        let before = bans.len();
        bans.retain(|_, entry| !entry.is_expired(now));
        log::info!(
            "Loaded {} banned node ips/subnets ({} expired)",
            bans.len(),
            before - bans.len()
        );
        Ok(Self {
            bans: Mutex::new(bans),
            whitelist: RwLock::new(whitelist),
            storage,
            default_ban_time,
        })
    }

    /// In-memory store with no whitelist, for tests and tools
    pub fn in_memory(default_ban_time: i64) -> Self {
        Self {
            bans: Mutex::new(BanMap::new()),
            whitelist: RwLock::new(Vec::new()),
            storage: Box::new(MemoryBanStorage::new()),
            default_ban_time,
        }
    }

    pub fn is_whitelisted(&self, addr: &IpAddr) -> bool {
        self.whitelist.read().iter().any(|net| net.contains(addr))
    }

    pub fn add_whitelist(&self, subnet: SubNet) {
        let mut whitelist = self.whitelist.write();
        if !whitelist.contains(&subnet) {
            whitelist.push(subnet);
        }
    }

    pub fn whitelist(&self) -> Vec<SubNet> {
        self.whitelist.read().clone()
    }

    pub fn is_banned(&self, addr: &IpAddr) -> bool {
        self.is_banned_at(addr, Utc::now().timestamp())
    }

    /// Whether `addr` falls in an active ban. Whitelisted addresses never do.
    pub fn is_banned_at(&self, addr: &IpAddr, now: i64) -> bool {
        if self.is_whitelisted(addr) {
            return false;
        }
        self.sweep_at(now);
        self.bans.lock().keys().any(|net| net.contains(addr))
    }

    /// Ban a subnet.
    ///
    /// `duration` is in seconds from now, or an absolute unix time when
    /// `absolute` is set; `None` uses the default ban time. An existing ban
    /// is only ever extended.
    pub fn ban(
        &self,
        subnet: SubNet,
        reason: BanReason,
        duration: Option<i64>,
        absolute: bool,
    ) -> Result<(), BanStoreError> {
        self.ban_at(subnet, reason, duration, absolute, Utc::now().timestamp())
    }

    pub fn ban_at(
        &self,
        subnet: SubNet,
        reason: BanReason,
        duration: Option<i64>,
        absolute: bool,
        now: i64,
    ) -> Result<(), BanStoreError> {
        let ban_until = match (duration, absolute) {
            (Some(t), true) => t,
            (Some(t), false) if t > 0 => now + t,
            _ => now + self.default_ban_time,
        };
        let entry = BanEntry {
            create_time: now,
            ban_until,
            reason,
        };
        let snapshot = {
            let mut bans = self.bans.lock();
            match bans.get(&subnet) {
                Some(existing) if existing.ban_until >= ban_until => return Ok(()),
                _ => {}
            }
            bans.insert(subnet, entry);
            bans.clone()
        };
        log::info!("Banned {} until {} ({})", subnet, ban_until, reason);
        self.storage.save(&snapshot)
    }

    /// Lift a ban. Returns whether the subnet was banned.
    pub fn unban(&self, subnet: &SubNet) -> Result<bool, BanStoreError> {
        let snapshot = {
            let mut bans = self.bans.lock();
            if bans.remove(subnet).is_none() {
                return Ok(false);
            }
            bans.clone()
        };
        log::info!("Unbanned {}", subnet);
        self.storage.save(&snapshot)?;
        Ok(true)
    }

    pub fn clear_banned(&self) -> Result<(), BanStoreError> {
        let snapshot = {
            let mut bans = self.bans.lock();
            bans.clear();
            bans.clone()
        };
        self.storage.save(&snapshot)
    }

    /// Current bans after sweeping expired ones
    pub fn list_banned(&self) -> BanMap {
        self.sweep_at(Utc::now().timestamp());
        self.bans.lock().clone()
    }

    /// Remove entries whose expiry is at or before `now`. Returns how many
    /// were removed; the store is rewritten when any were.
    pub fn sweep_at(&self, now: i64) -> usize {
        let snapshot = {
            let mut bans = self.bans.lock();
            let before = bans.len();
            bans.retain(|_, entry| !entry.is_expired(now));
            let removed = before - bans.len();
            if removed == 0 {
                return 0;
            }
            log::debug!("Swept {} expired bans", removed);
            (removed, bans.clone())
        };
        if let Err(e) = self.storage.save(&snapshot.1) {
            log::warn!("Failed to persist ban list after sweep: {}", e);
        }
        snapshot.0
    }

    /// Write the current list to storage
    pub fn flush(&self) -> Result<(), BanStoreError> {
        let snapshot = self.bans.lock().clone();
        self.storage.save(&snapshot)
    }

    pub fn len(&self) -> usize {
        self.bans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> SubNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_ban_and_expire() {
        let bans = BanManager::in_memory(100);
        bans.ban_at(net("1.2.3.4"), BanReason::ManuallyAdded, None, false, 1000)
            .unwrap();

        assert!(bans.is_banned_at(&ip("1.2.3.4"), 1099));
        assert!(!bans.is_banned_at(&ip("1.2.3.5"), 1099));
        // Expiry is inclusive
        assert!(!bans.is_banned_at(&ip("1.2.3.4"), 1100));
        assert!(bans.is_empty());
    }

    #[test]
    fn test_sweep_removes_exactly_expired() {
        let bans = BanManager::in_memory(100);
        bans.ban_at(net("1.0.0.1"), BanReason::Unknown, Some(10), false, 0)
            .unwrap();
        bans.ban_at(net("1.0.0.2"), BanReason::Unknown, Some(20), false, 0)
            .unwrap();
        bans.ban_at(net("1.0.0.3"), BanReason::Unknown, Some(30), false, 0)
            .unwrap();

        assert_eq!(bans.sweep_at(20), 2);
        assert_eq!(bans.len(), 1);
        assert!(bans.is_banned_at(&ip("1.0.0.3"), 20));
    }

    #[test]
    fn test_subnet_ban() {
        let bans = BanManager::in_memory(100);
        bans.ban_at(net("10.0.0.0/8"), BanReason::ManuallyAdded, None, false, 0)
            .unwrap();
        assert!(bans.is_banned_at(&ip("10.200.1.1"), 1));
        assert!(!bans.is_banned_at(&ip("11.0.0.1"), 1));
    }

    #[test]
    fn test_whitelist_bypasses_ban() {
        let bans = BanManager::new(
            Box::new(MemoryBanStorage::new()),
            vec![net("192.168.0.0/16")],
            100,
        )
        .unwrap();
        bans.ban_at(net("192.168.1.1"), BanReason::NodeMisbehaving, None, false, 0)
            .unwrap();
        assert!(bans.is_whitelisted(&ip("192.168.1.1")));
        assert!(!bans.is_banned_at(&ip("192.168.1.1"), 1));
    }

    #[test]
    fn test_ban_only_extends() {
        let bans = BanManager::in_memory(100);
        bans.ban_at(net("1.1.1.1"), BanReason::Unknown, Some(500), false, 0)
            .unwrap();
        bans.ban_at(net("1.1.1.1"), BanReason::Unknown, Some(50), false, 0)
            .unwrap();
        assert_eq!(bans.list_banned()[&net("1.1.1.1")].ban_until, 500);
    }

    #[test]
    fn test_unban_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist.json");

        let bans = BanManager::new(Box::new(JsonBanStorage::new(&path)), vec![], 3600).unwrap();
        bans.ban(net("5.6.7.8"), BanReason::ManuallyAdded, None, false)
            .unwrap();
        assert!(bans.is_banned(&ip("5.6.7.8")));

        let reloaded = JsonBanStorage::new(&path).load().unwrap();
        assert!(reloaded.contains_key(&net("5.6.7.8")));

        assert!(bans.unban(&net("5.6.7.8")).unwrap());
        assert!(!bans.is_banned(&ip("5.6.7.8")));
        let reloaded = JsonBanStorage::new(&path).load().unwrap();
        assert!(reloaded.is_empty());

        assert!(!bans.unban(&net("5.6.7.8")).unwrap());
    }

    #[test]
    fn test_expired_dropped_on_load() {
        let storage = MemoryBanStorage::new();
        let mut map = BanMap::new();
        map.insert(
            net("9.9.9.9"),
            BanEntry {
                create_time: 0,
                ban_until: 1,
                reason: BanReason::Unknown,
            },
        );
        storage.save(&map).unwrap();

        let bans = BanManager::new(Box::new(storage), vec![], 100).unwrap();
        assert!(bans.is_empty());
    }
}
