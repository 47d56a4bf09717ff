//! Host record cache stores.
//!
//! Keys are hosts in canonical address form, so `2001:4860:4860:0:0:0:0:8888`
//! and `2001:4860:4860::8888` share an entry. A put replaces any existing
//! entry for the same host.
//! Entries older than the store's TTL (measured from `fetched_at`) read as
//! missing. Everything read back from a store is tagged `RecordSource::Local`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{Fields, HostRecord, RecordSource};

/// Default TTL: 30 days.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cache lock poisoned")]
    Poisoned,
}

/// Key-value store of host records with store-owned TTL expiry.
pub trait CacheStore: Send + Sync {
    fn get(&self, host: &str) -> Option<HostRecord>;

    /// Insert or replace the entry for `record.host()`.
    fn put(&self, record: &HostRecord) -> Result<(), CacheError>;

    /// Number of live (unexpired) entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct CacheEntry {
    host: String,
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    fields: Fields,
}

impl CacheEntry {
    fn from_record(record: &HostRecord) -> Self {
        Self {
            host: record.host().to_string(),
            fetched_at: record.fetched_at(),
            fields: record.fields().clone(),
        }
    }

    fn to_record(&self) -> HostRecord {
        HostRecord::new(
            self.host.clone(),
            self.fetched_at,
            RecordSource::Local,
            self.fields.clone(),
        )
    }

    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }
}

// ─── In-memory store ────────────────────────────────────────────

/// Process-local cache.
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, host: &str) -> Option<HostRecord> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&cache_key(host))?;
        if entry.is_expired(self.ttl, Utc::now()) {
            return None;
        }
        Some(entry.to_record())
    }

    fn put(&self, record: &HostRecord) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        drop_expired(&mut entries, self.ttl);
        entries.insert(cache_key(record.host()), CacheEntry::from_record(record));
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| count_live(&e, self.ttl))
            .unwrap_or(0)
    }
}

// ─── File-backed store ──────────────────────────────────────────

/// JSON file cache, rewritten on every put. A missing or unreadable file
/// starts an empty cache.
pub struct FileCache {
    path: PathBuf,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FileCache {
    /// Load from the default location (~/.iptracker/cache.json).
    pub fn load(ttl: Duration) -> Self {
        Self::load_from(Self::default_path(), ttl)
    }

    /// Load from a specific path.
    pub fn load_from(path: PathBuf, ttl: Duration) -> Self {
        let entries = Self::read_file(&path).unwrap_or_default();
        debug!("Loaded {} cached hosts from {}", entries.len(), path.display());
        Self {
            path,
            ttl,
            entries: Mutex::new(entries),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".iptracker")
            .join("cache.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> Option<HashMap<String, CacheEntry>> {
        let data = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!("Ignoring unreadable cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl CacheStore for FileCache {
    fn get(&self, host: &str) -> Option<HostRecord> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(&cache_key(host))?;
        if entry.is_expired(self.ttl, Utc::now()) {
            return None;
        }
        Some(entry.to_record())
    }

    fn put(&self, record: &HostRecord) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        drop_expired(&mut entries, self.ttl);
        entries.insert(cache_key(record.host()), CacheEntry::from_record(record));
        self.persist(&entries)
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|e| count_live(&e, self.ttl))
            .unwrap_or(0)
    }
}

fn cache_key(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => host.to_string(),
    }
}

fn drop_expired(entries: &mut HashMap<String, CacheEntry>, ttl: Duration) {
    let now = Utc::now();
    entries.retain(|_, e| !e.is_expired(ttl, now));
}

fn count_live(entries: &HashMap<String, CacheEntry>, ttl: Duration) -> usize {
    let now = Utc::now();
    entries.values().filter(|e| !e.is_expired(ttl, now)).count()
}
