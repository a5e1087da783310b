//! Two-tier result cache: a bounded in-memory map in front of a sharded on-disk store.
//!
//! # Lookup order
//!
//! `get` consults memory first, then disk. A disk hit is promoted into memory with its
//! original timestamp, so promotion never extends an entry's lifetime.
//!
//! # Expiry and eviction
//!
//! An entry is expired when `now - timestamp > ttl`. Expired entries are dropped lazily on
//! lookup and eagerly by [`TwoTierCache::cleanup`]. When the memory tier is full, the entry
//! with the oldest *write* timestamp is evicted. Reads do not refresh timestamps, so this is
//! oldest-first eviction, not LRU.
//!
//! # Disk layout
//!
//! Keys are hashed with SHA-256. An entry lives at `<dir>/<hash[0..2]>/<prefix>_<hash>.json`
//! and is written to a temporary file first, then renamed into place, so readers never
//! observe a partially written entry.
//!
//! Disk failures never escape `get`/`set`: they are counted in [`CacheStats::errors`],
//! reported to the error recorder if one is attached, and treated as a miss or a failed write.

pub mod document;

use crate::diagnostics::{ErrorRecorder, Severity, context};
use crate::io::sha256_hex;
use crate::{DeckflowError, Result};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

pub use document::{DocumentCache, DocumentCacheEntry, DocumentCacheMetadata};

pub const DEFAULT_MAX_MEMORY_ENTRIES: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PREFIX: &str = "cache";

/// Source of "now" for expiry decisions, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Useful for exercising TTLs.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_memory_entries: usize,
    pub ttl: Duration,
    /// Root of the disk tier; `None` picks `<user cache dir>/deckflow`.
    pub cache_dir: Option<PathBuf>,
    pub use_disk_cache: bool,
    /// File-name prefix of disk entries, so several caches can share a directory.
    pub prefix: String,
    /// Period of the background sweep started by [`TwoTierCache::start_cleanup_task`].
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: DEFAULT_MAX_MEMORY_ENTRIES,
            ttl: DEFAULT_TTL,
            cache_dir: None,
            use_disk_cache: true,
            prefix: DEFAULT_PREFIX.to_string(),
            cleanup_interval: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Write time in epoch milliseconds.
    pub timestamp: u64,
    pub ttl_ms: u64,
    pub key: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.timestamp) > self.ttl_ms
    }
}

/// Expiry fields of a disk entry, read during cleanup without decoding the payload.
#[derive(Deserialize)]
struct EntryHeader {
    timestamp: u64,
    ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub memory: u64,
    pub disk: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Memory entries plus disk entries.
    pub size: usize,
    pub memory_size: usize,
    pub disk_size: usize,
    pub hits: TierCounts,
    pub misses: u64,
    pub writes: TierCounts,
    pub evictions: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    memory_writes: AtomicU64,
    disk_writes: AtomicU64,
    total_writes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.disk_hits,
            &self.misses,
            &self.memory_writes,
            &self.disk_writes,
            &self.total_writes,
            &self.evictions,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct TwoTierCache<T> {
    config: CacheConfig,
    disk_dir: Option<PathBuf>,
    memory: Mutex<AHashMap<String, CacheEntry<T>>>,
    counters: Counters,
    clock: Arc<dyn Clock>,
    recorder: Option<Arc<ErrorRecorder>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> TwoTierCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a cache, creating the disk directory if the disk tier is enabled.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let disk_dir = if config.use_disk_cache {
            let dir = match &config.cache_dir {
                Some(dir) => dir.clone(),
                None => default_cache_dir()?,
            };
            fs::create_dir_all(&dir).map_err(|e| {
                DeckflowError::cache_with_source(format!("Failed to create cache directory {}", dir.display()), e)
            })?;
            Some(dir)
        } else {
            None
        };

        Ok(Self {
            config,
            disk_dir,
            memory: Mutex::new(AHashMap::new()),
            counters: Counters::default(),
            clock: Arc::new(SystemClock),
            recorder: None,
            cleanup_task: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_error_recorder(mut self, recorder: Arc<ErrorRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Directory of the disk tier, if enabled.
    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk_dir.as_deref()
    }

    /// Look `key` up in memory, then on disk.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now_millis();

        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.get(key) {
                if !entry.is_expired(now) {
                    Counters::bump(&self.counters.memory_hits);
                    return Some(entry.data.clone());
                }
                memory.remove(key);
                Counters::bump(&self.counters.evictions);
            }
        }

        if self.disk_dir.is_some() {
            match self.read_disk(key) {
                Ok(Some(entry)) if !entry.is_expired(now) => {
                    Counters::bump(&self.counters.disk_hits);
                    let data = entry.data.clone();
                    self.insert_memory(entry);
                    tracing::debug!("Cache disk hit for '{}', promoted to memory", key);
                    return Some(data);
                }
                Ok(Some(_expired)) => {
                    self.remove_disk(key);
                    Counters::bump(&self.counters.evictions);
                }
                Ok(None) => {}
                Err(e) => self.note_error("get", key, &e),
            }
        }

        Counters::bump(&self.counters.misses);
        None
    }

    /// Store `data` under `key` in both tiers.
    ///
    /// Returns `false` when the disk write failed; the memory tier is updated regardless.
    pub fn set(&self, key: &str, data: T, metadata: HashMap<String, String>) -> bool {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
            ttl_ms: self.config.ttl.as_millis() as u64,
            key: key.to_string(),
            metadata,
        };

        Counters::bump(&self.counters.total_writes);

        let mut stored = true;
        if self.disk_dir.is_some() {
            match self.write_disk(&entry) {
                Ok(()) => Counters::bump(&self.counters.disk_writes),
                Err(e) => {
                    self.note_error("set", key, &e);
                    stored = false;
                }
            }
        }

        if self.insert_memory(entry) {
            Counters::bump(&self.counters.memory_writes);
        }

        stored
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let in_memory = self.memory.lock().remove(key).is_some();
        let on_disk = self.disk_dir.is_some() && self.remove_disk(key);
        in_memory || on_disk
    }

    /// Empty both tiers and reset every counter.
    pub fn clear(&self) -> Result<()> {
        self.memory.lock().clear();

        if let Some(dir) = &self.disk_dir {
            for path in self.disk_entry_paths(dir)? {
                let _ = fs::remove_file(&path);
            }
            remove_empty_shards(dir);
        }

        self.counters.reset();
        Ok(())
    }

    /// Drop every expired entry from both tiers. Returns the number removed.
    ///
    /// Unreadable disk entries are removed as well.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();

        let mut removed = {
            let mut memory = self.memory.lock();
            let before = memory.len();
            memory.retain(|_, entry| !entry.is_expired(now));
            before - memory.len()
        };

        if let Some(dir) = &self.disk_dir {
            match self.disk_entry_paths(dir) {
                Ok(paths) => {
                    for path in paths {
                        let expired = fs::read(&path)
                            .ok()
                            .and_then(|bytes| serde_json::from_slice::<EntryHeader>(&bytes).ok())
                            .is_none_or(|header| now.saturating_sub(header.timestamp) > header.ttl_ms);

                        if expired && fs::remove_file(&path).is_ok() {
                            removed += 1;
                        }
                    }
                }
                Err(e) => self.note_error("cleanup", &dir.display().to_string(), &e),
            }
        }

        self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!("Cache cleanup removed {} expired entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let memory_size = self.memory.lock().len();
        let disk_size = self
            .disk_dir
            .as_deref()
            .and_then(|dir| self.disk_entry_paths(dir).ok())
            .map_or(0, |paths| paths.len());

        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let disk_hits = self.counters.disk_hits.load(Ordering::Relaxed);

        CacheStats {
            size: memory_size + disk_size,
            memory_size,
            disk_size,
            hits: TierCounts {
                memory: memory_hits,
                disk: disk_hits,
                total: memory_hits + disk_hits,
            },
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: TierCounts {
                memory: self.counters.memory_writes.load(Ordering::Relaxed),
                disk: self.counters.disk_writes.load(Ordering::Relaxed),
                total: self.counters.total_writes.load(Ordering::Relaxed),
            },
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    /// Fraction of lookups served from either tier, 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits =
            self.counters.memory_hits.load(Ordering::Relaxed) + self.counters.disk_hits.load(Ordering::Relaxed);
        let lookups = hits + self.counters.misses.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        hits as f64 / lookups as f64
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().len()
    }

    /// Spawn a background task calling [`cleanup`](Self::cleanup) every `interval`.
    ///
    /// The task holds only a weak reference and ends once the cache is dropped. Requires a
    /// Tokio runtime.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DeckflowError::cache_with_source("Periodic cleanup requires a Tokio runtime", e))?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.cleanup();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.cleanup_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop the cleanup task and drop the memory tier. Disk entries are kept.
    pub fn dispose(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.memory.lock().clear();
    }

    /// Insert into memory, evicting the oldest-written entry when at capacity.
    fn insert_memory(&self, entry: CacheEntry<T>) -> bool {
        if self.config.max_memory_entries == 0 {
            return false;
        }

        let mut memory = self.memory.lock();
        if !memory.contains_key(&entry.key) && memory.len() >= self.config.max_memory_entries {
            let oldest = memory
                .iter()
                .min_by_key(|(_, existing)| existing.timestamp)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                memory.remove(&oldest);
                Counters::bump(&self.counters.evictions);
            }
        }
        memory.insert(entry.key.clone(), entry);
        true
    }

    fn disk_path(&self, dir: &Path, key: &str) -> PathBuf {
        let hash = sha256_hex(key);
        dir.join(&hash[..2]).join(format!("{}_{}.json", self.config.prefix, hash))
    }

    fn read_disk(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
        let Some(dir) = &self.disk_dir else {
            return Ok(None);
        };
        let path = self.disk_path(dir, key);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .map_err(|e| DeckflowError::cache_with_source(format!("Failed to read {}", path.display()), e))?;

        match serde_json::from_slice::<CacheEntry<T>>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(DeckflowError::cache_with_source(
                    format!("Corrupt cache entry {}", path.display()),
                    e,
                ))
            }
        }
    }

    fn write_disk(&self, entry: &CacheEntry<T>) -> Result<()> {
        let Some(dir) = &self.disk_dir else {
            return Ok(());
        };
        let path = self.disk_path(dir, &entry.key);
        let shard = path.parent().unwrap_or(dir);

        fs::create_dir_all(shard)
            .map_err(|e| DeckflowError::cache_with_source(format!("Failed to create {}", shard.display()), e))?;

        let serialized = serde_json::to_vec(entry)
            .map_err(|e| DeckflowError::cache_with_source("Failed to serialize cache entry", e))?;

        let pid = std::process::id();
        let thread_id = std::thread::current().id();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let temp_path = shard.join(format!("{}.tmp.{}.{:?}.{}", file_name, pid, thread_id, nanos));

        fs::write(&temp_path, &serialized)
            .map_err(|e| DeckflowError::cache_with_source("Failed to write temp cache file", e))?;

        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            DeckflowError::cache_with_source("Failed to rename cache file", e)
        })
    }

    fn remove_disk(&self, key: &str) -> bool {
        match &self.disk_dir {
            Some(dir) => fs::remove_file(self.disk_path(dir, key)).is_ok(),
            None => false,
        }
    }

    /// Every entry file carrying this cache's prefix, across all shards.
    fn disk_entry_paths(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_", self.config.prefix);
        let mut paths = Vec::new();

        let shards = fs::read_dir(dir)
            .map_err(|e| DeckflowError::cache_with_source(format!("Failed to read {}", dir.display()), e))?;

        for shard in shards.flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(&prefix) && name.ends_with(".json") {
                    paths.push(entry.path());
                }
            }
        }

        Ok(paths)
    }

    fn note_error(&self, operation: &str, key: &str, error: &DeckflowError) {
        Counters::bump(&self.counters.errors);
        tracing::warn!("Cache {} failed for '{}': {}", operation, key, error);
        if let Some(recorder) = &self.recorder {
            recorder.record(
                &format!("cache.{}", operation),
                error,
                context(&[("key", key)]),
                Severity::Low,
                true,
            );
        }
    }
}

impl<T> Drop for TwoTierCache<T> {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}

fn default_cache_dir() -> Result<PathBuf> {
    match dirs::cache_dir() {
        Some(dir) => Ok(dir.join("deckflow")),
        None => Ok(std::env::current_dir()?.join(".deckflow").join("cache")),
    }
}

fn remove_empty_shards(dir: &Path) {
    if let Ok(shards) = fs::read_dir(dir) {
        for shard in shards.flatten() {
            // fails harmlessly when the shard still holds other caches' files
            let _ = fs::remove_dir(shard.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache_in(dir: &Path, clock: Arc<ManualClock>, max_memory_entries: usize) -> TwoTierCache<String> {
        TwoTierCache::new(CacheConfig {
            max_memory_entries,
            ttl: Duration::from_secs(60),
            cache_dir: Some(dir.to_path_buf()),
            prefix: "test".to_string(),
            ..Default::default()
        })
        .unwrap()
        .with_clock(clock)
    }

    #[test]
    fn test_set_then_get_hits_memory() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path(), Arc::new(ManualClock::new(1_000)), 10);

        assert_eq!(cache.hit_rate(), 0.0);
        assert!(cache.set("deck", "payload".to_string(), HashMap::new()));
        assert_eq!(cache.get("deck").as_deref(), Some("payload"));

        let stats = cache.stats();
        assert_eq!(stats.hits.memory, 1);
        assert_eq!(stats.hits.disk, 0);
        assert_eq!(stats.writes, TierCounts { memory: 1, disk: 1, total: 1 });
        assert_eq!(stats.memory_size, 1);
        assert_eq!(stats.disk_size, 1);
        assert_eq!(stats.size, 2);
        assert_eq!(cache.hit_rate(), 1.0);
    }

    #[test]
    fn test_disk_hit_is_promoted() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        cache_in(dir.path(), clock.clone(), 10).set("deck", "from disk".to_string(), HashMap::new());

        let fresh = cache_in(dir.path(), clock, 10);
        assert_eq!(fresh.memory_len(), 0);
        assert_eq!(fresh.get("deck").as_deref(), Some("from disk"));
        assert_eq!(fresh.memory_len(), 1);
        assert_eq!(fresh.get("deck").as_deref(), Some("from disk"));

        let stats = fresh.stats();
        assert_eq!(stats.hits.disk, 1);
        assert_eq!(stats.hits.memory, 1);
    }

    #[test]
    fn test_disk_layout_is_sharded() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path(), Arc::new(ManualClock::new(0)), 10);
        cache.set("deck", "x".to_string(), HashMap::new());

        let hash = sha256_hex("deck");
        let expected = dir.path().join(&hash[..2]).join(format!("test_{}.json", hash));
        assert!(expected.exists(), "missing {}", expected.display());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let cache = cache_in(dir.path(), clock.clone(), 10);
        cache.set("deck", "stale soon".to_string(), HashMap::new());

        clock.advance(Duration::from_secs(60));
        assert!(cache.get("deck").is_some(), "exactly ttl old is still fresh");

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("deck").is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().disk_size, 0, "expired disk entry should be removed");
    }

    #[test]
    fn test_eviction_is_oldest_write_not_lru() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cache = TwoTierCache::<String>::new(CacheConfig {
            max_memory_entries: 2,
            use_disk_cache: false,
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap()
        .with_clock(clock.clone());

        cache.set("a", "A".to_string(), HashMap::new());
        clock.advance(Duration::from_millis(1));
        cache.set("b", "B".to_string(), HashMap::new());
        clock.advance(Duration::from_millis(1));
        assert!(cache.get("a").is_some());
        cache.set("c", "C".to_string(), HashMap::new());

        assert_eq!(cache.memory_len(), 2);
        assert!(cache.get("a").is_none(), "recently read but oldest written");
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path(), Arc::new(ManualClock::new(0)), 2);
        cache.set("a", "1".to_string(), HashMap::new());
        cache.set("b", "2".to_string(), HashMap::new());
        cache.set("a", "3".to_string(), HashMap::new());

        assert_eq!(cache.memory_len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("3"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_memory_bound_holds_under_many_writes() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_in(dir.path(), clock.clone(), 5);
        for i in 0..40 {
            clock.advance(Duration::from_millis(3));
            cache.set(&format!("key-{}", i), i.to_string(), HashMap::new());
            assert!(cache.memory_len() <= 5);
        }
    }

    #[test]
    fn test_corrupt_disk_entry_counts_error() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        cache_in(dir.path(), clock.clone(), 10).set("deck", "ok".to_string(), HashMap::new());

        let hash = sha256_hex("deck");
        let path = dir.path().join(&hash[..2]).join(format!("test_{}.json", hash));
        fs::write(&path, b"{ not json").unwrap();

        let fresh = cache_in(dir.path(), clock, 10);
        assert!(fresh.get("deck").is_none());
        let stats = fresh.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.misses, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_delete_and_clear() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path(), Arc::new(ManualClock::new(0)), 10);
        cache.set("a", "1".to_string(), HashMap::new());
        cache.set("b", "2".to_string(), HashMap::new());
        let _ = cache.get("a");

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(cache.get("a").is_none());

        cache.clear().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits.total, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.writes.total, 0);
    }

    #[test]
    fn test_cleanup_sweeps_both_tiers() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_in(dir.path(), clock.clone(), 10);
        cache.set("old", "1".to_string(), HashMap::new());
        clock.advance(Duration::from_secs(45));
        cache.set("new", "2".to_string(), HashMap::new());
        clock.advance(Duration::from_secs(30));

        assert_eq!(cache.cleanup(), 2, "one memory entry and one disk entry");
        let stats = cache.stats();
        assert_eq!(stats.memory_size, 1);
        assert_eq!(stats.disk_size, 1);
        assert_eq!(cache.get("new").as_deref(), Some("2"));
    }

    #[test]
    fn test_prefix_isolates_caches_sharing_a_directory() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let first = cache_in(dir.path(), clock.clone(), 10);
        let second = TwoTierCache::<String>::new(CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            prefix: "other".to_string(),
            ..Default::default()
        })
        .unwrap()
        .with_clock(clock);

        first.set("k", "1".to_string(), HashMap::new());
        second.set("k", "2".to_string(), HashMap::new());
        first.clear().unwrap();

        assert_eq!(second.stats().disk_size, 1);
        assert_eq!(second.get("k").as_deref(), Some("2"));
    }

    #[test]
    fn test_metadata_is_persisted() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path(), Arc::new(ManualClock::new(0)), 10);
        let metadata = HashMap::from([("source".to_string(), "unit-test".to_string())]);
        cache.set("deck", "x".to_string(), metadata);

        let hash = sha256_hex("deck");
        let path = dir.path().join(&hash[..2]).join(format!("test_{}.json", hash));
        let entry: CacheEntry<String> = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(entry.key, "deck");
        assert_eq!(entry.metadata.get("source").map(String::as_str), Some("unit-test"));
    }

    #[tokio::test]
    async fn test_periodic_cleanup_task() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cache = Arc::new(cache_in(dir.path(), clock.clone(), 10));
        cache.set("deck", "x".to_string(), HashMap::new());
        clock.advance(Duration::from_secs(120));

        cache.start_cleanup_task(Duration::from_millis(20)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.memory_len(), 0);
        assert_eq!(cache.stats().disk_size, 0);
        cache.dispose();
    }
}
