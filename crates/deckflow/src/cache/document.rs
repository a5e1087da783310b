//! Cache of whole-document parse results, keyed by file name and content hash.

use super::{CacheConfig, Clock, TwoTierCache};
use crate::Result;
use crate::diagnostics::ErrorRecorder;
use crate::types::{ParseResult, file_name};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DOCUMENT_CACHE_PREFIX: &str = "deck_cache";
pub const DOCUMENT_CACHE_MEMORY_ENTRIES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCacheMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub unit_count: usize,
    pub parse_time_ms: u64,
    /// Epoch milliseconds at which the result was stored.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCacheEntry {
    pub result: ParseResult,
    pub file_hash: String,
    pub metadata: DocumentCacheMetadata,
}

pub struct DocumentCache {
    inner: Arc<TwoTierCache<DocumentCacheEntry>>,
}

impl DocumentCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(TwoTierCache::new(config)?),
        })
    }

    /// Build from an already configured cache (custom clock, recorder).
    pub fn from_cache(cache: TwoTierCache<DocumentCacheEntry>) -> Self {
        Self { inner: Arc::new(cache) }
    }

    /// Defaults for document results: one hour TTL, 20 in-memory entries.
    pub fn default_config(cache_dir: Option<std::path::PathBuf>) -> CacheConfig {
        CacheConfig {
            max_memory_entries: DOCUMENT_CACHE_MEMORY_ENTRIES,
            ttl: Duration::from_secs(60 * 60),
            cache_dir,
            use_disk_cache: true,
            prefix: DOCUMENT_CACHE_PREFIX.to_string(),
            cleanup_interval: None,
        }
    }

    pub fn with_options(
        config: CacheConfig,
        recorder: Option<Arc<ErrorRecorder>>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Result<Self> {
        let mut cache = TwoTierCache::new(config)?;
        if let Some(recorder) = recorder {
            cache = cache.with_error_recorder(recorder);
        }
        if let Some(clock) = clock {
            cache = cache.with_clock(clock);
        }
        Ok(Self::from_cache(cache))
    }

    pub fn cache_key(file_name: &str, file_hash: &str) -> String {
        format!("{}_{}", file_name, file_hash)
    }

    /// Cached result for `path` whose content hash is `file_hash`.
    ///
    /// An entry stored under a different hash is never returned.
    pub fn get_result(&self, path: &Path, file_hash: &str) -> Option<ParseResult> {
        let key = Self::cache_key(&file_name(path), file_hash);
        let entry = self.inner.get(&key)?;

        if entry.file_hash != file_hash {
            tracing::debug!("Discarding cached result for {} with mismatched hash", path.display());
            return None;
        }

        tracing::debug!(
            "Cache hit for {} ({} units, parsed in {}ms)",
            entry.metadata.file_name,
            entry.metadata.unit_count,
            entry.metadata.parse_time_ms
        );
        Some(entry.result)
    }

    pub fn store_result(&self, path: &Path, file_hash: &str, file_size: u64, result: &ParseResult, parse_time: Duration) -> bool {
        let name = file_name(path);
        let metadata = DocumentCacheMetadata {
            file_name: name.clone(),
            file_size,
            unit_count: result.total_units,
            parse_time_ms: parse_time.as_millis() as u64,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };

        let tags = HashMap::from([
            ("file_name".to_string(), name.clone()),
            ("file_hash".to_string(), file_hash.to_string()),
        ]);

        self.inner.set(
            &Self::cache_key(&name, file_hash),
            DocumentCacheEntry {
                result: result.clone(),
                file_hash: file_hash.to_string(),
                metadata,
            },
            tags,
        )
    }

    pub fn inner(&self) -> &Arc<TwoTierCache<DocumentCacheEntry>> {
        &self.inner
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}
