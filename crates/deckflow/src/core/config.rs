//! Configuration loading and management.
//!
//! [`ParserConfig`] can be built programmatically, loaded from TOML, YAML or JSON, discovered
//! from a `deckflow.toml` in the current directory or any parent, and adjusted through
//! `DECKFLOW_*` environment variables.

use crate::cache::CacheConfig;
use crate::cache::document::{DOCUMENT_CACHE_MEMORY_ENTRIES, DOCUMENT_CACHE_PREFIX};
use crate::workers::WorkerPoolConfig;
use crate::workers::pool::default_max_workers;
use crate::{DeckflowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main parser configuration.
///
/// # Example
///
/// ```rust
/// use deckflow::core::config::ParserConfig;
///
/// let config = ParserConfig {
///     batch_size: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Program that runs the extractor (an interpreter or a standalone binary)
    #[serde(default = "default_extractor_program")]
    pub extractor_program: PathBuf,

    /// Worker script passed as the first argument to `extractor_program`
    #[serde(default)]
    pub extractor_script: Option<PathBuf>,

    /// Extra arguments placed before the per-request arguments
    #[serde(default)]
    pub extractor_args: Vec<String>,

    /// Options forwarded to the extractor with every unit request
    #[serde(default)]
    pub extractor_options: HashMap<String, Value>,

    /// Number of workers (None = CPU count minus one, at least one)
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Units dispatched together; the next batch starts once this one is done
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Inputs larger than this use `large_file_batch_size`
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,

    #[serde(default = "default_large_file_batch_size")]
    pub large_file_batch_size: usize,

    /// Size of each pooled I/O buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle buffers kept by the pool
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// Deadline per worker task (None = no deadline)
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: Option<u64>,

    /// Entries retained by the error recorder
    #[serde(default = "default_max_error_log_size")]
    pub max_error_log_size: usize,

    /// Staging area for input copies and extractor output (None = system temp dir)
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Skip probing the extractor before parsing. Meant for tests.
    #[serde(default)]
    pub skip_dependency_check: bool,

    #[serde(default)]
    pub cache: DocumentCacheConfig,
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_memory_entries")]
    pub max_memory_entries: usize,

    /// Disk tier location (None = user cache directory)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_cache_prefix")]
    pub prefix: String,

    /// Background sweep period (None = sweep only on demand)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: Option<u64>,
}

impl Default for DocumentCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_memory_entries: default_cache_memory_entries(),
            cache_dir: None,
            prefix: default_cache_prefix(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl DocumentCacheConfig {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_memory_entries: self.max_memory_entries,
            ttl: Duration::from_secs(self.ttl_secs),
            cache_dir: self.cache_dir.clone(),
            use_disk_cache: true,
            prefix: self.prefix.clone(),
            cleanup_interval: self.cleanup_interval_secs.map(Duration::from_secs),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            extractor_program: default_extractor_program(),
            extractor_script: None,
            extractor_args: Vec::new(),
            extractor_options: HashMap::new(),
            max_workers: None,
            batch_size: default_batch_size(),
            large_file_threshold_bytes: default_large_file_threshold(),
            large_file_batch_size: default_large_file_batch_size(),
            buffer_size: default_buffer_size(),
            buffer_pool_size: default_buffer_pool_size(),
            task_timeout_secs: default_task_timeout_secs(),
            max_error_log_size: default_max_error_log_size(),
            work_dir: None,
            skip_dependency_check: false,
            cache: DocumentCacheConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_extractor_program() -> PathBuf {
    PathBuf::from("python3")
}
fn default_batch_size() -> usize {
    10
}
fn default_large_file_threshold() -> u64 {
    10 * 1024 * 1024
}
fn default_large_file_batch_size() -> usize {
    5
}
fn default_buffer_size() -> usize {
    1024 * 1024
}
fn default_buffer_pool_size() -> usize {
    10
}
fn default_task_timeout_secs() -> Option<u64> {
    Some(crate::workers::pool::DEFAULT_TASK_TIMEOUT_SECONDS)
}
fn default_max_error_log_size() -> usize {
    crate::diagnostics::DEFAULT_ERROR_LOG_CAPACITY
}
fn default_cache_ttl_secs() -> u64 {
    60 * 60
}
fn default_cache_memory_entries() -> usize {
    DOCUMENT_CACHE_MEMORY_ENTRIES
}
fn default_cache_prefix() -> String {
    DOCUMENT_CACHE_PREFIX.to_string()
}
fn default_cleanup_interval_secs() -> Option<u64> {
    Some(10 * 60)
}

impl ParserConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeckflowError::validation("batch_size must be greater than zero"));
        }
        if self.large_file_batch_size == 0 {
            return Err(DeckflowError::validation("large_file_batch_size must be greater than zero"));
        }
        if self.buffer_size == 0 {
            return Err(DeckflowError::validation("buffer_size must be greater than zero"));
        }
        if self.max_workers == Some(0) {
            return Err(DeckflowError::validation("max_workers must be greater than zero"));
        }
        Ok(())
    }

    pub fn effective_max_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(default_max_workers)
    }

    pub fn effective_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("deckflow-staging"))
    }

    /// Batch size for an input of `file_size` bytes.
    pub fn batch_size_for(&self, file_size: u64) -> usize {
        if file_size > self.large_file_threshold_bytes {
            self.batch_size.min(self.large_file_batch_size)
        } else {
            self.batch_size
        }
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: self.effective_max_workers(),
            task_timeout: self.task_timeout(),
        }
    }

    /// Apply `DECKFLOW_*` environment variables on top of this configuration.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(program) = env_var("DECKFLOW_EXTRACTOR_PROGRAM") {
            self.extractor_program = PathBuf::from(program);
        }
        if let Some(script) = env_var("DECKFLOW_EXTRACTOR_SCRIPT") {
            self.extractor_script = Some(PathBuf::from(script));
        }
        if let Some(workers) = env_var("DECKFLOW_MAX_WORKERS") {
            self.max_workers = Some(parse_env("DECKFLOW_MAX_WORKERS", &workers)?);
        }
        if let Some(batch) = env_var("DECKFLOW_BATCH_SIZE") {
            self.batch_size = parse_env("DECKFLOW_BATCH_SIZE", &batch)?;
        }
        if let Some(dir) = env_var("DECKFLOW_CACHE_DIR") {
            self.cache.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(ttl) = env_var("DECKFLOW_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_env("DECKFLOW_CACHE_TTL_SECS", &ttl)?;
        }
        Ok(self)
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| DeckflowError::validation(format!("Invalid TOML in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| DeckflowError::validation(format!("Invalid YAML in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        serde_json::from_str(&content)
            .map_err(|e| DeckflowError::validation(format!("Invalid JSON in {}: {}", path.as_ref().display(), e)))
    }

    /// Load from a file, picking the format by extension (`.toml`, `.yaml`/`.yml`, `.json`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(DeckflowError::validation(format!(
                "Unsupported config format: {}",
                path.display()
            ))),
        }
    }

    /// Discover `deckflow.toml` in the current directory or any parent.
    ///
    /// # Returns
    ///
    /// - `Some(config)` if found
    /// - `None` if no config file found
    pub fn discover() -> Result<Option<Self>> {
        let mut current = std::env::current_dir()?;

        loop {
            let candidate = current.join("deckflow.toml");
            if candidate.exists() {
                return Ok(Some(Self::from_toml_file(candidate)?));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| DeckflowError::validation(format!("Failed to read config file {}: {}", path.display(), e)))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DeckflowError::validation(format!("Invalid value for {}: '{}' ({})", name, value, e)))
}
