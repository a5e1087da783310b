//! Bounded, structured record of errors seen across the pipeline.
//!
//! Components report failures here with a severity and whether they recovered. The recorder
//! keeps the newest `capacity` entries (newest first), a cumulative `method:message` frequency
//! table that survives ring eviction, and emits a `tracing` event per entry.

use crate::DeckflowError;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default number of retained entries.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 100;

const MOST_FREQUENT_LIMIT: usize = 5;

/// Free-form key/value context attached to a recorded error.
pub type ErrorContext = BTreeMap<String, String>;

/// Build an [`ErrorContext`] from string pairs.
pub fn context(pairs: &[(&str, &str)]) -> ErrorContext {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Snapshot of the host taken when an error is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub crate_version: String,
    pub os: String,
    pub arch: String,
    pub available_parallelism: usize,
    pub pid: u32,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            available_parallelism: num_cpus::get(),
            pid: std::process::id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub id: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Operation that failed, e.g. `parse` or `cache.set`.
    pub method: String,
    pub message: String,
    /// Error variant name, see [`DeckflowError::kind`].
    pub kind: String,
    /// Messages of the error's `source()` chain, outermost first.
    pub source_chain: Vec<String>,
    pub context: ErrorContext,
    pub severity: Severity,
    pub recovered: bool,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrequency {
    pub method: String,
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    /// Entries currently retained.
    pub total_errors: usize,
    pub by_severity: SeverityCounts,
    pub by_method: BTreeMap<String, usize>,
    /// Top five `method:message` pairs since the last clear, most frequent first.
    pub most_frequent: Vec<ErrorFrequency>,
    /// Retained entries marked recovered.
    pub recovered_errors: usize,
    /// Share of retained entries marked recovered, 0.0 when empty.
    pub recovery_rate: f64,
    pub last_error: Option<StructuredError>,
}

#[derive(Default)]
struct RecorderState {
    log: VecDeque<StructuredError>,
    frequency: AHashMap<(String, String), usize>,
}

pub struct ErrorRecorder {
    capacity: usize,
    state: Mutex<RecorderState>,
}

impl ErrorRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(RecorderState {
                log: VecDeque::with_capacity(capacity),
                frequency: AHashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `error` raised by `method`, evicting the oldest entry when full.
    pub fn record(
        &self,
        method: &str,
        error: &DeckflowError,
        context: ErrorContext,
        severity: Severity,
        recovered: bool,
    ) -> StructuredError {
        let mut source_chain = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            source_chain.push(cause.to_string());
            source = cause.source();
        }

        let entry = StructuredError {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            method: method.to_string(),
            message: error.to_string(),
            kind: error.kind().to_string(),
            source_chain,
            context,
            severity,
            recovered,
            system: SystemInfo::current(),
        };

        match severity {
            Severity::Low => tracing::debug!("[{}] {} (recovered: {})", method, entry.message, recovered),
            Severity::Medium => tracing::warn!("[{}] {} (recovered: {})", method, entry.message, recovered),
            Severity::High | Severity::Critical => {
                tracing::error!("[{}] {:?} error: {} (recovered: {})", method, severity, entry.message, recovered)
            }
        }

        let mut state = self.state.lock();
        *state
            .frequency
            .entry((entry.method.clone(), entry.message.clone()))
            .or_insert(0) += 1;
        state.log.push_front(entry.clone());
        state.log.truncate(self.capacity);

        entry
    }

    /// Retained entries, newest first, optionally limited to the first `limit`.
    ///
    /// A limit of zero returns every entry.
    pub fn get_error_log(&self, limit: Option<usize>) -> Vec<StructuredError> {
        let state = self.state.lock();
        let take = limit.filter(|limit| *limit > 0).unwrap_or(state.log.len());
        state.log.iter().take(take).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How often `method` has failed with `message` since the last clear.
    pub fn frequency(&self, method: &str, message: &str) -> usize {
        self.state
            .lock()
            .frequency
            .get(&(method.to_string(), message.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn analyze(&self) -> ErrorAnalysis {
        let state = self.state.lock();

        let mut by_severity = SeverityCounts::default();
        let mut by_method = BTreeMap::new();
        let mut recovered = 0usize;

        for entry in &state.log {
            match entry.severity {
                Severity::Low => by_severity.low += 1,
                Severity::Medium => by_severity.medium += 1,
                Severity::High => by_severity.high += 1,
                Severity::Critical => by_severity.critical += 1,
            }
            *by_method.entry(entry.method.clone()).or_insert(0) += 1;
            if entry.recovered {
                recovered += 1;
            }
        }

        let mut most_frequent: Vec<ErrorFrequency> = state
            .frequency
            .iter()
            .map(|((method, message), count)| ErrorFrequency {
                method: method.clone(),
                message: message.clone(),
                count: *count,
            })
            .collect();
        most_frequent.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.method.cmp(&b.method))
                .then_with(|| a.message.cmp(&b.message))
        });
        most_frequent.truncate(MOST_FREQUENT_LIMIT);

        let total_errors = state.log.len();
        ErrorAnalysis {
            total_errors,
            by_severity,
            by_method,
            most_frequent,
            recovered_errors: recovered,
            recovery_rate: if total_errors == 0 {
                0.0
            } else {
                recovered as f64 / total_errors as f64
            },
            last_error: state.log.front().cloned(),
        }
    }

    /// Drop all entries and frequency counts.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.log.clear();
        state.frequency.clear();
    }
}

impl Default for ErrorRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_CAPACITY)
    }
}

impl std::fmt::Debug for ErrorRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecorder")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
