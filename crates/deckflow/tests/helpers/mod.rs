//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use deckflow::types::{DocumentMetadata, TextElement, UnitContent};
use deckflow::{DeckflowError, ParserConfig, Result, UnitExtractor, UnitRequest};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-process extractor that records how often it is called.
pub struct SpyExtractor {
    pub units: usize,
    /// Units whose extraction fails.
    pub failing_units: HashSet<usize>,
    /// Fail `count_units` (and with it the whole parse).
    pub fail_count: bool,
    pub fail_metadata: bool,
    pub available: bool,
    /// Stagger unit completion so later units can finish first.
    pub jitter: bool,
    pub parse_calls: AtomicUsize,
    pub count_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl SpyExtractor {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            failing_units: HashSet::new(),
            fail_count: false,
            fail_metadata: false,
            available: true,
            jitter: false,
            parse_calls: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, units: impl IntoIterator<Item = usize>) -> Self {
        self.failing_units = units.into_iter().collect();
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn parse_calls(&self) -> usize {
        self.parse_calls.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitExtractor for SpyExtractor {
    fn name(&self) -> &str {
        "spy"
    }

    async fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(DeckflowError::MissingDependency("spy extractor is not installed".to_string()))
        }
    }

    async fn parse_unit(&self, request: &UnitRequest) -> Result<UnitContent> {
        self.parse_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.jitter {
            // earlier units sleep longer
            let delay = ((self.units.saturating_sub(request.unit_index)) * 7 % 23) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_units.contains(&request.unit_index) {
            return Err(DeckflowError::extraction(format!(
                "unit {} could not be rendered",
                request.unit_index
            )));
        }

        Ok(UnitContent {
            index: request.unit_index,
            text_elements: vec![TextElement {
                id: format!("title-{}", request.unit_index),
                text: format!("  Slide   {} ", request.unit_index + 1),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    async fn extract_metadata(&self, _input_path: &Path) -> Result<DocumentMetadata> {
        if self.fail_metadata {
            return Err(DeckflowError::extraction("document properties are unreadable"));
        }
        Ok(DocumentMetadata {
            title: Some("Platform Roadmap".to_string()),
            author: Some("Platform Team".to_string()),
            revision: Some(4),
            ..Default::default()
        })
    }

    async fn count_units(&self, _input_path: &Path) -> Result<usize> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_count {
            return Err(DeckflowError::extraction("document is not a presentation"));
        }
        Ok(self.units)
    }
}

/// Configuration isolated inside `dir`: own work directory, own cache, no sweeper.
pub fn test_config(dir: &TempDir) -> ParserConfig {
    let mut config = ParserConfig {
        max_workers: Some(3),
        batch_size: 4,
        skip_dependency_check: true,
        work_dir: Some(dir.path().join("work")),
        ..Default::default()
    };
    config.cache.cache_dir = Some(dir.path().join("cache"));
    config.cache.cleanup_interval_secs = None;
    config
}

/// Write a small stand-in document and return its path.
pub fn write_deck(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
