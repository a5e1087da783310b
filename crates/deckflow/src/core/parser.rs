//! The document parser: validation, hashing, caching and batched unit extraction.
//!
//! A parse runs through these stages:
//!
//! 1. validate the input path
//! 2. make sure the extractor can run (unless disabled)
//! 3. hash the file and consult the result cache
//! 4. stage a copy of the input in the work directory
//! 5. count units and read metadata concurrently
//! 6. extract units batch by batch on the worker pool
//! 7. store the assembled result in the cache
//!
//! A unit that fails to extract is replaced by a placeholder so that `units[i].index == i`
//! always holds. Only failures before unit extraction fail the parse itself;
//! [`DocumentParser::parse_with_fallback`] turns those into a partial result instead.

use crate::cache::DocumentCache;
use crate::core::config::ParserConfig;
use crate::diagnostics::{ErrorAnalysis, ErrorRecorder, Severity, StructuredError, context};
use crate::io::{StreamingIo, staging_path};
use crate::types::{DocumentMetadata, ParseFailure, ParseOptions, ParseResult, UnitContent, file_name, file_stem};
use crate::utils::pool::BufferPool;
use crate::workers::{PoolStatus, SubprocessExtractor, TaskKind, UnitExtractor, UnitRequest, WorkerPool};
use crate::{DeckflowError, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};
use tokio::task::JoinSet;

/// Parses compound documents unit by unit on a pool of extraction workers.
///
/// Each parser owns its pool, cache and error log; create one per process (or per test) and
/// call [`dispose`](Self::dispose) when done.
///
/// # Example
///
/// ```rust,no_run
/// use deckflow::{DocumentParser, ParseOptions, ParserConfig};
///
/// # async fn demo() -> deckflow::Result<()> {
/// let parser = DocumentParser::new(ParserConfig::default())?;
/// let result = parser.parse("quarterly.pptx", ParseOptions::default()).await?;
/// println!("{} units", result.total_units);
/// parser.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct DocumentParser {
    config: ParserConfig,
    extractor: Arc<dyn UnitExtractor>,
    pool: WorkerPool,
    io: StreamingIo,
    cache: Option<DocumentCache>,
    errors: Arc<ErrorRecorder>,
    sweeper_started: AtomicBool,
}

impl DocumentParser {
    /// Create a parser running the subprocess extractor described by `config`.
    pub fn new(config: ParserConfig) -> Result<Self> {
        let mut extractor = SubprocessExtractor::new(config.extractor_program.clone()).with_args(config.extractor_args.clone());
        if let Some(script) = &config.extractor_script {
            extractor = extractor.with_script(script.clone());
        }
        if let Some(timeout) = config.task_timeout() {
            extractor = extractor.with_timeout(timeout);
        }
        Self::with_extractor(config, Arc::new(extractor))
    }

    /// Create a parser around any [`UnitExtractor`].
    pub fn with_extractor(config: ParserConfig, extractor: Arc<dyn UnitExtractor>) -> Result<Self> {
        config.validate()?;

        let errors = Arc::new(ErrorRecorder::new(config.max_error_log_size));
        let cache = if config.cache.enabled {
            Some(DocumentCache::with_options(
                config.cache.to_cache_config(),
                Some(Arc::clone(&errors)),
                None,
            )?)
        } else {
            None
        };

        Ok(Self::assemble(config, extractor, cache, errors))
    }

    /// Create a parser using `cache` instead of the one described by `config.cache`.
    pub fn with_cache(config: ParserConfig, extractor: Arc<dyn UnitExtractor>, cache: Option<DocumentCache>) -> Result<Self> {
        config.validate()?;
        let errors = Arc::new(ErrorRecorder::new(config.max_error_log_size));
        Ok(Self::assemble(config, extractor, cache, errors))
    }

    fn assemble(
        config: ParserConfig,
        extractor: Arc<dyn UnitExtractor>,
        cache: Option<DocumentCache>,
        errors: Arc<ErrorRecorder>,
    ) -> Self {
        let pool = WorkerPool::new(Arc::clone(&extractor), config.worker_pool_config(), Some(Arc::clone(&errors)));
        let io = StreamingIo::new(BufferPool::new(config.buffer_size, config.buffer_pool_size));

        Self {
            config,
            extractor,
            pool,
            io,
            cache,
            errors,
            sweeper_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse `path`, failing if the document cannot be opened, counted or staged.
    ///
    /// Individual unit failures do not fail the parse; they become placeholders.
    pub async fn parse(&self, path: impl AsRef<Path>, options: ParseOptions) -> Result<ParseResult> {
        let path = path.as_ref();
        match self.run_pipeline(path, options).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.errors.record(
                    "parse",
                    &err,
                    context(&[("file_path", &path.display().to_string())]),
                    Severity::Critical,
                    false,
                );
                Err(err)
            }
        }
    }

    /// Parse `path`, degrading to a partial result instead of failing.
    ///
    /// The partial result carries the file-system timestamps as metadata and a single
    /// placeholder unit. If even that cannot be built, an empty result is returned.
    pub async fn parse_with_fallback(&self, path: impl AsRef<Path>, options: ParseOptions) -> ParseResult {
        let path = path.as_ref();
        let err = match self.parse(path, options).await {
            Ok(result) => return result,
            Err(err) => err,
        };

        tracing::warn!("Parsing {} failed, building partial result: {}", path.display(), err);
        self.errors.record(
            "parse_with_fallback",
            &err,
            context(&[("file_path", &path.display().to_string()), ("stage", "fallback")]),
            Severity::Medium,
            true,
        );

        match partial_result(path, &err).await {
            Ok(result) => result,
            Err(fallback_err) => {
                self.errors.record(
                    "parse_with_fallback",
                    &fallback_err,
                    context(&[
                        ("file_path", &path.display().to_string()),
                        ("original_error", &err.to_string()),
                    ]),
                    Severity::High,
                    false,
                );
                minimal_result(path, &err, &fallback_err)
            }
        }
    }

    async fn run_pipeline(&self, path: &Path, options: ParseOptions) -> Result<ParseResult> {
        let started = Instant::now();
        self.ensure_cache_sweeper();

        let file_size = validate_input(path).await?;

        if !self.config.skip_dependency_check {
            self.extractor.check_available().await?;
        }

        let file_hash = self.io.hash_file(path).await?;

        let use_cache = !options.skip_cache && !options.force_reparse;
        if use_cache
            && let Some(cache) = &self.cache
            && let Some(result) = cache.get_result(path, &file_hash)
        {
            tracing::debug!("Serving {} from cache", path.display());
            return Ok(result);
        }

        let staged = staging_path(&self.config.effective_work_dir(), path, &file_hash);
        let output_dir = staged
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.effective_work_dir());
        self.io.stage_file(path, &staged, file_size).await?;

        let (count, metadata) = tokio::join!(
            self.pool.run_task(TaskKind::CountUnits {
                input_path: staged.clone(),
            }),
            self.pool.run_task(TaskKind::ExtractMetadata {
                input_path: staged.clone(),
            }),
        );

        let unit_count = count.and_then(|output| output.into_unit_count())?;
        let metadata = match metadata.and_then(|output| output.into_metadata()) {
            Ok(metadata) => metadata,
            Err(err) => {
                self.errors.record(
                    "extract_metadata",
                    &err,
                    context(&[("file_path", &path.display().to_string())]),
                    Severity::Low,
                    true,
                );
                DocumentMetadata::fallback_for(path)
            }
        };

        let batch_size = self.config.batch_size_for(file_size);
        let units = self.extract_units(path, &staged, &output_dir, unit_count, batch_size).await;

        let result = ParseResult::new(file_name(path), units, metadata);
        tracing::info!(
            "Parsed {} ({} units, {} placeholders) in {:?}",
            path.display(),
            result.total_units,
            result.failed_units(),
            started.elapsed()
        );

        if !options.skip_cache
            && let Some(cache) = &self.cache
            && !cache.store_result(path, &file_hash, file_size, &result, started.elapsed())
        {
            tracing::debug!("Result for {} was not fully cached", path.display());
        }

        Ok(result)
    }

    /// Number of units in `path`, as reported by the extractor.
    pub async fn get_unit_count(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let outcome = async {
            validate_input(path).await?;
            if !self.config.skip_dependency_check {
                self.extractor.check_available().await?;
            }
            self.pool
                .run_task(TaskKind::CountUnits {
                    input_path: path.to_path_buf(),
                })
                .await?
                .into_unit_count()
        }
        .await;

        if let Err(err) = &outcome {
            self.errors.record(
                "get_unit_count",
                err,
                context(&[("file_path", &path.display().to_string())]),
                Severity::Medium,
                false,
            );
        }
        outcome
    }

    /// Metadata of `path`, or file-system derived metadata when the extractor cannot read it.
    pub async fn get_metadata(&self, path: impl AsRef<Path>) -> DocumentMetadata {
        let path = path.as_ref();
        let outcome = async {
            validate_input(path).await?;
            self.pool
                .run_task(TaskKind::ExtractMetadata {
                    input_path: path.to_path_buf(),
                })
                .await?
                .into_metadata()
        }
        .await;

        match outcome {
            Ok(metadata) => metadata,
            Err(err) => {
                self.errors.record(
                    "get_metadata",
                    &err,
                    context(&[("file_path", &path.display().to_string())]),
                    Severity::Low,
                    true,
                );
                DocumentMetadata::fallback_for(path)
            }
        }
    }

    /// Extract `unit_count` units in sequential batches of `batch_size`.
    async fn extract_units(
        &self,
        path: &Path,
        staged: &Path,
        output_dir: &Path,
        unit_count: usize,
        batch_size: usize,
    ) -> Vec<UnitContent> {
        let mut units = Vec::with_capacity(unit_count);

        for batch_start in (0..unit_count).step_by(batch_size.max(1)) {
            let batch_end = (batch_start + batch_size).min(unit_count);
            tracing::debug!(
                "Extracting units {}..{} of {} from {}",
                batch_start,
                batch_end,
                unit_count,
                path.display()
            );

            let mut tasks = JoinSet::new();
            for unit_index in batch_start..batch_end {
                let pool = self.pool.clone();
                let request = UnitRequest {
                    input_path: staged.to_path_buf(),
                    output_dir: output_dir.to_path_buf(),
                    unit_index,
                    options: self.config.extractor_options.clone(),
                };
                tasks.spawn(async move {
                    let outcome = pool
                        .run_task(TaskKind::ParseUnit(request))
                        .await
                        .and_then(|output| output.into_unit());
                    (unit_index, outcome)
                });
            }

            let mut batch: Vec<Option<UnitContent>> = vec![None; batch_end - batch_start];
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((unit_index, Ok(mut unit))) => {
                        unit.index = unit_index;
                        batch[unit_index - batch_start] = Some(unit);
                    }
                    Ok((unit_index, Err(err))) => {
                        batch[unit_index - batch_start] = Some(self.unit_placeholder(path, unit_index, &err));
                    }
                    Err(join_err) => {
                        // the slot stays empty and is filled below
                        tracing::error!("Unit task for {} panicked: {}", path.display(), join_err);
                    }
                }
            }

            for (offset, slot) in batch.into_iter().enumerate() {
                let unit_index = batch_start + offset;
                let unit = match slot {
                    Some(unit) => unit,
                    None => {
                        let err = DeckflowError::worker(format!("Unit {} task did not complete", unit_index));
                        self.unit_placeholder(path, unit_index, &err)
                    }
                };
                units.push(unit);
            }
        }

        units
    }

    fn unit_placeholder(&self, path: &Path, unit_index: usize, err: &DeckflowError) -> UnitContent {
        self.errors.record(
            "parse_unit",
            err,
            context(&[
                ("file_path", &path.display().to_string()),
                ("unit_index", &unit_index.to_string()),
            ]),
            Severity::Medium,
            true,
        );
        UnitContent::placeholder(unit_index, Some(err.to_string()))
    }

    fn ensure_cache_sweeper(&self) {
        let (Some(cache), Some(interval)) = (&self.cache, self.config.cache.cleanup_interval_secs) else {
            return;
        };
        if interval == 0 || self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = cache.inner().start_cleanup_task(std::time::Duration::from_secs(interval)) {
            tracing::warn!("Cache cleanup task not started: {}", err);
            self.sweeper_started.store(false, Ordering::Release);
        }
    }

    /// Recorded errors, newest first.
    pub fn get_error_log(&self, limit: Option<usize>) -> Vec<StructuredError> {
        self.errors.get_error_log(limit)
    }

    pub fn analyze_errors(&self) -> ErrorAnalysis {
        self.errors.analyze()
    }

    pub fn clear_error_log(&self) {
        self.errors.clear();
    }

    pub fn error_recorder(&self) -> &Arc<ErrorRecorder> {
        &self.errors
    }

    pub fn cache(&self) -> Option<&DocumentCache> {
        self.cache.as_ref()
    }

    pub fn cache_stats(&self) -> Option<crate::cache::CacheStats> {
        self.cache.as_ref().map(|cache| cache.inner().stats())
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Stop the workers and the cache sweeper, and release pooled buffers.
    pub async fn dispose(&self) {
        self.pool.terminate().await;
        if let Some(cache) = &self.cache {
            cache.dispose();
        }
        self.sweeper_started.store(false, Ordering::Release);
        self.io.dispose();
    }
}

impl std::fmt::Debug for DocumentParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentParser")
            .field("extractor", &self.extractor.name())
            .field("pool", &self.pool)
            .field("cache_enabled", &self.cache.is_some())
            .finish()
    }
}

/// Size of `path` in bytes, or a validation error if it cannot be parsed.
async fn validate_input(path: &Path) -> Result<u64> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DeckflowError::validation(format!("File not found: {}", path.display())));
        }
        Err(e) => {
            return Err(DeckflowError::validation_with_source(
                format!("Cannot access file: {}", path.display()),
                e,
            ));
        }
    };

    if !metadata.is_file() {
        return Err(DeckflowError::validation(format!("Not a file: {}", path.display())));
    }
    if metadata.len() == 0 {
        return Err(DeckflowError::validation(format!("File is empty: {}", path.display())));
    }

    tokio::fs::File::open(path)
        .await
        .map_err(|e| DeckflowError::validation_with_source(format!("File is not readable: {}", path.display()), e))?;

    Ok(metadata.len())
}

fn iso_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

async fn partial_result(path: &Path, err: &DeckflowError) -> Result<ParseResult> {
    let stat = tokio::fs::metadata(path).await?;

    let metadata = DocumentMetadata {
        title: Some(file_stem(path)),
        created: stat.created().ok().map(iso_timestamp),
        modified: stat.modified().ok().map(iso_timestamp),
        ..Default::default()
    };

    let mut result = ParseResult::new(
        file_name(path),
        vec![UnitContent::placeholder(0, Some(err.to_string()))],
        metadata,
    );
    result.error = Some(ParseFailure {
        message: err.to_string(),
        recovery_attempted: true,
        recovery_successful: true,
        details: Some(format!("Partial result built from file metadata after {} error", err.kind())),
        timestamp: Utc::now().to_rfc3339(),
    });
    Ok(result)
}

fn minimal_result(path: &Path, err: &DeckflowError, fallback_err: &DeckflowError) -> ParseResult {
    let mut result = ParseResult::new(file_name(path), Vec::new(), DocumentMetadata::default());
    result.error = Some(ParseFailure {
        message: err.to_string(),
        recovery_attempted: true,
        recovery_successful: false,
        details: Some(format!("Fallback failed: {}", fallback_err)),
        timestamp: Utc::now().to_rfc3339(),
    });
    result
}
