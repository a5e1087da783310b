//! Supervised pool of extraction workers.
//!
//! - `extractor`: the [`UnitExtractor`] boundary and its subprocess implementation
//! - `pool`: the [`WorkerPool`] with its FIFO queue and task correlation table

pub mod extractor;
pub mod pool;

use crate::types::{DocumentMetadata, UnitContent};
use crate::{DeckflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

pub use extractor::{SubprocessExtractor, UnitExtractor, UnitRequest};
pub use pool::{PoolStatus, WorkerId, WorkerPool, WorkerPoolConfig};

pub type TaskId = String;

/// What a worker is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    ParseUnit(UnitRequest),
    ExtractMetadata { input_path: PathBuf },
    CountUnits { input_path: PathBuf },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ParseUnit(_) => "parse_unit",
            TaskKind::ExtractMetadata { .. } => "extract_metadata",
            TaskKind::CountUnits { .. } => "count_units",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub submitted_at: Instant,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: format!("{}_{}", kind.name(), uuid::Uuid::new_v4().simple()),
            kind,
            submitted_at: Instant::now(),
        }
    }
}

/// Successful output of a task; the variant always matches the [`TaskKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Unit(UnitContent),
    Metadata(DocumentMetadata),
    UnitCount(usize),
}

impl TaskOutput {
    pub fn into_unit(self) -> Result<UnitContent> {
        match self {
            TaskOutput::Unit(unit) => Ok(unit),
            other => Err(unexpected("unit", &other)),
        }
    }

    pub fn into_metadata(self) -> Result<DocumentMetadata> {
        match self {
            TaskOutput::Metadata(metadata) => Ok(metadata),
            other => Err(unexpected("metadata", &other)),
        }
    }

    pub fn into_unit_count(self) -> Result<usize> {
        match self {
            TaskOutput::UnitCount(count) => Ok(count),
            other => Err(unexpected("unit count", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &TaskOutput) -> DeckflowError {
    DeckflowError::worker(format!("Expected {} output, got {:?}", wanted, got))
}

/// Outcome delivered to the caller that submitted `task_id`.
#[derive(Debug)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub outcome: Result<TaskOutput>,
}

pub(crate) async fn execute(extractor: &dyn UnitExtractor, kind: &TaskKind) -> Result<TaskOutput> {
    match kind {
        TaskKind::ParseUnit(request) => extractor.parse_unit(request).await.map(TaskOutput::Unit),
        TaskKind::ExtractMetadata { input_path } => extractor.extract_metadata(input_path).await.map(TaskOutput::Metadata),
        TaskKind::CountUnits { input_path } => extractor.count_units(input_path).await.map(TaskOutput::UnitCount),
    }
}
