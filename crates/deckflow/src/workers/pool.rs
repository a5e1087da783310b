//! Fixed-size worker pool with a FIFO queue and a task correlation table.
//!
//! Each worker is a Tokio task owning a single-slot inbox. The pool hands a task to an idle
//! worker or appends it to the queue; when a worker finishes, the oldest queued task goes to
//! that same worker. Results travel back through a `oneshot` channel stored under the task id,
//! so callers always receive the result of the task they submitted.
//!
//! # Failure handling
//!
//! - An extractor error is delivered to the caller; the worker stays.
//! - A task running past the deadline is aborted, the caller receives `Timeout`, and the
//!   worker is replaced.
//! - A panic inside the extractor crashes the worker: the caller receives a `Worker` error,
//!   the worker is replaced, and the task is not requeued.
//!
//! At no point are more than `max_workers` tasks running.

use super::{Task, TaskId, TaskKind, TaskOutput, TaskResult, UnitExtractor, execute};
use crate::diagnostics::{ErrorRecorder, Severity, context};
use crate::{DeckflowError, Result};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

pub type WorkerId = u64;

/// Default per-task deadline (120 seconds)
pub const DEFAULT_TASK_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    /// `None` lets tasks run indefinitely.
    pub task_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout: Some(Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECONDS)),
        }
    }
}

/// One less than the number of CPUs, and at least one.
pub fn default_max_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub active_workers: usize,
    pub queue_length: usize,
    pub initialized: bool,
}

struct WorkerSlot {
    id: WorkerId,
    inbox: mpsc::Sender<Task>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    initialized: bool,
    workers: Vec<WorkerSlot>,
    queue: VecDeque<Task>,
    callbacks: AHashMap<TaskId, oneshot::Sender<TaskResult>>,
    active: AHashMap<TaskId, WorkerId>,
}

impl PoolState {
    fn is_busy(&self, worker: WorkerId) -> bool {
        self.active.values().any(|id| *id == worker)
    }

    fn idle_worker(&self) -> Option<WorkerId> {
        self.workers.iter().map(|slot| slot.id).find(|id| !self.is_busy(*id))
    }

    /// Hand `task` to `worker`; falls back to the head of the queue if the worker is gone.
    fn assign(&mut self, worker: WorkerId, task: Task) {
        let task_id = task.id.clone();
        let sent = match self.workers.iter().find(|slot| slot.id == worker) {
            Some(slot) => slot.inbox.try_send(task).map_err(|e| e.into_inner()),
            None => Err(task),
        };

        match sent {
            Ok(()) => {
                self.active.insert(task_id, worker);
            }
            Err(task) => {
                tracing::warn!("Worker {} could not take task {}, requeueing", worker, task_id);
                self.queue.push_front(task);
            }
        }
    }

    fn dispatch_next(&mut self, worker: WorkerId) {
        if let Some(task) = self.queue.pop_front() {
            self.assign(worker, task);
        }
    }
}

struct Shared {
    extractor: Arc<dyn UnitExtractor>,
    config: WorkerPoolConfig,
    recorder: Option<Arc<ErrorRecorder>>,
    state: Mutex<PoolState>,
    next_worker_id: AtomicU64,
}

impl Shared {
    fn ensure_workers(self: &Arc<Self>, state: &mut PoolState) -> Result<()> {
        if state.initialized {
            return Ok(());
        }

        tokio::runtime::Handle::try_current()
            .map_err(|e| DeckflowError::worker_with_source("The worker pool requires a Tokio runtime", e))?;

        for _ in 0..self.config.max_workers {
            self.spawn_worker(state);
        }
        state.initialized = true;

        tracing::info!(
            "Worker pool initialized with {} workers using the {} extractor",
            self.config.max_workers,
            self.extractor.name()
        );
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> WorkerId {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (inbox, tasks) = mpsc::channel(1);
        let handle = tokio::spawn(run_worker(
            id,
            tasks,
            Arc::clone(&self.extractor),
            self.config.task_timeout,
            Arc::downgrade(self),
        ));
        state.workers.push(WorkerSlot { id, inbox, handle });
        id
    }

    fn complete(self: &Arc<Self>, worker: WorkerId, result: TaskResult) {
        let mut state = self.state.lock();
        state.active.remove(&result.task_id);
        if let Some(callback) = state.callbacks.remove(&result.task_id) {
            let _ = callback.send(result);
        }
        if state.initialized {
            state.dispatch_next(worker);
        }
    }

    /// Fail the worker's task with `error`, drop the worker and start a replacement.
    fn retire(self: &Arc<Self>, worker: WorkerId, task_id: TaskId, error: DeckflowError, severity: Severity) {
        if let Some(recorder) = &self.recorder {
            recorder.record(
                "worker_pool.run_task",
                &error,
                context(&[("task_id", &task_id), ("worker_id", &worker.to_string())]),
                severity,
                true,
            );
        }

        let mut state = self.state.lock();
        state.active.remove(&task_id);
        if let Some(callback) = state.callbacks.remove(&task_id) {
            let _ = callback.send(TaskResult {
                task_id: task_id.clone(),
                outcome: Err(error),
            });
        }

        let before = state.workers.len();
        state.workers.retain(|slot| slot.id != worker);
        if state.initialized && state.workers.len() < before {
            let replacement = self.spawn_worker(&mut state);
            tracing::warn!("Worker {} retired after task {}, replaced by worker {}", worker, task_id, replacement);
            state.dispatch_next(replacement);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for slot in self.state.get_mut().workers.drain(..) {
            slot.handle.abort();
        }
    }
}

/// Aborts the wrapped task when dropped, so aborting a worker also aborts its job.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum WorkerExit {
    Completed(Result<TaskOutput>),
    TimedOut(Duration),
    Crashed(String),
    Cancelled,
}

impl WorkerExit {
    fn from_join(joined: std::result::Result<Result<TaskOutput>, JoinError>) -> Self {
        match joined {
            Ok(outcome) => WorkerExit::Completed(outcome),
            Err(e) if e.is_panic() => WorkerExit::Crashed(e.to_string()),
            Err(_) => WorkerExit::Cancelled,
        }
    }
}

async fn run_worker(
    id: WorkerId,
    mut tasks: mpsc::Receiver<Task>,
    extractor: Arc<dyn UnitExtractor>,
    task_timeout: Option<Duration>,
    pool: Weak<Shared>,
) {
    while let Some(task) = tasks.recv().await {
        let task_id = task.id.clone();
        let kind = task.kind.name();
        let queued_for = task.submitted_at.elapsed();
        let job_extractor = Arc::clone(&extractor);
        let mut job = AbortOnDrop(tokio::spawn(async move {
            execute(job_extractor.as_ref(), &task.kind).await
        }));

        let exit = match task_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut job.0).await {
                Ok(joined) => WorkerExit::from_join(joined),
                Err(_) => WorkerExit::TimedOut(limit),
            },
            None => WorkerExit::from_join((&mut job.0).await),
        };
        drop(job);

        let Some(shared) = pool.upgrade() else {
            return;
        };

        match exit {
            WorkerExit::Completed(outcome) => {
                tracing::debug!("Worker {} finished {} (queued for {:?})", id, task_id, queued_for);
                shared.complete(id, TaskResult { task_id, outcome });
            }
            WorkerExit::TimedOut(limit) => {
                let error = DeckflowError::Timeout {
                    operation: kind.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                };
                shared.retire(id, task_id, error, Severity::Medium);
                return;
            }
            WorkerExit::Crashed(reason) => {
                let error = DeckflowError::worker(format!("Worker crashed running {}: {}", kind, reason));
                shared.retire(id, task_id, error, Severity::High);
                return;
            }
            WorkerExit::Cancelled => return,
        }
    }
}

/// A pool of extraction workers. Clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(extractor: Arc<dyn UnitExtractor>, config: WorkerPoolConfig, recorder: Option<Arc<ErrorRecorder>>) -> Self {
        let config = WorkerPoolConfig {
            max_workers: config.max_workers.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                extractor,
                config,
                recorder,
                state: Mutex::new(PoolState::default()),
                next_worker_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Start `max_workers` workers. Idempotent; called implicitly by [`run_task`](Self::run_task).
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.ensure_workers(&mut state)
    }

    /// Run `kind` on the next free worker and wait for its result.
    pub async fn run_task(&self, kind: TaskKind) -> Result<TaskOutput> {
        let (task_id, receiver) = {
            let mut state = self.shared.state.lock();
            self.shared.ensure_workers(&mut state)?;

            let task = Task::new(kind);
            let task_id = task.id.clone();
            let (callback, receiver) = oneshot::channel();
            state.callbacks.insert(task_id.clone(), callback);

            match state.idle_worker() {
                Some(worker) => state.assign(worker, task),
                None => state.queue.push_back(task),
            }
            (task_id, receiver)
        };

        match receiver.await {
            Ok(result) => result.outcome,
            Err(_) => Err(DeckflowError::worker(format!(
                "Task {} was cancelled because the pool terminated",
                task_id
            ))),
        }
    }

    /// Stop every worker, drop queued tasks and reset the pool.
    ///
    /// Callers still waiting receive a `Worker` error. The pool can be used again afterwards.
    pub async fn terminate(&self) {
        let workers = {
            let mut state = self.shared.state.lock();
            state.initialized = false;
            state.queue.clear();
            state.callbacks.clear();
            state.active.clear();
            std::mem::take(&mut state.workers)
        };

        let count = workers.len();
        for slot in &workers {
            slot.handle.abort();
        }
        for slot in workers {
            let _ = slot.handle.await;
        }

        if count > 0 {
            tracing::info!("Worker pool terminated ({} workers stopped)", count);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            total_workers: state.workers.len(),
            active_workers: state.active.len(),
            queue_length: state.queue.len(),
            initialized: state.initialized,
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Ids of the current workers. Replaced workers get fresh ids.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.shared.state.lock().workers.iter().map(|slot| slot.id).collect()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentMetadata, UnitContent};
    use crate::workers::UnitRequest;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedExtractor {
        running: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<usize>>,
        fail: Vec<usize>,
        panic_on: Vec<usize>,
        hang_on: Vec<usize>,
    }

    #[async_trait]
    impl UnitExtractor for ScriptedExtractor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn check_available(&self) -> Result<()> {
            Ok(())
        }

        async fn parse_unit(&self, request: &UnitRequest) -> Result<UnitContent> {
            let index = request.unit_index;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().push(index);

            let delay = if self.hang_on.contains(&index) {
                Duration::from_secs(30)
            } else {
                Duration::from_millis((index as u64 * 7) % 11 + 1)
            };
            tokio::time::sleep(delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on.contains(&index) {
                panic!("extractor blew up on unit {}", index);
            }
            if self.fail.contains(&index) {
                return Err(DeckflowError::extraction(format!("unit {} unreadable", index)));
            }
            Ok(UnitContent {
                index,
                ..Default::default()
            })
        }

        async fn extract_metadata(&self, _input_path: &Path) -> Result<DocumentMetadata> {
            Ok(DocumentMetadata::default())
        }

        async fn count_units(&self, _input_path: &Path) -> Result<usize> {
            Ok(0)
        }
    }

    fn parse(index: usize) -> TaskKind {
        TaskKind::ParseUnit(UnitRequest {
            input_path: PathBuf::from("deck.pptx"),
            output_dir: PathBuf::from("out"),
            unit_index: index,
            options: HashMap::new(),
        })
    }

    fn pool_with(extractor: Arc<ScriptedExtractor>, max_workers: usize, timeout: Option<Duration>) -> WorkerPool {
        WorkerPool::new(
            extractor,
            WorkerPoolConfig {
                max_workers,
                task_timeout: timeout,
            },
            None,
        )
    }

    #[test]
    fn test_default_max_workers_is_positive() {
        assert!(default_max_workers() >= 1);
        assert!(WorkerPoolConfig::default().task_timeout.is_some());
    }

    #[test]
    fn test_initialize_requires_runtime() {
        let pool = pool_with(Arc::new(ScriptedExtractor::default()), 2, None);
        assert!(matches!(pool.initialize(), Err(DeckflowError::Worker { .. })));
        assert!(!pool.status().initialized);
    }

    #[tokio::test]
    async fn test_initialize_spawns_workers() {
        let pool = pool_with(Arc::new(ScriptedExtractor::default()), 3, None);
        assert_eq!(
            pool.status(),
            PoolStatus {
                total_workers: 0,
                active_workers: 0,
                queue_length: 0,
                initialized: false
            }
        );

        pool.initialize().unwrap();
        pool.initialize().unwrap();
        assert_eq!(pool.status().total_workers, 3);
        assert!(pool.status().initialized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_correlate_and_concurrency_is_bounded() {
        let extractor = Arc::new(ScriptedExtractor::default());
        let pool = pool_with(extractor.clone(), 3, Some(Duration::from_secs(5)));

        let mut handles = Vec::new();
        for index in 0..30 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { (index, pool.run_task(parse(index)).await) }));
        }

        for handle in handles {
            let (index, result) = handle.await.unwrap();
            let unit = result.unwrap().into_unit().unwrap();
            assert_eq!(unit.index, index);
        }

        let peak = extractor.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 3, "peak concurrency {}", peak);
        let status = pool.status();
        assert_eq!(status.active_workers, 0);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let extractor = Arc::new(ScriptedExtractor::default());
        let pool = pool_with(extractor.clone(), 1, None);

        let mut handles = Vec::new();
        for index in 0..5 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.run_task(parse(index)).await }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*extractor.order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_extractor_error_keeps_worker() {
        let extractor = Arc::new(ScriptedExtractor {
            fail: vec![1],
            ..Default::default()
        });
        let pool = pool_with(extractor, 1, None);
        pool.initialize().unwrap();
        let workers = pool.worker_ids();

        let err = pool.run_task(parse(1)).await.unwrap_err();
        assert!(matches!(err, DeckflowError::Extraction { .. }));
        assert_eq!(pool.worker_ids(), workers);
        assert!(pool.run_task(parse(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_replaces_worker() {
        let extractor = Arc::new(ScriptedExtractor {
            hang_on: vec![0],
            ..Default::default()
        });
        let recorder = Arc::new(ErrorRecorder::default());
        let pool = WorkerPool::new(
            extractor,
            WorkerPoolConfig {
                max_workers: 1,
                task_timeout: Some(Duration::from_millis(100)),
            },
            Some(recorder.clone()),
        );
        pool.initialize().unwrap();
        let before = pool.worker_ids();

        let err = pool.run_task(parse(0)).await.unwrap_err();
        assert!(matches!(err, DeckflowError::Timeout { timeout_ms: 100, .. }));

        let unit = pool.run_task(parse(5)).await.unwrap().into_unit().unwrap();
        assert_eq!(unit.index, 5);

        let after = pool.worker_ids();
        assert_eq!(after.len(), 1);
        assert_ne!(after, before);
        assert_eq!(recorder.analyze().by_severity.medium, 1);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_share_one_frequency_key() {
        let extractor = Arc::new(ScriptedExtractor {
            hang_on: vec![0, 1],
            ..Default::default()
        });
        let recorder = Arc::new(ErrorRecorder::default());
        let pool = WorkerPool::new(
            extractor,
            WorkerPoolConfig {
                max_workers: 1,
                task_timeout: Some(Duration::from_millis(50)),
            },
            Some(recorder.clone()),
        );

        let first = pool.run_task(parse(0)).await.unwrap_err();
        let second = pool.run_task(parse(1)).await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert!(first.to_string().contains("parse_unit"));

        let analysis = recorder.analyze();
        assert_eq!(analysis.most_frequent.len(), 1);
        assert_eq!(analysis.most_frequent[0].count, 2);

        let log = recorder.get_error_log(None);
        let task_ids: Vec<_> = log.iter().filter_map(|entry| entry.context.get("task_id")).collect();
        assert_eq!(task_ids.len(), 2);
        assert_ne!(task_ids[0], task_ids[1]);
    }

    #[tokio::test]
    async fn test_crash_replaces_worker_without_requeue() {
        let extractor = Arc::new(ScriptedExtractor {
            panic_on: vec![3],
            ..Default::default()
        });
        let pool = pool_with(extractor.clone(), 2, Some(Duration::from_secs(5)));
        pool.initialize().unwrap();
        let before = pool.worker_ids();

        let err = pool.run_task(parse(3)).await.unwrap_err();
        assert!(matches!(err, DeckflowError::Worker { .. }));
        assert!(err.to_string().contains("crashed"));

        assert_eq!(pool.status().total_workers, 2);
        assert_ne!(pool.worker_ids(), before);
        assert!(pool.run_task(parse(4)).await.is_ok());
        assert_eq!(extractor.order.lock().iter().filter(|i| **i == 3).count(), 1);
    }

    #[tokio::test]
    async fn test_queue_drains_after_crash() {
        let extractor = Arc::new(ScriptedExtractor {
            panic_on: vec![0],
            ..Default::default()
        });
        let pool = pool_with(extractor, 1, None);

        let mut handles = Vec::new();
        for index in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.run_task(parse(index)).await }));
            tokio::task::yield_now().await;
        }

        let results: Vec<_> = {
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            results
        };
        assert!(results[0].is_err());
        assert!(results[1..].iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_terminate_resets_and_cancels_waiters() {
        let extractor = Arc::new(ScriptedExtractor {
            hang_on: vec![0],
            ..Default::default()
        });
        let pool = pool_with(extractor, 1, None);

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_task(parse(0)).await })
        };
        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_task(parse(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.status().active_workers, 1);
        assert_eq!(pool.status().queue_length, 1);

        pool.terminate().await;
        assert_eq!(
            pool.status(),
            PoolStatus {
                total_workers: 0,
                active_workers: 0,
                queue_length: 0,
                initialized: false
            }
        );
        assert!(matches!(waiting.await.unwrap(), Err(DeckflowError::Worker { .. })));
        assert!(matches!(queued.await.unwrap(), Err(DeckflowError::Worker { .. })));

        assert!(pool.run_task(parse(2)).await.is_ok(), "pool re-initializes on demand");
        assert!(pool.status().initialized);
    }
}
