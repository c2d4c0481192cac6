// =============================================================================
// Strategy Processing Pool — prioritized, bounded, timeout-enforcing jobs
// =============================================================================
//
// A single prioritized queue (one FIFO ring per priority class) feeds up to
// `worker_pool_size` concurrently executing jobs. Scheduling rules:
//
//   - HIGH > NORMAL > LOW for dequeue; FIFO within a class.
//   - No in-flight preemption; a dequeued job runs to completion or timeout.
//   - Anti-starvation: after `worker_pool_size * 4` consecutive non-LOW
//     dequeues, the next dequeue takes a LOW job if one is waiting.
//
// Every job races a timeout of `job.timeout_ms` (falling back to
// `default_timeout_ms`); the loser settles the result. Submissions are
// rejected — never blocked — once `queue_size` jobs are pending.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::market_data::Candle;
use crate::types::Priority;

/// Completed/failed results retained for inspection.
const MAX_RETAINED_RESULTS: usize = 500;

/// Consecutive non-LOW dequeues per pool worker before a LOW job is forced.
const STARVATION_FACTOR: u32 = 4;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A unit of strategy processing triggered by a new candle.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub strategy_id: String,
    pub candle: Candle,
    /// Submission timestamp (UNIX ms).
    pub timestamp: u64,
    pub priority: Priority,
    /// Per-job timeout override.
    pub timeout_ms: Option<u64>,
}

impl Job {
    pub fn new(
        strategy_id: impl Into<String>,
        candle: Candle,
        priority: Priority,
        now_ms: u64,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            candle,
            timestamp: now_ms,
            priority,
            timeout_ms: None,
        }
    }
}

/// Settled outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub strategy_id: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub processing_time_ms: u64,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
}

/// Submission failures. Settled results are never errors — a failing job
/// still yields a `JobResult`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("pool is not running")]
    NotRunning,
    #[error("processing function not installed")]
    ProcessingFunctionMissing,
    #[error("queue full: {0} jobs pending")]
    QueueFull(usize),
}

/// The per-job async processing function installed by the engine.
pub type ProcessingFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>;
pub type ProcessingFn = Arc<dyn Fn(Job) -> ProcessingFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Observability types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub success_rate: f64,
    pub average_processing_time_ms: f64,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    pub queued: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub running: bool,
    pub queued: usize,
    pub active: usize,
    pub worker_pool_size: usize,
    pub started_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub worker_pool_size: usize,
    pub active: usize,
    pub idle: usize,
    pub utilization: f64,
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

/// Pool tunables, usually sourced from `BotConfig`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_pool_size: usize,
    pub queue_size: usize,
    pub default_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            queue_size: 100,
            default_timeout_ms: 5000,
        }
    }
}

struct QueuedJob {
    job: Job,
    tx: oneshot::Sender<JobResult>,
}

struct PoolInner {
    running: bool,
    started_at_ms: Option<u64>,
    process_fn: Option<ProcessingFn>,
    /// One FIFO ring per priority class: [HIGH, NORMAL, LOW].
    queues: [VecDeque<QueuedJob>; 3],
    active: usize,
    /// Consecutive non-LOW dequeues since the last LOW dequeue.
    non_low_streak: u32,
    total_jobs: u64,
    successful_jobs: u64,
    failed_jobs: u64,
    total_processing_ms: u64,
    min_processing_ms: Option<u64>,
    max_processing_ms: u64,
    completed: Vec<JobResult>,
    failed: Vec<JobResult>,
}

impl PoolInner {
    fn queued_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

fn queue_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

/// Shared state and scheduling internals. Spawned worker tasks hold their own
/// `Arc<PoolCore>`, which is why the core is split from the public handle.
struct PoolCore {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<PoolInner>,
    /// Signalled whenever a job settles or the queue drains.
    settled: Notify,
}

impl PoolCore {
    /// Pop the next job respecting priority order and the anti-starvation
    /// rule. Caller holds the lock.
    fn pop_next(&self, inner: &mut PoolInner) -> Option<QueuedJob> {
        let starvation_limit = (self.config.worker_pool_size as u32) * STARVATION_FACTOR;

        let low_first = inner.non_low_streak >= starvation_limit && !inner.queues[2].is_empty();

        let order: [usize; 3] = if low_first { [2, 0, 1] } else { [0, 1, 2] };
        for idx in order {
            if let Some(queued) = inner.queues[idx].pop_front() {
                if idx == 2 {
                    inner.non_low_streak = 0;
                } else {
                    inner.non_low_streak += 1;
                }
                return Some(queued);
            }
        }
        None
    }

    /// Start queued jobs while worker slots are free.
    fn dispatch(core: &Arc<PoolCore>) {
        loop {
            let queued = {
                let mut inner = core.inner.lock();
                if inner.active >= core.config.worker_pool_size {
                    return;
                }
                let Some(queued) = core.pop_next(&mut inner) else {
                    return;
                };
                inner.active += 1;
                queued
            };

            let core = core.clone();
            tokio::spawn(async move {
                PoolCore::run_job(core, queued).await;
            });
        }
    }

    async fn run_job(core: Arc<PoolCore>, queued: QueuedJob) {
        let QueuedJob { job, tx } = queued;
        let process_fn = core
            .inner
            .lock()
            .process_fn
            .clone()
            .expect("dispatch requires an installed processing function");

        let timeout_ms = job.timeout_ms.unwrap_or(core.config.default_timeout_ms);
        let started_at = core.clock.now_ms();
        let job_id = job.job_id.clone();
        let strategy_id = job.strategy_id.clone();

        let outcome = tokio::time::timeout(
            tokio::time::Duration::from_millis(timeout_ms),
            process_fn(job),
        )
        .await;

        let completed_at = core.clock.now_ms();
        let processing_time_ms = completed_at.saturating_sub(started_at);

        let result = match outcome {
            Ok(Ok(value)) => JobResult {
                job_id: job_id.clone(),
                strategy_id: strategy_id.clone(),
                success: true,
                result: Some(value),
                error: None,
                stack_trace: None,
                processing_time_ms,
                started_at_ms: started_at,
                completed_at_ms: completed_at,
            },
            Ok(Err(e)) => JobResult {
                job_id: job_id.clone(),
                strategy_id: strategy_id.clone(),
                success: false,
                result: None,
                error: Some(format!("{e:#}")),
                stack_trace: Some(format!("{e:?}")),
                processing_time_ms,
                started_at_ms: started_at,
                completed_at_ms: completed_at,
            },
            Err(_elapsed) => JobResult {
                job_id: job_id.clone(),
                strategy_id: strategy_id.clone(),
                success: false,
                result: None,
                error: Some(format!("job timeout after {timeout_ms}ms")),
                stack_trace: None,
                processing_time_ms,
                started_at_ms: started_at,
                completed_at_ms: completed_at,
            },
        };

        if result.success {
            debug!(job_id = %job_id, strategy_id = %strategy_id, ms = processing_time_ms, "job succeeded");
        } else {
            warn!(
                job_id = %job_id,
                strategy_id = %strategy_id,
                ms = processing_time_ms,
                error = result.error.as_deref().unwrap_or(""),
                "job failed"
            );
        }

        {
            let mut inner = core.inner.lock();
            inner.active -= 1;
            inner.total_jobs += 1;
            if result.success {
                inner.successful_jobs += 1;
                inner.completed.push(result.clone());
                if inner.completed.len() > MAX_RETAINED_RESULTS {
                    inner.completed.remove(0);
                }
            } else {
                inner.failed_jobs += 1;
                inner.failed.push(result.clone());
                if inner.failed.len() > MAX_RETAINED_RESULTS {
                    inner.failed.remove(0);
                }
            }
            inner.total_processing_ms += processing_time_ms;
            inner.min_processing_ms = Some(
                inner
                    .min_processing_ms
                    .map_or(processing_time_ms, |m| m.min(processing_time_ms)),
            );
            inner.max_processing_ms = inner.max_processing_ms.max(processing_time_ms);
        }

        // The submitter may have given up (e.g. batch dropped); ignore.
        let _ = tx.send(result);
        core.settled.notify_waiters();
        PoolCore::dispatch(&core);
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct StrategyPool {
    core: Arc<PoolCore>,
}

impl StrategyPool {
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(PoolCore {
                config,
                clock,
                inner: Mutex::new(PoolInner {
                    running: false,
                    started_at_ms: None,
                    process_fn: None,
                    queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    active: 0,
                    non_low_streak: 0,
                    total_jobs: 0,
                    successful_jobs: 0,
                    failed_jobs: 0,
                    total_processing_ms: 0,
                    min_processing_ms: None,
                    max_processing_ms: 0,
                    completed: Vec::new(),
                    failed: Vec::new(),
                }),
                settled: Notify::new(),
            }),
        })
    }

    /// Install the async per-job function. Must precede any submission.
    pub fn set_processing_fn(&self, process_fn: ProcessingFn) {
        self.core.inner.lock().process_fn = Some(process_fn);
        debug!("processing function installed");
    }

    /// Enable submissions. Idempotent; records the start time on first call.
    pub fn start(&self) {
        let mut inner = self.core.inner.lock();
        if !inner.running {
            inner.running = true;
            inner.started_at_ms = Some(self.core.clock.now_ms());
            info!(
                workers = self.core.config.worker_pool_size,
                queue_size = self.core.config.queue_size,
                "strategy pool started"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Enqueue a job and await its settled result.
    pub async fn submit_job(&self, job: Job) -> Result<JobResult, SubmitError> {
        let rx = {
            let mut inner = self.core.inner.lock();
            if !inner.running {
                return Err(SubmitError::NotRunning);
            }
            if inner.process_fn.is_none() {
                return Err(SubmitError::ProcessingFunctionMissing);
            }
            let queued = inner.queued_len();
            if queued >= self.core.config.queue_size {
                return Err(SubmitError::QueueFull(queued));
            }

            let (tx, rx) = oneshot::channel();
            let idx = queue_index(job.priority);
            debug!(
                job_id = %job.job_id,
                strategy_id = %job.strategy_id,
                priority = %job.priority,
                queued = queued + 1,
                "job enqueued"
            );
            inner.queues[idx].push_back(QueuedJob { job, tx });
            rx
        };

        PoolCore::dispatch(&self.core);

        match rx.await {
            Ok(result) => Ok(result),
            // Sender dropped: the queue was cleared or the pool shut down.
            Err(_) => Ok(self.cancelled_result("job cancelled: queue cleared before execution")),
        }
    }

    /// Submit many jobs with independent per-job settlement. Submission
    /// errors become failed results; the batch itself never fails.
    pub async fn submit_batch(&self, jobs: Vec<Job>) -> Vec<JobResult> {
        let futures: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let job_id = job.job_id.clone();
                let strategy_id = job.strategy_id.clone();
                async move {
                    match self.submit_job(job).await {
                        Ok(result) => result,
                        Err(e) => {
                            let now = self.core.clock.now_ms();
                            JobResult {
                                job_id,
                                strategy_id,
                                success: false,
                                result: None,
                                error: Some(e.to_string()),
                                stack_trace: None,
                                processing_time_ms: 0,
                                started_at_ms: now,
                                completed_at_ms: now,
                            }
                        }
                    }
                }
            })
            .collect();

        futures_util::future::join_all(futures).await
    }

    fn cancelled_result(&self, message: &str) -> JobResult {
        let now = self.core.clock.now_ms();
        JobResult {
            job_id: String::new(),
            strategy_id: String::new(),
            success: false,
            result: None,
            error: Some(message.to_string()),
            stack_trace: None,
            processing_time_ms: 0,
            started_at_ms: now,
            completed_at_ms: now,
        }
    }

    // -------------------------------------------------------------------------
    // Draining
    // -------------------------------------------------------------------------

    /// Await completion of every queued and active job, then return all
    /// retained results.
    pub async fn wait_for_all(&self) -> Vec<JobResult> {
        loop {
            let notified = self.core.settled.notified();
            {
                let inner = self.core.inner.lock();
                if inner.active == 0 && inner.queued_len() == 0 {
                    let mut results = inner.completed.clone();
                    results.extend(inner.failed.iter().cloned());
                    return results;
                }
            }
            notified.await;
        }
    }

    /// Drop every queued job. Their submitters settle with a cancellation
    /// result. Returns the number of jobs cleared.
    pub fn clear_queue(&self) -> usize {
        let mut inner = self.core.inner.lock();
        let cleared = inner.queued_len();
        for queue in inner.queues.iter_mut() {
            queue.clear();
        }
        if cleared > 0 {
            warn!(cleared, "job queue cleared");
        }
        cleared
    }

    /// Disallow new submissions, clear the queue, and drain in-flight jobs.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.core.inner.lock();
            inner.running = false;
        }
        let cleared = self.clear_queue();
        info!(cleared, "strategy pool shutting down — draining active jobs");

        loop {
            let notified = self.core.settled.notified();
            if self.core.inner.lock().active == 0 {
                break;
            }
            notified.await;
        }
        info!("strategy pool drained");
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    pub fn get_stats(&self) -> PoolStats {
        let inner = self.core.inner.lock();
        PoolStats {
            total_jobs: inner.total_jobs,
            successful_jobs: inner.successful_jobs,
            failed_jobs: inner.failed_jobs,
            success_rate: if inner.total_jobs == 0 {
                0.0
            } else {
                inner.successful_jobs as f64 / inner.total_jobs as f64
            },
            average_processing_time_ms: if inner.total_jobs == 0 {
                0.0
            } else {
                inner.total_processing_ms as f64 / inner.total_jobs as f64
            },
            min_processing_time_ms: inner.min_processing_ms.unwrap_or(0),
            max_processing_time_ms: inner.max_processing_ms,
            queued: inner.queued_len(),
            active: inner.active,
        }
    }

    pub fn get_status(&self) -> PoolStatus {
        let inner = self.core.inner.lock();
        PoolStatus {
            running: inner.running,
            queued: inner.queued_len(),
            active: inner.active,
            worker_pool_size: self.core.config.worker_pool_size,
            started_at_ms: inner.started_at_ms,
        }
    }

    pub fn get_worker_health(&self) -> WorkerHealth {
        let inner = self.core.inner.lock();
        let workers = self.core.config.worker_pool_size;
        WorkerHealth {
            worker_pool_size: workers,
            active: inner.active,
            idle: workers.saturating_sub(inner.active),
            utilization: if workers == 0 {
                0.0
            } else {
                inner.active as f64 / workers as f64
            },
        }
    }

    pub fn get_completed_jobs(&self) -> Vec<JobResult> {
        self.core.inner.lock().completed.clone()
    }

    pub fn get_failed_jobs(&self) -> Vec<JobResult> {
        self.core.inner.lock().failed.clone()
    }
}

impl std::fmt::Debug for StrategyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("StrategyPool")
            .field("running", &inner.running)
            .field("queued", &inner.queued_len())
            .field("active", &inner.active)
            .field("workers", &self.core.config.worker_pool_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn candle() -> Candle {
        Candle {
            open_time: 0,
            close_time: 59_999,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            is_closed: true,
        }
    }

    fn job(strategy: &str, priority: Priority) -> Job {
        Job::new(strategy, candle(), priority, 0)
    }

    fn pool(
        worker_pool_size: usize,
        queue_size: usize,
        default_timeout_ms: u64,
    ) -> Arc<StrategyPool> {
        StrategyPool::new(
            PoolConfig {
                worker_pool_size,
                queue_size,
                default_timeout_ms,
            },
            Arc::new(SystemClock),
        )
    }

    fn sleepy_fn(sleep_ms: u64) -> ProcessingFn {
        Arc::new(move |job: Job| {
            Box::pin(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(sleep_ms)).await;
                Ok(serde_json::json!({ "strategy": job.strategy_id }))
            })
        })
    }

    #[tokio::test]
    async fn submit_before_start_fails() {
        let pool = pool(4, 100, 5000);
        pool.set_processing_fn(sleepy_fn(1));
        let err = pool.submit_job(job("s1", Priority::Normal)).await.unwrap_err();
        assert_eq!(err, SubmitError::NotRunning);
    }

    #[tokio::test]
    async fn submit_without_processing_fn_fails() {
        let pool = pool(4, 100, 5000);
        pool.start();
        let err = pool.submit_job(job("s1", Priority::Normal)).await.unwrap_err();
        assert_eq!(err, SubmitError::ProcessingFunctionMissing);
    }

    #[tokio::test]
    async fn successful_job_settles_with_result_payload() {
        let pool = pool(4, 100, 5000);
        pool.set_processing_fn(sleepy_fn(1));
        pool.start();

        let result = pool.submit_job(job("momentum", Priority::Normal)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result.unwrap()["strategy"], "momentum");
        assert!(result.error.is_none());
        assert!(result.completed_at_ms >= result.started_at_ms);

        let stats = pool.get_stats();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.successful_jobs, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn job_timeout_produces_failed_result_with_timeout_token() {
        // Pool timeout scenario: fn sleeps 100 ms, job allows 50 ms.
        let pool = pool(4, 100, 5000);
        pool.set_processing_fn(sleepy_fn(100));
        pool.start();

        let mut j = job("slow", Priority::Normal);
        j.timeout_ms = Some(50);
        let result = pool.submit_job(j).await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timeout"));
        assert_eq!(pool.get_stats().failed_jobs, 1);
    }

    #[tokio::test]
    async fn failing_fn_records_error_and_stack_trace() {
        let pool = pool(4, 100, 5000);
        pool.set_processing_fn(Arc::new(|_job| {
            Box::pin(async { anyhow::bail!("indicator series too short") })
        }));
        pool.start();

        let result = pool.submit_job(job("s1", Priority::Normal)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("indicator series too short"));
        assert!(result.stack_trace.is_some());
    }

    #[tokio::test]
    async fn high_priority_dequeues_before_low() {
        // Priority scenario: a 50 ms job occupies the single worker; a LOW
        // then a HIGH job are queued. HIGH must run first.
        let pool = pool(1, 100, 5000);
        let order: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = order.clone();
        pool.set_processing_fn(Arc::new(move |job: Job| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(job.strategy_id.clone());
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
                Ok(serde_json::Value::Null)
            })
        }));
        pool.start();

        let p = pool.clone();
        let blocker =
            tokio::spawn(async move { p.submit_job(job("blocker", Priority::Normal)).await });
        // Let the blocker occupy the worker before queuing the contenders.
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let p_low = pool.clone();
        let low = tokio::spawn(async move { p_low.submit_job(job("low", Priority::Low)).await });
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        let p_high = pool.clone();
        let high = tokio::spawn(async move { p_high.submit_job(job("high", Priority::High)).await });

        blocker.await.unwrap().unwrap();
        high.await.unwrap().unwrap();
        low.await.unwrap().unwrap();

        assert_eq!(*order.lock(), vec!["blocker", "high", "low"]);
    }

    #[tokio::test]
    async fn queue_overflow_fails_submission_without_blocking() {
        // Queue overflow scenario: queue_size 5, single busy worker.
        let pool = pool(1, 5, 5000);
        pool.set_processing_fn(sleepy_fn(100));
        pool.start();

        // One job occupies the worker; five fill the queue.
        let mut handles = Vec::new();
        for i in 0..6 {
            let p = pool.clone();
            let id = format!("s{i}");
            handles.push(tokio::spawn(async move {
                p.submit_job(job(&id, Priority::Normal)).await
            }));
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }

        // The queue is now full; further submissions are rejected instantly.
        let err = pool
            .submit_job(job("overflow", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::QueueFull(5)));

        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_pool_size() {
        let workers = 3;
        let pool = pool(workers, 100, 5000);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c) = (active.clone(), peak.clone());
        pool.set_processing_fn(Arc::new(move |_job| {
            let active = active_c.clone();
            let peak = peak_c.clone();
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            })
        }));
        pool.start();

        let jobs: Vec<Job> = (0..12)
            .map(|i| job(&format!("s{i}"), Priority::Normal))
            .collect();
        let results = pool.submit_batch(jobs).await;

        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.success));
        assert!(peak.load(Ordering::SeqCst) <= workers);
    }

    #[tokio::test]
    async fn batch_settles_independently() {
        let pool = pool(2, 100, 5000);
        pool.set_processing_fn(Arc::new(|job: Job| {
            Box::pin(async move {
                if job.strategy_id == "bad" {
                    anyhow::bail!("no signal");
                }
                Ok(serde_json::Value::Null)
            })
        }));
        pool.start();

        let results = pool
            .submit_batch(vec![
                job("good", Priority::Normal),
                job("bad", Priority::Normal),
                job("good2", Priority::Normal),
            ])
            .await;

        let successes = results.iter().filter(|r| r.success).count();
        assert_eq!(successes, 2);
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn low_jobs_are_not_starved() {
        // With a streak limit of workers * 4 = 4, a steady HIGH inflow must
        // still let LOW jobs through.
        let pool = pool(1, 100, 5000);
        let order: Arc<PlMutex<Vec<Priority>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = order.clone();
        pool.set_processing_fn(Arc::new(move |job: Job| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(job.priority);
                tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
                Ok(serde_json::Value::Null)
            })
        }));
        pool.start();

        // Occupy the worker, then queue 8 HIGH and 1 LOW.
        let mut handles = Vec::new();
        let p = pool.clone();
        handles.push(tokio::spawn(async move {
            p.submit_job(job("blocker", Priority::Normal)).await
        }));
        tokio::time::sleep(tokio::time::Duration::from_millis(2)).await;

        let p_low = pool.clone();
        handles.push(tokio::spawn(async move {
            p_low.submit_job(job("low", Priority::Low)).await
        }));
        for i in 0..8 {
            let p = pool.clone();
            let id = format!("high{i}");
            handles.push(tokio::spawn(async move {
                p.submit_job(job(&id, Priority::High)).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sequence = order.lock().clone();
        let low_index = sequence.iter().position(|p| *p == Priority::Low).unwrap();
        // The LOW job must not be last in line behind all eight HIGHs.
        assert!(low_index < sequence.len() - 1, "LOW starved: {sequence:?}");
    }

    #[tokio::test]
    async fn wait_for_all_joins_in_flight_work() {
        let pool = pool(2, 100, 5000);
        pool.set_processing_fn(sleepy_fn(30));
        pool.start();

        for i in 0..4 {
            let p = pool.clone();
            let id = format!("s{i}");
            tokio::spawn(async move { p.submit_job(job(&id, Priority::Normal)).await });
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let results = pool.wait_for_all().await;
        assert_eq!(results.len(), 4);
        assert_eq!(pool.get_stats().active, 0);
    }

    #[tokio::test]
    async fn shutdown_disallows_new_submissions_and_drains() {
        let pool = pool(2, 100, 5000);
        pool.set_processing_fn(sleepy_fn(30));
        pool.start();

        let p = pool.clone();
        let inflight =
            tokio::spawn(async move { p.submit_job(job("s1", Priority::Normal)).await });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        pool.shutdown().await;
        assert!(inflight.await.unwrap().unwrap().success);

        let err = pool.submit_job(job("s2", Priority::Normal)).await.unwrap_err();
        assert_eq!(err, SubmitError::NotRunning);
        assert_eq!(pool.get_status().active, 0);
    }

    #[tokio::test]
    async fn cleared_queue_settles_submitters_with_cancellation() {
        let pool = pool(1, 100, 5000);
        pool.set_processing_fn(sleepy_fn(50));
        pool.start();

        let p = pool.clone();
        let blocker =
            tokio::spawn(async move { p.submit_job(job("blocker", Priority::Normal)).await });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let p2 = pool.clone();
        let queued =
            tokio::spawn(async move { p2.submit_job(job("queued", Priority::Normal)).await });
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;

        assert_eq!(pool.clear_queue(), 1);

        let cancelled = queued.await.unwrap().unwrap();
        assert!(!cancelled.success);
        assert!(cancelled.error.unwrap().contains("cancelled"));
        assert!(blocker.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn worker_health_reports_utilization() {
        let pool = pool(4, 100, 5000);
        pool.set_processing_fn(sleepy_fn(50));
        pool.start();

        let p = pool.clone();
        tokio::spawn(async move { p.submit_job(job("s1", Priority::Normal)).await });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let health = pool.get_worker_health();
        assert_eq!(health.active, 1);
        assert_eq!(health.idle, 3);
        assert!((health.utilization - 0.25).abs() < f64::EPSILON);

        pool.wait_for_all().await;
    }
}
