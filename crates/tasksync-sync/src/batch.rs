//! Batch transfer scheduler
//!
//! Splits a large item sequence into fixed-size batches and processes each
//! batch with a bounded worker pool, one run per user at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  start()/run()   ┌──────────────────────────┐
//! │ TransferService│ ───────────────► │      BatchScheduler      │
//! └───────────────┘                  │  runs: SessionRegistry   │
//!        ▲                           │  finished: DashMap       │
//!        │ BatchEvent (broadcast)    └──────────┬───────────────┘
//!        │                                      │ per batch
//!        │                           ┌──────────▼───────────────┐
//!        └────────────────────────── │ JoinSet + Semaphore      │
//!          watch::Receiver<Progress> │ (max_concurrency permits)│
//!                                    └──────────────────────────┘
//! ```
//!
//! Batches run strictly one after another so progress is monotonic.
//! Cancellation is checked before each batch; an in-flight batch always
//! finishes. Item failures are counted, never fatal, unless the item
//! reports [`ItemError::Fatal`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch, Semaphore},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tasksync_core::{
    clock::HybridClock,
    config::BatchConfig,
    domain::{BatchProgress, BatchState, Timestamp, UserId},
};
use tasksync_telemetry::MetricsRegistry;

use crate::{
    progress::{BatchStatus, RunStatus, ThroughputWindow},
    registry::{SessionGuard, SessionRegistry},
    SyncError,
};

/// Capacity of the batch event channel
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Options, errors and results
// ============================================================================

/// Sizing of one batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Pause between batches; zero disables throttling
    pub batch_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

impl From<&BatchConfig> for BatchOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency,
            batch_delay: config.batch_delay(),
        }
    }
}

impl BatchOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_batch_delay(mut self, batch_delay: Duration) -> Self {
        self.batch_delay = batch_delay;
        self
    }

    fn normalized(self) -> Self {
        Self {
            batch_size: self.batch_size.max(1),
            max_concurrency: self.max_concurrency.max(1),
            batch_delay: self.batch_delay,
        }
    }
}

/// Failure of a single item
#[derive(Debug, Error)]
pub enum ItemError {
    /// Counted and logged; the run continues
    #[error("{0}")]
    Recoverable(anyhow::Error),

    /// Ends the run as `Failed` once the current batch finishes
    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for ItemError {
    fn from(err: anyhow::Error) -> Self {
        ItemError::Recoverable(err)
    }
}

/// Final outcome of a batch run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub user_id: UserId,
    pub state: BatchState,
    pub progress: BatchProgress,
    /// Stamped by the scheduler's hybrid clock
    pub finished_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lifecycle events published by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started {
        user_id: UserId,
        total_items: usize,
        total_batches: usize,
    },
    Progress {
        user_id: UserId,
        progress: BatchProgress,
    },
    Finished(RunResult),
}

/// Registry value of a running batch
#[derive(Debug, Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    progress: watch::Receiver<BatchProgress>,
}

/// Per-run handles owned by the batch loop
struct RunContext {
    user_id: UserId,
    options: BatchOptions,
    total_batches: usize,
    cancel: CancellationToken,
    progress_tx: watch::Sender<BatchProgress>,
}

// ============================================================================
// BatchScheduler
// ============================================================================

/// Runs bounded, cancellable batch jobs, one per user
#[derive(Clone)]
pub struct BatchScheduler {
    runs: SessionRegistry<UserId, ActiveRun>,
    finished: Arc<DashMap<UserId, RunResult>>,
    events: broadcast::Sender<BatchEvent>,
    defaults: BatchOptions,
    clock: Arc<HybridClock>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl BatchScheduler {
    pub fn new(defaults: BatchOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runs: SessionRegistry::new("batch"),
            finished: Arc::new(DashMap::new()),
            events,
            defaults,
            clock: Arc::new(HybridClock::new()),
            metrics: None,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(BatchOptions::from(config))
    }

    /// Shares the clock that stamps sync transactions
    pub fn with_clock(mut self, clock: Arc<HybridClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.runs = self.runs.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    /// Options used when a caller does not size a run itself
    pub fn defaults(&self) -> BatchOptions {
        self.defaults
    }

    /// Receives `Started`, `Progress` and `Finished` events of every run
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Progress updates of the user's running batch, if any
    pub fn watch_progress(&self, user_id: UserId) -> Option<watch::Receiver<BatchProgress>> {
        self.runs.get(&user_id).map(|run| run.progress)
    }

    /// Runs `process` over `items` and waits for the run to finish
    ///
    /// Fails with [`SyncError::RunInProgress`] when the user already has a
    /// running batch.
    pub async fn run<T, F, Fut>(
        &self,
        user_id: UserId,
        items: Vec<T>,
        options: BatchOptions,
        process: F,
    ) -> Result<RunResult, SyncError>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ItemError>> + Send + 'static,
    {
        let (guard, ctx) = self.begin(user_id, items.len(), options)?;
        Ok(self.execute(guard, ctx, items, Arc::new(process)).await)
    }

    /// Starts a run in the background
    ///
    /// The user's slot is claimed before this returns, so a second call
    /// fails immediately with [`SyncError::RunInProgress`].
    pub fn start<T, F, Fut>(
        &self,
        user_id: UserId,
        items: Vec<T>,
        options: BatchOptions,
        process: F,
    ) -> Result<JoinHandle<RunResult>, SyncError>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ItemError>> + Send + 'static,
    {
        let (guard, ctx) = self.begin(user_id, items.len(), options)?;
        let scheduler = self.clone();
        Ok(tokio::spawn(async move {
            scheduler
                .execute(guard, ctx, items, Arc::new(process))
                .await
        }))
    }

    /// Requests cooperative cancellation of the user's run
    ///
    /// The batch in flight finishes; no further batch starts.
    pub fn cancel(&self, user_id: UserId) -> Result<(), SyncError> {
        let run = self
            .runs
            .get(&user_id)
            .ok_or(SyncError::NoActiveRun(user_id))?;
        run.cancel.cancel();
        info!(user_id = %user_id, "Batch run cancellation requested");
        Ok(())
    }

    /// Status poll: the running batch, else the last finished one
    pub fn status(&self, user_id: UserId) -> BatchStatus {
        if let Some(run) = self.runs.get(&user_id) {
            return BatchStatus {
                status: RunStatus::Syncing,
                progress: Some(run.progress.borrow().clone()),
            };
        }
        match self.finished.get(&user_id) {
            Some(done) => BatchStatus {
                status: RunStatus::Completed,
                progress: Some(done.progress.clone()),
            },
            None => BatchStatus::idle(),
        }
    }

    /// Result of the user's most recent finished run
    pub fn last_result(&self, user_id: UserId) -> Option<RunResult> {
        self.finished.get(&user_id).map(|r| r.value().clone())
    }

    pub fn is_running(&self, user_id: UserId) -> bool {
        self.runs.is_running(&user_id)
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    fn begin(
        &self,
        user_id: UserId,
        total_items: usize,
        options: BatchOptions,
    ) -> Result<(SessionGuard<UserId, ActiveRun>, RunContext), SyncError> {
        let options = options.normalized();
        let total_batches = total_items.div_ceil(options.batch_size);
        let (progress_tx, progress_rx) =
            watch::channel(BatchProgress::starting(total_items, total_batches));
        let cancel = CancellationToken::new();

        let guard = self
            .runs
            .try_start(
                user_id,
                ActiveRun {
                    cancel: cancel.clone(),
                    progress: progress_rx,
                },
            )
            .ok_or(SyncError::RunInProgress(user_id))?;

        info!(
            user_id = %user_id,
            total_items,
            total_batches,
            batch_size = options.batch_size,
            max_concurrency = options.max_concurrency,
            "Batch run started"
        );
        // No subscribers is fine
        let _ = self.events.send(BatchEvent::Started {
            user_id,
            total_items,
            total_batches,
        });

        Ok((
            guard,
            RunContext {
                user_id,
                options,
                total_batches,
                cancel,
                progress_tx,
            },
        ))
    }

    async fn execute<T, F, Fut>(
        &self,
        guard: SessionGuard<UserId, ActiveRun>,
        ctx: RunContext,
        items: Vec<T>,
        process: Arc<F>,
    ) -> RunResult
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ItemError>> + Send + 'static,
    {
        let RunContext {
            user_id,
            options,
            total_batches,
            cancel,
            progress_tx,
        } = ctx;

        let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
        let mut progress = BatchProgress::starting(items.len(), total_batches);
        let mut window = ThroughputWindow::new(Instant::now());
        let mut state = BatchState::Completed;
        let mut failure = None;
        let mut items = items.into_iter();

        for batch in 1..=total_batches {
            if cancel.is_cancelled() {
                info!(
                    user_id = %user_id,
                    batch,
                    completed = progress.completed_items,
                    "Batch run cancelled"
                );
                state = BatchState::Cancelled;
                break;
            }

            let mut tasks = JoinSet::new();
            for item in items.by_ref().take(options.batch_size) {
                let semaphore = Arc::clone(&semaphore);
                let process = Arc::clone(&process);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| {
                        ItemError::Fatal(anyhow::anyhow!("worker pool closed"))
                    })?;
                    process(item).await
                });
            }

            let attempted = tasks.len();
            let mut failed = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(ItemError::Recoverable(e))) => {
                        failed += 1;
                        warn!(user_id = %user_id, batch, error = %e, "Batch item failed");
                    }
                    Ok(Err(ItemError::Fatal(e))) => {
                        failed += 1;
                        error!(user_id = %user_id, batch, error = %e, "Batch item failed fatally");
                        failure.get_or_insert_with(|| e.to_string());
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(user_id = %user_id, batch, error = %e, "Batch item task aborted");
                    }
                }
            }

            progress.record_batch(batch, attempted, failed);
            window.record(Instant::now(), progress.completed_items);
            progress.throughput = window.throughput();
            progress.estimated_time_remaining = window.eta(progress.remaining_items());
            progress_tx.send_replace(progress.clone());
            let _ = self.events.send(BatchEvent::Progress {
                user_id,
                progress: progress.clone(),
            });
            if let Some(metrics) = &self.metrics {
                metrics.record_batch_items((attempted - failed) as u64, failed as u64);
            }

            if failure.is_some() {
                state = BatchState::Failed;
                break;
            }

            if batch < total_batches && !options.batch_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(options.batch_delay) => {}
                }
            }
        }

        let result = RunResult {
            user_id,
            state,
            progress,
            finished_at: self.clock.now(),
            error: failure,
        };
        info!(
            user_id = %user_id,
            state = %result.state,
            completed = result.progress.completed_items,
            failed = result.progress.failed_items,
            total = result.progress.total_items,
            "Batch run finished"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_batch_run(result.state.as_str());
        }
        self.finished.insert(user_id, result.clone());
        let _ = self.events.send(BatchEvent::Finished(result.clone()));
        guard.finish(result.finished_at);

        result
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(BatchOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn options(batch_size: usize) -> BatchOptions {
        BatchOptions::default()
            .with_batch_size(batch_size)
            .with_max_concurrency(4)
            .with_batch_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_issues_ceil_batches_and_completes() {
        let scheduler = BatchScheduler::default();
        let mut events = scheduler.subscribe();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let result = scheduler
            .run(UserId::new(1), (0..10).collect(), options(3), move |_item: u32| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Completed);
        assert_eq!(result.progress.total_batches, 4);
        assert_eq!(result.progress.completed_items, 10);
        assert_eq!(result.progress.percentage, 100.0);
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        // Started, one progress event per batch, finished
        assert!(matches!(events.recv().await.unwrap(), BatchEvent::Started { total_batches: 4, .. }));
        let mut percentages = Vec::new();
        for _ in 0..4 {
            match events.recv().await.unwrap() {
                BatchEvent::Progress { progress, .. } => percentages.push(progress.percentage),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(percentages[..3].iter().all(|p| *p < 100.0));
        assert_eq!(percentages[3], 100.0);
        assert!(matches!(events.recv().await.unwrap(), BatchEvent::Finished(_)));
    }

    #[tokio::test]
    async fn test_empty_run_completes_immediately() {
        let scheduler = BatchScheduler::default();
        let result = scheduler
            .run(UserId::new(1), Vec::<u32>::new(), options(5), |_item| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Completed);
        assert_eq!(result.progress.total_batches, 0);
        assert_eq!(result.progress.percentage, 100.0);
    }

    #[tokio::test]
    async fn test_item_failures_are_counted_not_fatal() {
        let scheduler = BatchScheduler::default();
        let result = scheduler
            .run(UserId::new(1), (0..6).collect(), options(2), |item: u32| async move {
                if item % 3 == 0 {
                    Err(anyhow::anyhow!("item {item} rejected").into())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Completed);
        assert_eq!(result.progress.completed_items, 6);
        assert_eq!(result.progress.failed_items, 2);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_fatal_item_fails_run_after_current_batch() {
        let scheduler = BatchScheduler::default();
        let result = scheduler
            .run(UserId::new(1), (0..6).collect(), options(2), |item: u32| async move {
                if item == 2 {
                    Err(ItemError::Fatal(anyhow::anyhow!("store unavailable")))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Failed);
        assert_eq!(result.progress.current_batch, 2);
        assert_eq!(result.progress.completed_items, 4);
        assert!(result.error.unwrap().contains("store unavailable"));
        assert!(!scheduler.is_running(UserId::new(1)));
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_batch() {
        let scheduler = BatchScheduler::default();
        let processed = Arc::new(AtomicUsize::new(0));

        let canceller = scheduler.clone();
        let counter = Arc::clone(&processed);
        let result = scheduler
            .run(UserId::new(7), (0..10).collect(), options(2), move |_item: u32| {
                let canceller = canceller.clone();
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        canceller.cancel(UserId::new(7)).unwrap();
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Cancelled);
        // The second batch was in flight and finished
        assert_eq!(result.progress.completed_items, 4);
        assert!(result.progress.completed_items < result.progress.total_items);
        assert_eq!(processed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_one_run_per_user() {
        let scheduler = BatchScheduler::default();
        let (release_tx, release_rx) = watch::channel(false);

        let handle = scheduler
            .start(UserId::new(3), vec![1u32], options(1), move |_item| {
                let mut release = release_rx.clone();
                async move {
                    let _ = release.wait_for(|go| *go).await;
                    Ok(())
                }
            })
            .unwrap();

        let err = scheduler
            .run(UserId::new(3), vec![2u32], options(1), |_item| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RunInProgress(_)));
        assert_eq!(scheduler.status(UserId::new(3)).status, RunStatus::Syncing);

        // Other users are unaffected
        scheduler
            .run(UserId::new(4), vec![2u32], options(1), |_item| async { Ok(()) })
            .await
            .unwrap();

        release_tx.send(true).unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result.state, BatchState::Completed);
        assert_eq!(scheduler.status(UserId::new(3)).status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_without_run() {
        let scheduler = BatchScheduler::default();
        assert!(matches!(
            scheduler.cancel(UserId::new(1)),
            Err(SyncError::NoActiveRun(_))
        ));
        assert_eq!(scheduler.status(UserId::new(1)), BatchStatus::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reports_throughput() {
        let scheduler = BatchScheduler::default();
        let options = options(2).with_batch_delay(Duration::from_millis(100));

        let result = scheduler
            .run(UserId::new(1), (0..4).collect(), options, |_item: u32| async { Ok(()) })
            .await
            .unwrap();

        let speed = result.progress.throughput.unwrap();
        assert!((speed - 40.0).abs() < 1e-6);
        assert_eq!(result.progress.estimated_time_remaining, Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_completion_is_stamped_by_shared_clock() {
        struct Frozen;
        impl tasksync_core::clock::WallClock for Frozen {
            fn now_micros(&self) -> i64 {
                1_000
            }
        }

        let clock = Arc::new(HybridClock::with_wall_clock(Frozen));
        assert_eq!(clock.now(), Timestamp::from_micros(1_000));
        let scheduler = BatchScheduler::default().with_clock(Arc::clone(&clock));

        let result = scheduler
            .run(UserId::new(1), vec![1u32], options(1), |_item| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(result.finished_at, Timestamp::from_micros(1_001));
        assert_eq!(
            scheduler.runs.last_completed(&UserId::new(1)),
            Some(Timestamp::from_micros(1_001))
        );
        assert_eq!(clock.last(), Timestamp::from_micros(1_001));
    }

    #[tokio::test]
    async fn test_run_metrics() {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let scheduler = BatchScheduler::default().with_metrics(Arc::clone(&metrics));

        scheduler
            .run(UserId::new(1), (0..3).collect(), options(2), |item: u32| async move {
                if item == 0 {
                    Err(anyhow::anyhow!("bad item").into())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(metrics.batch_items_total.with_label_values(&["ok"]).get(), 2);
        assert_eq!(metrics.batch_items_total.with_label_values(&["failed"]).get(), 1);
        assert_eq!(metrics.batch_runs_total.with_label_values(&["completed"]).get(), 1);
        assert_eq!(metrics.active_sessions.with_label_values(&["batch"]).get(), 0);
    }
}
