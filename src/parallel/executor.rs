use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, bounded};

use super::cancel::CancellationToken;
use super::partition::{DEFAULT_PARTITIONS_PER_WORKER, IndexRange, Partitioner};
use super::pool::{PoolChoice, default_workers};
use super::state::{LoopControl, LoopState};
use crate::config::EngineConfig;
use crate::error::{AggregatedError, Failure, FailureKind, Origin, ParallelError, Result};

/// Progress callback: `(current, total, worker_id)`
pub type ProgressFn = Arc<dyn Fn(usize, usize, usize) + Send + Sync>;

/// Options recognised by every partitioned entry point
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Maximum concurrently active workers (None = hardware concurrency)
    pub worker_limit: Option<usize>,
    /// Fixed partition size (None = auto)
    pub chunk_size: Option<usize>,
    /// Target partitions per worker for the auto chunk size
    pub partitions_per_worker: usize,
    pub cancel: CancellationToken,
    pub pool: PoolChoice,
    pub progress: Option<ProgressFn>,
    /// Report progress every N items
    pub progress_update_frequency: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            worker_limit: None,
            chunk_size: None,
            partitions_per_worker: DEFAULT_PARTITIONS_PER_WORKER,
            cancel: CancellationToken::new(),
            pool: PoolChoice::Shared,
            progress: None,
            progress_update_frequency: 5,
        }
    }
}

impl std::fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("worker_limit", &self.worker_limit)
            .field("chunk_size", &self.chunk_size)
            .field("partitions_per_worker", &self.partitions_per_worker)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("pool", &self.pool)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options derived from loaded engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            worker_limit: Some(config.resolved_workers()),
            partitions_per_worker: config.partitions_per_worker.max(1),
            progress_update_frequency: config.progress_update_frequency.max(1),
            ..Self::default()
        }
    }

    pub fn with_worker_limit(mut self, workers: usize) -> Self {
        self.worker_limit = Some(workers);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_pool(mut self, pool: PoolChoice) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_progress<P>(mut self, reporter: P) -> Self
    where
        P: Fn(usize, usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(reporter));
        self
    }

    pub(crate) fn workers(&self) -> Result<usize> {
        match self.worker_limit {
            Some(0) => Err(ParallelError::InvalidArgument(
                "worker limit must be at least 1".to_string(),
            )),
            Some(limit) => Ok(limit),
            None => Ok(default_workers()),
        }
    }
}

/// Outcome of one `run`/`for_each` call that recorded no failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    /// True iff neither break nor stop was requested and nothing was cancelled
    pub completed: bool,
    /// Lowest break index, only when break ended the loop
    pub lowest_break_index: Option<usize>,
    /// True when a worker skipped work because the token fired
    pub cancelled: bool,
}

/// Per-call state shared by every worker
struct Shared<'a> {
    state: &'a LoopState,
    cancel: &'a CancellationToken,
    aborted: AtomicBool,
    cancel_observed: AtomicBool,
    failures: Mutex<AggregatedError>,
    progress: Option<&'a ProgressFn>,
    progress_counter: AtomicUsize,
    progress_update_frequency: usize,
    total_items: usize,
}

/// Handle given to partition processors
pub(crate) struct WorkerContext<'a> {
    pub worker_id: usize,
    shared: &'a Shared<'a>,
}

impl WorkerContext<'_> {
    pub fn state(&self) -> &LoopState {
        self.shared.state
    }

    /// Whether the item at `index` must not be started
    pub fn should_skip(&self, index: usize) -> bool {
        if self.shared.cancel.is_cancelled() {
            self.shared.cancel_observed.store(true, Ordering::Release);
            return true;
        }
        self.shared.aborted.load(Ordering::Acquire) || self.shared.state.should_exit_at(index)
    }

    /// Count one finished item
    pub fn item_done(&self) {
        let current = self.shared.progress_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(reporter) = self.shared.progress
            && (current % self.shared.progress_update_frequency == 0 || current == self.shared.total_items)
        {
            reporter(current, self.shared.total_items, self.worker_id);
        }
    }

    fn skip_partition(&self, partition: IndexRange) -> bool {
        if self.shared.cancel.is_cancelled() {
            self.shared.cancel_observed.store(true, Ordering::Release);
            return true;
        }
        if self.shared.aborted.load(Ordering::Acquire) {
            return true;
        }
        match self.shared.state.control() {
            LoopControl::Running => false,
            LoopControl::Stop => true,
            LoopControl::Break(lowest) => partition.start > lowest,
        }
    }

    fn record(&self, failure: Failure) {
        tracing::warn!("Worker {} recorded {}", self.worker_id, failure);
        if failure.kind == FailureKind::InvalidTransition {
            self.shared.aborted.store(true, Ordering::Release);
        }
        match self.shared.failures.lock() {
            Ok(mut failures) => failures.push(failure),
            Err(poisoned) => poisoned.into_inner().push(failure),
        }
    }
}

/// What a dispatch left behind
pub(crate) struct DispatchReport {
    pub failures: AggregatedError,
    pub cancelled: bool,
}

/// Run `body` for one item, turning errors and panics into a [`Failure`]
pub(crate) fn guarded<T, F>(origin: Origin, body: F) -> std::result::Result<T, Failure>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Failure::from_callback(&e, origin)),
        Err(payload) => Err(Failure::from_panic(payload, origin)),
    }
}

/// Partition `range` and drain the partitions with at most `worker_limit`
/// workers on the selected pool. Blocks until every worker has returned.
///
/// `process` handles one whole partition. Returning a failure records it
/// and retires the worker; other workers keep draining.
pub(crate) fn dispatch<P>(
    range: IndexRange,
    options: &ExecutionOptions,
    state: &LoopState,
    process: P,
) -> Result<DispatchReport>
where
    P: Fn(IndexRange, &WorkerContext<'_>) -> std::result::Result<(), Failure> + Sync,
{
    let workers = options.workers()?;
    let partitioner = Partitioner::for_options(options.chunk_size, workers, options.partitions_per_worker)?;
    let partitions = partitioner.partitions(range);
    let partition_count = partitions.len();

    let shared = Shared {
        state,
        cancel: &options.cancel,
        aborted: AtomicBool::new(false),
        cancel_observed: AtomicBool::new(false),
        failures: Mutex::new(AggregatedError::new()),
        progress: options.progress.as_ref(),
        progress_counter: AtomicUsize::new(0),
        progress_update_frequency: options.progress_update_frequency.max(1),
        total_items: range.len(),
    };

    if partition_count == 0 {
        return Ok(DispatchReport {
            failures: AggregatedError::new(),
            cancelled: false,
        });
    }

    let pool = options.pool.resolve()?;
    let active_workers = workers.min(partition_count);
    tracing::debug!(
        "Dispatching {} over {} partitions (chunk {}) to {} workers",
        range,
        partition_count,
        partitioner.chunk_size_for(range.len()),
        active_workers
    );

    // Partitions are queued in index order; the whole set fits the buffer
    let (work_tx, work_rx): (Sender<IndexRange>, Receiver<IndexRange>) = bounded(partition_count);
    for partition in partitions {
        if work_tx.send(partition).is_err() {
            break;
        }
    }
    drop(work_tx);

    pool.scope(|s| {
        for worker_id in 0..active_workers {
            let work_rx = work_rx.clone();
            let shared = &shared;
            let process = &process;
            s.spawn(move |_| {
                let ctx = WorkerContext { worker_id, shared };
                while let Ok(partition) = work_rx.recv() {
                    if ctx.skip_partition(partition) {
                        tracing::trace!("Worker {} skipping partition {}", worker_id, partition);
                        continue;
                    }
                    tracing::trace!("Worker {} processing partition {}", worker_id, partition);
                    if let Err(failure) = process(partition, &ctx) {
                        ctx.record(failure);
                    }
                }
            });
        }
    });

    let failures = match shared.failures.into_inner() {
        Ok(failures) => failures,
        Err(poisoned) => poisoned.into_inner(),
    };
    Ok(DispatchReport {
        failures: failures.sorted(),
        cancelled: shared.cancel_observed.load(Ordering::Acquire),
    })
}

/// Partitioned parallel loop with break/stop/cancel support
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutor {
    options: ExecutionOptions,
}

impl ParallelExecutor {
    pub fn new(options: ExecutionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Invoke `body(index, state)` for every index of `range`.
    ///
    /// Within one partition indices run in order; across partitions there is
    /// no ordering. Fails with [`ParallelError::Aggregation`] listing every
    /// recorded failure.
    pub fn run<R, F>(&self, range: R, body: F) -> Result<ExecutionResult>
    where
        R: Into<IndexRange>,
        F: Fn(usize, &LoopState) -> anyhow::Result<()> + Sync,
    {
        let range = range.into();
        let state = LoopState::new();

        let report = dispatch(range, &self.options, &state, |partition, ctx| {
            for index in partition.indices() {
                if ctx.should_skip(index) {
                    return Ok(());
                }
                guarded(Origin::Index(index), || body(index, ctx.state()))?;
                ctx.item_done();
            }
            Ok(())
        })?;

        let result = summarize(&state, &report);
        tracing::debug!("Loop over {} finished: {:?}", range, result);
        report.failures.into_result()?;
        Ok(result)
    }

    /// Invoke `body(item, index, state)` for every element of `items`
    pub fn for_each<T, F>(&self, items: &[T], body: F) -> Result<ExecutionResult>
    where
        T: Sync,
        F: Fn(&T, usize, &LoopState) -> anyhow::Result<()> + Sync,
    {
        self.run(0..items.len(), |index, state| body(&items[index], index, state))
    }
}

fn summarize(state: &LoopState, report: &DispatchReport) -> ExecutionResult {
    let control = state.control();
    ExecutionResult {
        completed: control == LoopControl::Running && !report.cancelled && report.failures.is_empty(),
        lowest_break_index: state.lowest_break_index(),
        cancelled: report.cancelled,
    }
}

/// Convenience function for a parallel loop with default options
pub fn parallel_for<F>(range: std::ops::Range<usize>, body: F) -> Result<ExecutionResult>
where
    F: Fn(usize, &LoopState) -> anyhow::Result<()> + Sync,
{
    ParallelExecutor::default().run(range, body)
}
