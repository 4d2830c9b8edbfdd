//! Worker pools
//!
//! One process-wide pool is built lazily on first use and lives until the
//! process exits. Callers that need isolation build a private pool which is
//! torn down when its last handle drops.

use std::sync::{Arc, LazyLock};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{ParallelError, Result};

/// Global shared pool - built once, sized to the available cores
static SHARED: LazyLock<std::result::Result<Arc<ThreadPool>, String>> = LazyLock::new(|| {
    let threads = num_cpus::get().max(1);
    tracing::debug!("Building shared worker pool with {} threads", threads);
    build_pool(threads, "parwork-shared").map(Arc::new)
});

fn build_pool(threads: usize, prefix: &'static str) -> std::result::Result<ThreadPool, String> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{prefix}-{i}"))
        .build()
        .map_err(|e| format!("Failed to create thread pool: {e}"))
}

/// Handle to the threads an execution call runs on
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<ThreadPool>,
    isolated: bool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("isolated", &self.isolated)
            .finish()
    }
}

impl WorkerPool {
    /// The process-wide pool
    pub fn shared() -> Result<Self> {
        match &*SHARED {
            Ok(pool) => Ok(Self {
                inner: pool.clone(),
                isolated: false,
            }),
            Err(e) => Err(ParallelError::Pool(e.clone())),
        }
    }

    /// A private pool with `threads` workers
    pub fn isolated(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(ParallelError::InvalidArgument(
                "isolated pool needs at least one thread".to_string(),
            ));
        }
        let pool = build_pool(threads, "parwork-isolated").map_err(ParallelError::Pool)?;
        Ok(Self {
            inner: Arc::new(pool),
            isolated: true,
        })
    }

    pub fn threads(&self) -> usize {
        self.inner.current_num_threads()
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Run `op` inside a scope on this pool, blocking until every task
    /// spawned in the scope has finished
    pub fn scope<'scope, OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce(&rayon::Scope<'scope>) -> R + Send,
        R: Send,
    {
        self.inner.scope(op)
    }

    /// Run `op` on one of this pool's threads and wait for it
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.inner.install(op)
    }

    /// Fire-and-forget task on this pool
    pub fn spawn<OP>(&self, op: OP)
    where
        OP: FnOnce() + Send + 'static,
    {
        self.inner.spawn(op)
    }
}

/// Which pool an execution call should use
#[derive(Debug, Clone, Default)]
pub enum PoolChoice {
    /// The process-wide pool
    #[default]
    Shared,
    /// A fresh pool owned by the call and dropped when it returns
    Isolated(usize),
    /// A caller-owned pool
    Pool(WorkerPool),
}

impl PoolChoice {
    pub fn resolve(&self) -> Result<WorkerPool> {
        match self {
            PoolChoice::Shared => WorkerPool::shared(),
            PoolChoice::Isolated(threads) => WorkerPool::isolated(*threads),
            PoolChoice::Pool(pool) => Ok(pool.clone()),
        }
    }
}

/// Resolve the worker count from a configured limit and CPU percentage
///
/// ```text
/// 1. cores = num_cpus::get()
/// 2. by_percentage = max(1, cores * percentage / 100)
/// 3. limit > 0 => min(limit, by_percentage), otherwise by_percentage
/// ```
pub fn calculate_workers(limit: usize, thread_percentage: u8) -> usize {
    let available_cores = num_cpus::get();
    let by_percentage = std::cmp::max(1, (available_cores * thread_percentage.min(100) as usize) / 100);
    if limit > 0 {
        std::cmp::min(limit, by_percentage)
    } else {
        by_percentage
    }
}

/// Default worker limit: hardware concurrency
pub fn default_workers() -> usize {
    calculate_workers(0, 100)
}
