//! Futures and continuations on the worker pool
//!
//! Every task resolves its [`Handle`] exactly once, with a value or a
//! failure. Continuations are registered callbacks that fire on the thread
//! that resolves the predecessor and only *schedule* the next task, so no
//! pool thread ever blocks waiting on another task. Only [`Handle::get`],
//! [`FutureGraph::when_any`] and [`FutureGraph::speculate`] block, and they
//! are meant to be called from outside the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam::channel::unbounded;

use super::cancel::CancellationToken;
use super::executor::guarded;
use super::pool::WorkerPool;
use crate::error::{AggregatedError, Failure, FailureKind, Origin, ParallelError, Result};

type Outcome<T> = std::result::Result<T, ParallelError>;
type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct SlotState<T> {
    outcome: Option<Outcome<T>>,
    waiting: Vec<Continuation<T>>,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    resolved: Condvar,
}

/// Result of a submitted task. Clones refer to the same task.
pub struct Handle<T> {
    id: usize,
    slot: Arc<Slot<T>>,
    graph: FutureGraph,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: self.slot.clone(),
            graph: self.graph.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("resolved", &lock(&self.slot.state).outcome.is_some())
            .finish()
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + 'static,
{
    /// Task number, also used as the failure origin
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        lock(&self.slot.state).outcome.is_some()
    }

    /// Block until the task resolves, then return its value or failure
    pub fn get(&self) -> Result<T> {
        let mut state = lock(&self.slot.state);
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = match self.slot.resolved.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Schedule `f` with this task's value once it resolves. A failure
    /// skips `f` and resolves the returned handle with the same failure.
    pub fn then<U, F>(&self, f: F) -> Handle<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let next = self.graph.pending();
        let out = next.clone();
        let graph = self.graph.clone();
        self.on_resolved(move |outcome| match outcome {
            Ok(value) => graph.schedule(out, None, move || f(value)),
            Err(e) => out.resolve(Err(e)),
        });
        next
    }

    fn resolve(&self, outcome: Outcome<T>) {
        let waiting = {
            let mut state = lock(&self.slot.state);
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiting)
        };
        self.slot.resolved.notify_all();
        for continuation in waiting {
            continuation(outcome.clone());
        }
    }

    /// Run `f` with the outcome once resolved; immediately if it already is
    fn on_resolved<F>(&self, f: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let ready = {
            let mut state = lock(&self.slot.state);
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.waiting.push(Box::new(f));
                    return;
                }
            }
        };
        f(ready)
    }
}

/// Spawns tasks on a worker pool and wires continuations between them
#[derive(Debug, Clone)]
pub struct FutureGraph {
    pool: WorkerPool,
    next_id: Arc<AtomicUsize>,
}

impl FutureGraph {
    /// Graph on the process-wide shared pool
    pub fn new() -> Result<Self> {
        Ok(Self::with_pool(WorkerPool::shared()?))
    }

    pub fn with_pool(pool: WorkerPool) -> Self {
        Self {
            pool,
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn pending<T>(&self) -> Handle<T> {
        Handle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState {
                    outcome: None,
                    waiting: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
            graph: self.clone(),
        }
    }

    fn schedule<T, F>(&self, handle: Handle<T>, token: Option<CancellationToken>, f: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.pool.spawn(move || {
            if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                tracing::trace!("Task {} cancelled before start", handle.id);
                handle.resolve(Err(ParallelError::Cancelled));
                return;
            }
            let outcome = guarded(Origin::Task(handle.id), f).map_err(|failure| {
                if failure.kind == FailureKind::Cancelled {
                    ParallelError::Cancelled
                } else {
                    tracing::warn!("{}", failure);
                    ParallelError::Aggregation(failure.into())
                }
            });
            handle.resolve(outcome);
        });
    }

    /// Start `f` on the pool
    pub fn submit<T, F>(&self, f: F) -> Handle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let handle = self.pending();
        self.schedule(handle.clone(), None, f);
        handle
    }

    /// Start `f` with a token it can poll. If the token has fired before
    /// the task starts, the task resolves as cancelled without running.
    pub fn submit_cancellable<T, F>(&self, token: &CancellationToken, f: F) -> Handle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&CancellationToken) -> anyhow::Result<T> + Send + 'static,
    {
        let handle = self.pending();
        let inner = token.clone();
        self.schedule(handle.clone(), Some(token.clone()), move || f(&inner));
        handle
    }

    /// Schedule `continuation` once every handle has resolved. If any
    /// failed, the continuation never runs and the returned handle carries
    /// every predecessor failure.
    pub fn when_all<T, R, F>(&self, handles: &[Handle<T>], continuation: F) -> Handle<R>
    where
        T: Clone + Send + 'static,
        R: Clone + Send + 'static,
        F: FnOnce(Vec<T>) -> anyhow::Result<R> + Send + 'static,
    {
        let next = self.pending();
        if handles.is_empty() {
            self.schedule(next.clone(), None, move || continuation(Vec::new()));
            return next;
        }

        struct Join<T, F> {
            values: Vec<Option<T>>,
            failures: AggregatedError,
            remaining: usize,
            continuation: Option<F>,
        }

        let join = Arc::new(Mutex::new(Join {
            values: (0..handles.len()).map(|_| None).collect(),
            failures: AggregatedError::new(),
            remaining: handles.len(),
            continuation: Some(continuation),
        }));

        for (position, handle) in handles.iter().enumerate() {
            let join = join.clone();
            let next = next.clone();
            let graph = self.clone();
            let origin = Origin::Task(handle.id);
            handle.on_resolved(move |outcome| {
                let mut state = lock(&join);
                match outcome {
                    Ok(value) => state.values[position] = Some(value),
                    Err(e) => state.failures.absorb(failures_of(e, origin)),
                }
                state.remaining -= 1;
                if state.remaining > 0 {
                    return;
                }
                let Some(continuation) = state.continuation.take() else {
                    return;
                };
                let failures = std::mem::take(&mut state.failures);
                let values: Vec<T> = std::mem::take(&mut state.values).into_iter().flatten().collect();
                drop(state);

                if failures.is_empty() {
                    graph.schedule(next, None, move || continuation(values));
                } else {
                    tracing::debug!("Continuation {} skipped: {}", next.id, failures);
                    next.resolve(Err(ParallelError::Aggregation(failures.sorted())));
                }
            });
        }
        next
    }

    /// Block until the first of `handles` resolves and return its position
    pub fn when_any<T>(handles: &[Handle<T>]) -> Result<usize>
    where
        T: Clone + Send + 'static,
    {
        if handles.is_empty() {
            return Err(ParallelError::InvalidArgument("when_any needs at least one handle".to_string()));
        }
        let (tx, rx) = unbounded();
        for (position, handle) in handles.iter().enumerate() {
            let tx = tx.clone();
            handle.on_resolved(move |_| {
                let _ = tx.send(position);
            });
        }
        drop(tx);
        rx.recv()
            .map_err(|_| ParallelError::Pool("every handle was dropped unresolved".to_string()))
    }

    /// Run every candidate with a shared token and return the first
    /// successful value. The others are cancelled and awaited; failures
    /// caused by the cancellation are discarded.
    pub fn speculate<T, F>(&self, candidates: Vec<F>) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&CancellationToken) -> anyhow::Result<T> + Send + 'static,
    {
        if candidates.is_empty() {
            return Err(ParallelError::InvalidArgument("speculate needs at least one candidate".to_string()));
        }
        let token = CancellationToken::new();
        let count = candidates.len();
        let (tx, rx) = unbounded();
        for candidate in candidates {
            let handle = self.submit_cancellable(&token, candidate);
            let tx = tx.clone();
            let origin = Origin::Task(handle.id);
            handle.on_resolved(move |outcome| {
                let _ = tx.send((origin, outcome));
            });
        }
        drop(tx);

        let mut winner = None;
        let mut failures = AggregatedError::new();
        for _ in 0..count {
            let Ok((origin, outcome)) = rx.recv() else {
                break;
            };
            match outcome {
                Ok(value) if winner.is_none() => {
                    tracing::debug!("Speculation won by {}", origin);
                    token.cancel();
                    winner = Some(value);
                }
                Ok(_) | Err(ParallelError::Cancelled) => {}
                Err(e) => failures_of(e, origin)
                    .into_failures()
                    .into_iter()
                    .filter(|f| f.kind != FailureKind::Cancelled)
                    .for_each(|f| failures.push(f)),
            }
        }

        match winner {
            Some(value) => Ok(value),
            None if failures.is_empty() => Err(ParallelError::Cancelled),
            None => Err(ParallelError::Aggregation(failures.sorted())),
        }
    }
}

fn failures_of(err: ParallelError, origin: Origin) -> AggregatedError {
    match err {
        ParallelError::Aggregation(failures) => failures,
        ParallelError::Cancelled => Failure::new(FailureKind::Cancelled, "Operation was cancelled", origin).into(),
        ParallelError::InvalidTransition(message) => {
            Failure::new(FailureKind::InvalidTransition, message, origin).into()
        }
        other => Failure::new(FailureKind::ItemFailure, other.to_string(), origin).into(),
    }
}
