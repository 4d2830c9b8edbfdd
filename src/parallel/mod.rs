//! Partitioned parallel execution engine
//!
//! This module owns everything about *how* work is spread over threads.
//! Callers hand it plain closures and data; it never interprets either.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Partitioner  │──▶│   crossbeam   │──▶│   workers    │──▶│ LoopState / │
//! │ index ranges │   │ work channel  │   │ (rayon pool) │   │ failures    │
//! └──────────────┘   └───────────────┘   └──────────────┘   └─────────────┘
//!        ▲                                       │
//!        │                                       ▼
//! ┌──────────────┐                       ┌──────────────┐
//! │ Executor /   │◀──────── join ────────│ Aggregated   │
//! │ Aggregator   │                       │ result       │
//! └──────────────┘                       └──────────────┘
//! ```
//!
//! - [`ParallelExecutor`] runs a body over an index range or a slice, with
//!   break, stop and cancellation checked between items.
//! - [`Aggregator`] folds partitions into per-partition locals and merges
//!   them into one total under a mutex.
//! - [`ForkJoinScheduler`] walks binary trees with a depth cutoff and a
//!   bounded fan-out budget.
//! - [`FutureGraph`] wires tasks together with continuations.
//!
//! Every entry point blocks until all the work it dispatched has finished.
//! Failures are captured where they happen and surface once, at that join,
//! as a [`ParallelError::Aggregation`](crate::ParallelError::Aggregation).
//!
//! # Example
//!
//! ```rust
//! use parwork::parallel::{ExecutionOptions, ParallelExecutor};
//!
//! let executor = ParallelExecutor::new(ExecutionOptions::new().with_worker_limit(4));
//! let result = executor
//!     .run(0..1_000, |i, state| {
//!         if i == 500 {
//!             state.request_break(i)?;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(result.lowest_break_index, Some(500));
//! ```

pub mod aggregate;
pub mod cancel;
pub mod executor;
pub mod fork_join;
pub mod future;
pub mod partition;
pub mod pool;
pub mod state;

pub use aggregate::Aggregator;
pub use cancel::CancellationToken;
pub use executor::{ExecutionOptions, ExecutionResult, ParallelExecutor, ProgressFn, parallel_for};
pub use fork_join::{Action, ForkJoinScheduler, NodePath, TaskNode};
pub use future::{FutureGraph, Handle};
pub use partition::{IndexRange, Partitioner, range_partitions};
pub use pool::{PoolChoice, WorkerPool};
pub use state::{LoopControl, LoopState};
