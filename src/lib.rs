//! # parwork - partitioned parallel execution
//!
//! A small engine for data- and task-parallel work over a shared worker pool.
//!
//! ## Features
//!
//! - **Partitioned loops**: bounded-concurrency iteration over index ranges
//!   and slices with cooperative break, stop and cancellation
//! - **Aggregation**: per-partition local state folded in parallel and merged
//!   serially into one total
//! - **Fork-join walks**: recursive tree traversal with a depth cutoff and a
//!   bounded fan-out budget
//! - **Futures**: tasks with continuations, `when_all`, `when_any` and
//!   speculative execution
//!
//! ## Quick Start
//!
//! ```rust
//! use parwork::parallel::{Aggregator, ExecutionOptions};
//!
//! let total = Aggregator::new(ExecutionOptions::new())
//!     .aggregate(0..1_000, 0u64, || 0u64, |acc, i| Ok(acc + i as u64), |t, l| *t += l)
//!     .unwrap();
//! assert_eq!(total, 499_500);
//! ```

pub mod config;
pub mod error;
pub mod parallel;

pub use config::EngineConfig;
pub use error::{AggregatedError, Failure, FailureKind, Origin, ParallelError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
