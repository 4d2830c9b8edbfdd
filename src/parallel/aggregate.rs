//! Map-reduce over partitions with per-partition local state
//!
//! Each partition gets a fresh local accumulator from the seed factory,
//! folds its items into it, then merges it into the shared total through a
//! single mutex. `combine` therefore never runs concurrently with itself.
//!
//! Partitions finish in no particular order, so `fold` and `combine` must be
//! associative (and ideally commutative) for the total to be deterministic.

use std::sync::Mutex;

use super::executor::{ExecutionOptions, dispatch, guarded};
use super::partition::IndexRange;
use super::state::LoopState;
use crate::error::{Origin, ParallelError, Result};

/// Parallel aggregation engine
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    options: ExecutionOptions,
}

impl Aggregator {
    pub fn new(options: ExecutionOptions) -> Self {
        Self { options }
    }

    /// Fold every index of `range` into per-partition locals and combine
    /// them into `initial`.
    ///
    /// A failing fold discards that partition's local; the call then fails
    /// with every recorded failure. A fired cancellation token fails the
    /// call with [`ParallelError::Cancelled`].
    pub fn aggregate<R, T, L, S, F, C>(&self, range: R, initial: T, seed: S, fold: F, combine: C) -> Result<T>
    where
        R: Into<IndexRange>,
        T: Send,
        S: Fn() -> L + Sync,
        F: Fn(L, usize) -> anyhow::Result<L> + Sync,
        C: Fn(&mut T, L) + Sync,
    {
        let range = range.into();
        let total = Mutex::new(initial);
        let state = LoopState::new();

        let report = dispatch(range, &self.options, &state, |partition, ctx| {
            let mut local = guarded(Origin::Index(partition.start), || Ok(seed()))?;
            for index in partition.indices() {
                if ctx.should_skip(index) {
                    return Ok(());
                }
                local = guarded(Origin::Index(index), || fold(local, index))?;
                ctx.item_done();
            }
            guarded(Origin::Index(partition.start), || {
                let mut total = match total.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                combine(&mut total, local);
                Ok(())
            })
        })?;

        report.failures.into_result()?;
        if report.cancelled {
            return Err(ParallelError::Cancelled);
        }
        tracing::debug!("Aggregation over {} finished", range);
        Ok(match total.into_inner() {
            Ok(total) => total,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// [`aggregate`](Self::aggregate) over the elements of a slice
    pub fn aggregate_items<I, T, L, S, F, C>(&self, items: &[I], initial: T, seed: S, fold: F, combine: C) -> Result<T>
    where
        I: Sync,
        T: Send,
        S: Fn() -> L + Sync,
        F: Fn(L, &I) -> anyhow::Result<L> + Sync,
        C: Fn(&mut T, L) + Sync,
    {
        self.aggregate(0..items.len(), initial, seed, |local, index| fold(local, &items[index]), combine)
    }
}
