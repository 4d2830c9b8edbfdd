//! Shared loop control for one execution call
//!
//! The state lives in a single atomic word holding one of
//! `Running`, `Stop` or `Break(lowest index)`. Every transition is a
//! compare-and-swap, so "both break and stop requested" cannot be
//! represented and a racing break/stop pair always yields exactly one
//! `InvalidTransition`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ParallelError, Result};

const RUNNING: u64 = 0;
const STOPPED: u64 = 1;
const BREAK_BASE: u64 = 2;

/// Snapshot of a [`LoopState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Running,
    Stop,
    Break(usize),
}

impl LoopControl {
    fn decode(word: u64) -> Self {
        match word {
            RUNNING => LoopControl::Running,
            STOPPED => LoopControl::Stop,
            w => LoopControl::Break((w - BREAK_BASE) as usize),
        }
    }
}

fn encode_break(index: usize) -> Result<u64> {
    (index as u64)
        .checked_add(BREAK_BASE)
        .ok_or_else(|| ParallelError::InvalidArgument(format!("Break index {index} is out of range")))
}

/// Per-run control object shared by reference across all workers
#[derive(Debug, Default)]
pub struct LoopState {
    word: AtomicU64,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(RUNNING),
        }
    }

    /// Request that iterations above `index` stop being scheduled.
    ///
    /// Every iteration below the lowest requested break index still runs.
    /// Fails if stop was already requested, or if `index` is one of the
    /// top two values of a 64-bit index.
    pub fn request_break(&self, index: usize) -> Result<()> {
        let wanted = encode_break(index)?;
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let next = match current {
                STOPPED => {
                    return Err(ParallelError::InvalidTransition(
                        "Break was called after Stop was called.".to_string(),
                    ));
                }
                RUNNING => wanted,
                lowest if wanted < lowest => wanted,
                _ => return Ok(()),
            };
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Request that no further iterations be started. Fails if break was
    /// already requested.
    pub fn request_stop(&self) -> Result<()> {
        match self
            .word
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(STOPPED) => Ok(()),
            Err(_) => Err(ParallelError::InvalidTransition(
                "Stop was called after Break was called.".to_string(),
            )),
        }
    }

    /// True once either break or stop has been requested
    pub fn should_exit(&self) -> bool {
        self.word.load(Ordering::Acquire) != RUNNING
    }

    /// Whether iteration `index` may be skipped. Under break only indices
    /// above the lowest break index are skippable.
    pub fn should_exit_at(&self, index: usize) -> bool {
        match self.control() {
            LoopControl::Running => false,
            LoopControl::Stop => true,
            LoopControl::Break(lowest) => index > lowest,
        }
    }

    pub fn control(&self) -> LoopControl {
        LoopControl::decode(self.word.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.control() == LoopControl::Stop
    }

    pub fn lowest_break_index(&self) -> Option<usize> {
        match self.control() {
            LoopControl::Break(lowest) => Some(lowest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_state_is_running() {
        let state = LoopState::new();
        assert!(!state.should_exit());
        assert_eq!(state.control(), LoopControl::Running);
        assert_eq!(state.lowest_break_index(), None);
    }

    #[test]
    fn test_break_keeps_lowest_index() {
        let state = LoopState::new();
        state.request_break(40).unwrap();
        state.request_break(3).unwrap();
        state.request_break(17).unwrap();
        assert_eq!(state.lowest_break_index(), Some(3));
        assert!(state.should_exit());
        assert!(!state.should_exit_at(2));
        assert!(!state.should_exit_at(3));
        assert!(state.should_exit_at(4));
    }

    #[test]
    fn test_break_at_zero() {
        let state = LoopState::new();
        state.request_break(0).unwrap();
        assert_eq!(state.control(), LoopControl::Break(0));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_break_index_upper_bound() {
        let state = LoopState::new();
        for index in [usize::MAX, usize::MAX - 1] {
            assert!(matches!(
                state.request_break(index),
                Err(ParallelError::InvalidArgument(_))
            ));
        }
        assert_eq!(state.control(), LoopControl::Running);

        state.request_break(usize::MAX - 2).unwrap();
        assert_eq!(state.lowest_break_index(), Some(usize::MAX - 2));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let state = LoopState::new();
        state.request_stop().unwrap();
        state.request_stop().unwrap();
        assert!(state.is_stopped());
        assert!(state.should_exit_at(0));
        assert_eq!(state.lowest_break_index(), None);
    }

    #[test]
    fn test_stop_after_break_is_invalid() {
        let state = LoopState::new();
        state.request_break(5).unwrap();
        let err = state.request_stop().unwrap_err();
        assert!(err.to_string().contains("Stop was called after Break was called."));
        assert_eq!(state.lowest_break_index(), Some(5));
    }

    #[test]
    fn test_break_after_stop_is_invalid() {
        let state = LoopState::new();
        state.request_stop().unwrap();
        let err = state.request_break(5).unwrap_err();
        assert!(err.to_string().contains("Break was called after Stop was called."));
        assert!(state.is_stopped());
    }

    #[test]
    fn test_racing_break_and_stop_yield_one_invalid_transition() {
        for _ in 0..200 {
            let state = Arc::new(LoopState::new());
            let breaker = {
                let state = state.clone();
                thread::spawn(move || state.request_break(10))
            };
            let stopper = {
                let state = state.clone();
                thread::spawn(move || state.request_stop())
            };
            let outcomes = [breaker.join().unwrap(), stopper.join().unwrap()];
            let failures = outcomes.iter().filter(|r| r.is_err()).count();
            assert_eq!(failures, 1);
        }
    }

    #[test]
    fn test_concurrent_breaks_converge_to_minimum() {
        let state = Arc::new(LoopState::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let state = state.clone();
                thread::spawn(move || {
                    for i in (t * 100..t * 100 + 100).rev() {
                        state.request_break(i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.lowest_break_index(), Some(0));
    }
}
