//! Behavioural guarantees of the execution engine, checked across
//! ranges, chunk sizes, worker counts and fan-out budgets.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use parwork::parallel::{
    Aggregator, ExecutionOptions, ForkJoinScheduler, FutureGraph, IndexRange, LoopState, ParallelExecutor,
    PoolChoice, TaskNode, WorkerPool, range_partitions,
};
use parwork::{FailureKind, Origin, ParallelError};

#[test]
fn partitions_cover_range_exactly() {
    for (start, end) in [(0, 0), (0, 1), (3, 17), (0, 1000), (999, 1024)] {
        for chunk in [1, 2, 7, 64, 5000] {
            let parts: Vec<IndexRange> = range_partitions(start, end, chunk).unwrap().collect();
            let mut cursor = start;
            for part in &parts {
                assert_eq!(part.start, cursor, "contiguous for [{start}, {end}) chunk {chunk}");
                assert!(!part.is_empty());
                assert!(part.len() <= chunk);
                cursor = part.end;
            }
            assert_eq!(cursor, end, "union equals [{start}, {end}) for chunk {chunk}");
        }
    }
}

#[test]
fn zero_chunk_size_is_rejected() {
    assert!(matches!(range_partitions(0, 10, 0), Err(ParallelError::InvalidArgument(_))));
}

#[test]
fn plain_loop_visits_every_index_once() {
    for workers in [1, 2, 5] {
        for chunk in [None, Some(1), Some(33)] {
            let mut options = ExecutionOptions::new().with_worker_limit(workers);
            if let Some(chunk) = chunk {
                options = options.with_chunk_size(chunk);
            }
            let seen = Mutex::new(Vec::new());
            let result = ParallelExecutor::new(options)
                .run(10..510, |i, _| {
                    seen.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();

            assert!(result.completed);
            assert_eq!(result.lowest_break_index, None);
            let mut seen = seen.into_inner().unwrap();
            seen.sort_unstable();
            assert_eq!(seen, (10..510).collect::<Vec<_>>());
        }
    }
}

#[test]
fn break_guarantees_every_lower_index() {
    for break_at in [0, 3, 250, 999] {
        let seen = Mutex::new(HashSet::new());
        let result = ParallelExecutor::new(ExecutionOptions::new().with_worker_limit(4).with_chunk_size(16))
            .run(0..1000, |i, state| {
                seen.lock().unwrap().insert(i);
                if i == break_at {
                    state.request_break(i)?;
                }
                Ok(())
            })
            .unwrap();

        assert!(!result.completed);
        assert_eq!(result.lowest_break_index, Some(break_at));
        let seen = seen.into_inner().unwrap();
        assert!((0..=break_at).all(|i| seen.contains(&i)), "break at {break_at}");
    }
}

#[test]
fn break_and_stop_race_raises_exactly_one_invalid_transition() {
    for _ in 0..100 {
        let state = Arc::new(LoopState::new());
        let a = {
            let state = state.clone();
            thread::spawn(move || state.request_break(5).is_err())
        };
        let b = {
            let state = state.clone();
            thread::spawn(move || state.request_stop().is_err())
        };
        let failures = [a.join().unwrap(), b.join().unwrap()].iter().filter(|f| **f).count();
        assert_eq!(failures, 1);
    }
}

#[test]
fn conflicting_requests_in_body_surface_as_invalid_transition() {
    let err = ParallelExecutor::new(ExecutionOptions::new().with_worker_limit(2))
        .run(0..100, |i, state| {
            if i == 10 {
                state.request_break(i)?;
                state.request_stop()?;
            }
            Ok(())
        })
        .unwrap_err();
    let agg = err.aggregated().unwrap();
    assert!(agg.first_of(FailureKind::InvalidTransition).is_some());
}

#[test]
fn aggregate_is_independent_of_worker_count() {
    const N: usize = 50_000;
    for workers in 1..=6 {
        let options = ExecutionOptions::new()
            .with_worker_limit(workers)
            .with_pool(PoolChoice::Isolated(workers));
        let total = Aggregator::new(options)
            .aggregate(0..N, 0u64, || 0u64, |acc, i| Ok(acc + i as u64), |t, l| *t += l)
            .unwrap();
        assert_eq!(total, (N as u64) * (N as u64 - 1) / 2);
    }
}

#[test]
fn parallel_walk_matches_sequential_for_any_budget() {
    let tree = TaskNode::balanced((0..2047u64).collect()).unwrap();
    let sequential = AtomicU64::new(0);
    ForkJoinScheduler::new()
        .walk(Some(&tree), |v| {
            sequential.fetch_add(*v, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

    for budget in [0, 1, 2, 16, 1024] {
        let sum = AtomicU64::new(0);
        let visits = AtomicUsize::new(0);
        ForkJoinScheduler::new()
            .with_fanout_budget(budget)
            .parallel_walk(Some(&tree), |v| {
                sum.fetch_add(*v, Ordering::Relaxed);
                visits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(visits.load(Ordering::Relaxed), 2047);
        assert_eq!(sum.load(Ordering::Relaxed), sequential.load(Ordering::Relaxed));
    }
}

#[test]
fn single_item_failure_leaves_siblings_complete() {
    let visited = AtomicUsize::new(0);
    let err = ParallelExecutor::new(ExecutionOptions::new().with_worker_limit(4).with_chunk_size(10))
        .run(0..200, |i, _| {
            if i == 105 {
                anyhow::bail!("item {i} exploded");
            }
            visited.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap_err();

    let agg = err.aggregated().unwrap();
    assert_eq!(agg.len(), 1);
    let failure = &agg.failures()[0];
    assert_eq!(failure.kind, FailureKind::ItemFailure);
    assert_eq!(failure.origin, Origin::Index(105));
    assert!(failure.message.contains("item 105 exploded"));
    // The faulting partition abandons 106..110; everything else still ran
    assert!(visited.load(Ordering::Relaxed) >= 200 - 10);
}

#[test]
fn failure_does_not_retire_the_only_worker() {
    let visited = AtomicUsize::new(0);
    let options = ExecutionOptions::new()
        .with_worker_limit(1)
        .with_chunk_size(10)
        .with_pool(PoolChoice::Isolated(1));
    let err = ParallelExecutor::new(options)
        .run(0..100, |i, _| {
            if i == 5 {
                anyhow::bail!("item {i} exploded");
            }
            visited.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.aggregated().unwrap().len(), 1);
    assert!(visited.load(Ordering::Relaxed) >= 90, "partitions 10..100 must still run");
}

#[test]
fn huge_depth_cutoff_walks_deep_chain() {
    let tree = TaskNode::skewed(100_000, 10, |i| i as u64);
    let visits = AtomicUsize::new(0);
    ForkJoinScheduler::new()
        .with_max_depth(1_000_000)
        .parallel_walk(Some(&tree), |_| {
            visits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    assert_eq!(visits.load(Ordering::Relaxed), 100_011);
}

#[test]
fn single_node_failure_leaves_siblings_complete() {
    let tree = TaskNode::balanced((0..127u32).collect()).unwrap();
    let visited = AtomicUsize::new(0);
    let err = ForkJoinScheduler::new()
        .parallel_walk(Some(&tree), |v| {
            if *v == 40 {
                anyhow::bail!("node {v} exploded");
            }
            visited.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap_err();

    let agg = err.aggregated().unwrap();
    assert_eq!(agg.len(), 1);
    assert!(matches!(agg.failures()[0].origin, Origin::Node(_)));
    assert_eq!(visited.load(Ordering::Relaxed), 126);
}

#[test]
fn when_all_continuation_starts_after_every_predecessor() {
    let graph = FutureGraph::with_pool(WorkerPool::isolated(4).unwrap());
    let completions = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = [40u64, 10, 25, 0]
        .into_iter()
        .map(|delay| {
            let completions = completions.clone();
            graph.submit(move || {
                thread::sleep(Duration::from_millis(delay));
                completions.lock().unwrap().push(Instant::now());
                Ok(())
            })
        })
        .collect();

    let started = graph.when_all(&handles, |_| Ok(Instant::now())).get().unwrap();
    let latest = completions.lock().unwrap().iter().copied().max().unwrap();
    assert!(started >= latest);
}

#[test]
fn cancellation_is_cooperative() {
    let token = parwork::parallel::CancellationToken::new();
    let in_flight_finished = Arc::new(AtomicBool::new(false));
    let flag = in_flight_finished.clone();
    let cancel = token.clone();

    let result = ParallelExecutor::new(ExecutionOptions::new().with_worker_limit(1).with_cancel(token))
        .run(0..1000, move |i, _| {
            if i == 0 {
                cancel.cancel();
                thread::sleep(Duration::from_millis(5));
                flag.store(true, Ordering::Release);
            }
            Ok(())
        })
        .unwrap();

    assert!(result.cancelled);
    assert!(!result.completed);
    assert!(in_flight_finished.load(Ordering::Acquire));
}
