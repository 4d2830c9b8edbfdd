//! Fork-join walks over binary trees
//!
//! A parallel walk treats every node as three independent units (visit the
//! node's data, walk the left subtree, walk the right subtree) and joins all
//! three before returning. Spawning is bounded two ways:
//!
//! - a depth cutoff, below which subtrees are walked sequentially in the
//!   caller's own context
//! - a fan-out budget shared by every walk of one scheduler; when no permit
//!   is free the unit runs inline instead of being spawned
//!
//! Sequential walks use an explicit stack, so degenerate chain-shaped trees
//! of any depth never overflow the call stack.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::cancel::CancellationToken;
use super::executor::guarded;
use super::pool::{PoolChoice, default_workers};
use crate::config::EngineConfig;
use crate::error::{AggregatedError, Failure, Origin, ParallelError, Result};

/// Position of a node relative to the root. Keeps the last 64 branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodePath {
    bits: u64,
    depth: usize,
}

impl NodePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn left(self) -> Self {
        Self {
            bits: self.bits << 1,
            depth: self.depth + 1,
        }
    }

    pub fn right(self) -> Self {
        Self {
            bits: (self.bits << 1) | 1,
            depth: self.depth + 1,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root")?;
        let shown = self.depth.min(u64::BITS as usize);
        if self.depth > shown {
            write!(f, "/…")?;
        }
        for i in (0..shown).rev() {
            let branch = if (self.bits >> i) & 1 == 1 { 'R' } else { 'L' };
            write!(f, "/{branch}")?;
        }
        Ok(())
    }
}

/// Binary tree node walked by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode<T> {
    pub data: T,
    pub left: Option<Box<TaskNode<T>>>,
    pub right: Option<Box<TaskNode<T>>>,
}

impl<T> TaskNode<T> {
    pub fn leaf(data: T) -> Self {
        Self {
            data,
            left: None,
            right: None,
        }
    }

    pub fn with_children(data: T, left: Option<TaskNode<T>>, right: Option<TaskNode<T>>) -> Self {
        Self {
            data,
            left: left.map(Box::new),
            right: right.map(Box::new),
        }
    }

    /// Balanced tree holding `values` in in-order position
    pub fn balanced(values: Vec<T>) -> Option<Self> {
        fn build<T>(values: &mut Vec<Option<T>>, lo: usize, hi: usize) -> Option<TaskNode<T>> {
            if lo >= hi {
                return None;
            }
            let mid = lo + (hi - lo) / 2;
            let left = build(values, lo, mid);
            let right = build(values, mid + 1, hi);
            let data = values[mid].take()?;
            Some(TaskNode::with_children(data, left, right))
        }
        let len = values.len();
        let mut slots: Vec<Option<T>> = values.into_iter().map(Some).collect();
        build(&mut slots, 0, len)
    }

    /// A root with a left-only chain of `left_len` nodes and a right-only
    /// chain of `right_len` nodes. Node data comes from `make(ordinal)`,
    /// where the root is ordinal 0.
    pub fn skewed<F>(left_len: usize, right_len: usize, mut make: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let mut root = TaskNode::leaf(make(0));
        let mut ordinal = 1;

        let mut slot = &mut root.left;
        for _ in 0..left_len {
            let node = slot.insert(Box::new(TaskNode::leaf(make(ordinal))));
            ordinal += 1;
            slot = &mut node.left;
        }

        let mut slot = &mut root.right;
        for _ in 0..right_len {
            let node = slot.insert(Box::new(TaskNode::leaf(make(ordinal))));
            ordinal += 1;
            slot = &mut node.right;
        }
        root
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.left.as_deref());
            stack.extend(node.right.as_deref());
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Longest root-to-leaf path, counting nodes
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.left.as_deref().map(|n| (n, depth + 1)));
            stack.extend(node.right.as_deref().map(|n| (n, depth + 1)));
        }
        deepest
    }
}

impl<T> Drop for TaskNode<T> {
    fn drop(&mut self) {
        let mut pending: Vec<Box<TaskNode<T>>> = Vec::new();
        pending.extend(self.left.take());
        pending.extend(self.right.take());
        while let Some(mut node) = pending.pop() {
            pending.extend(node.left.take());
            pending.extend(node.right.take());
        }
    }
}

/// Upper bound on the fork-join cutoff. Each forked level nests a
/// `rayon::scope` on the worker's stack, so deeper subtrees go sequential.
pub const MAX_FORK_DEPTH: usize = 64;

/// Depth cutoff used when none is configured: ceil(log2(nodes + 1)) + 2
pub fn default_max_depth(nodes: usize) -> usize {
    (usize::BITS - nodes.leading_zeros()) as usize + 2
}

/// Counting gate bounding outstanding spawned tasks
#[derive(Debug)]
pub struct FanoutGate {
    limit: usize,
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

/// Held by a spawned task; releases its slot on drop
pub struct Permit<'a> {
    gate: &'a FanoutGate,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FanoutGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            outstanding: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + 1, Ordering::Relaxed);
                    return Some(Permit { gate: self });
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Highest number of permits ever held at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Boxed action for [`ForkJoinScheduler::invoke`]
pub type Action<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'a>;

/// Recursive task scheduler for tree-shaped work
#[derive(Debug, Clone)]
pub struct ForkJoinScheduler {
    pool: PoolChoice,
    max_depth: Option<usize>,
    gate: Arc<FanoutGate>,
    cancel: CancellationToken,
}

impl Default for ForkJoinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkJoinScheduler {
    /// Shared pool, automatic depth cutoff, budget of four tasks per worker
    pub fn new() -> Self {
        Self {
            pool: PoolChoice::Shared,
            max_depth: None,
            gate: Arc::new(FanoutGate::new(default_workers() * 4)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut scheduler = Self::new().with_fanout_budget(config.resolved_fanout_budget());
        if config.max_depth > 0 {
            scheduler = scheduler.with_max_depth(config.max_depth);
        }
        scheduler
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    /// Cap on concurrently outstanding spawned tasks; 0 never spawns
    pub fn with_fanout_budget(mut self, budget: usize) -> Self {
        self.gate = Arc::new(FanoutGate::new(budget));
        self
    }

    pub fn with_pool(mut self, pool: PoolChoice) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn gate(&self) -> &FanoutGate {
        &self.gate
    }

    /// Sequential pre-order walk. A failing visit is recorded and the walk
    /// continues with the node's children.
    pub fn walk<T, F>(&self, root: Option<&TaskNode<T>>, visit: F) -> Result<()>
    where
        F: Fn(&T) -> anyhow::Result<()>,
    {
        let Some(root) = root else {
            return Ok(());
        };
        let mut cancelled = false;
        let failures = walk_sequential(root, NodePath::root(), &visit, &self.cancel, &mut cancelled);
        finish(failures, cancelled)
    }

    /// Fork-join walk. Every spawned unit is joined before this returns;
    /// failures from all subtrees are listed in one aggregated error.
    pub fn parallel_walk<T, F>(&self, root: Option<&TaskNode<T>>, visit: F) -> Result<()>
    where
        T: Sync,
        F: Fn(&T) -> anyhow::Result<()> + Sync,
    {
        let Some(root) = root else {
            return Ok(());
        };
        let max_depth = match self.max_depth {
            Some(depth) => depth,
            None => default_max_depth(root.len()),
        }
        .min(MAX_FORK_DEPTH);
        let pool = self.pool.resolve()?;
        tracing::debug!(
            "Parallel walk: max depth {}, fan-out budget {}, {} pool threads",
            max_depth,
            self.gate.limit(),
            pool.threads()
        );

        let walker = Walker {
            visit: &visit,
            gate: &self.gate,
            cancel: &self.cancel,
            max_depth,
            cancelled: AtomicBool::new(false),
        };
        let failures = pool.install(|| walker.walk(root, NodePath::root()));
        finish(failures, walker.cancelled.load(Ordering::Acquire))
    }

    /// Run independent actions concurrently and join them all
    pub fn invoke<'a>(&self, actions: Vec<Action<'a>>) -> Result<()> {
        let pool = self.pool.resolve()?;
        let failures = Mutex::new(AggregatedError::new());
        let gate = &self.gate;
        let record = |failure: Failure| match failures.lock() {
            Ok(mut f) => f.push(failure),
            Err(poisoned) => poisoned.into_inner().push(failure),
        };

        pool.scope(|s| {
            let mut inline = Vec::new();
            for (position, action) in actions.into_iter().enumerate() {
                match gate.try_acquire() {
                    Some(permit) => {
                        let record = &record;
                        s.spawn(move |_| {
                            let _permit = permit;
                            if let Err(failure) = guarded(Origin::Task(position), action) {
                                record(failure);
                            }
                        });
                    }
                    None => inline.push((position, action)),
                }
            }
            for (position, action) in inline {
                if let Err(failure) = guarded(Origin::Task(position), action) {
                    record(failure);
                }
            }
        });

        let failures = match failures.into_inner() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.sorted().into_result()
    }
}

fn finish(failures: AggregatedError, cancelled: bool) -> Result<()> {
    if !failures.is_empty() {
        return Err(ParallelError::Aggregation(failures));
    }
    if cancelled {
        return Err(ParallelError::Cancelled);
    }
    Ok(())
}

fn walk_sequential<T, F>(
    root: &TaskNode<T>,
    path: NodePath,
    visit: &F,
    cancel: &CancellationToken,
    cancelled: &mut bool,
) -> AggregatedError
where
    F: Fn(&T) -> anyhow::Result<()>,
{
    let mut failures = AggregatedError::new();
    let mut stack = vec![(root, path)];
    while let Some((node, path)) = stack.pop() {
        if cancel.is_cancelled() {
            *cancelled = true;
            break;
        }
        if let Err(failure) = guarded(Origin::Node(path), || visit(&node.data)) {
            failures.push(failure);
        }
        // Right first so the left subtree is visited first
        stack.extend(node.right.as_deref().map(|n| (n, path.right())));
        stack.extend(node.left.as_deref().map(|n| (n, path.left())));
    }
    failures
}

struct Walker<'a, F> {
    visit: &'a F,
    gate: &'a FanoutGate,
    cancel: &'a CancellationToken,
    max_depth: usize,
    cancelled: AtomicBool,
}

impl<F> Walker<'_, F> {
    fn walk<T>(&self, node: &TaskNode<T>, path: NodePath) -> AggregatedError
    where
        T: Sync,
        F: Fn(&T) -> anyhow::Result<()> + Sync,
    {
        if self.cancel.is_cancelled() {
            self.cancelled.store(true, Ordering::Release);
            return AggregatedError::new();
        }
        if path.depth() >= self.max_depth {
            let mut cancelled = false;
            let failures = walk_sequential(node, path, self.visit, self.cancel, &mut cancelled);
            if cancelled {
                self.cancelled.store(true, Ordering::Release);
            }
            return failures;
        }

        let mut data_failures = AggregatedError::new();
        let mut left_failures = AggregatedError::new();
        let mut right_failures = AggregatedError::new();

        rayon::scope(|s| {
            let data_out = &mut data_failures;
            let mut visit_data = move || {
                if let Err(failure) = guarded(Origin::Node(path), || (self.visit)(&node.data)) {
                    data_out.push(failure);
                }
            };
            match self.gate.try_acquire() {
                Some(permit) => s.spawn(move |_| {
                    let _permit = permit;
                    visit_data();
                }),
                None => visit_data(),
            }

            for (child, child_path, out) in [
                (node.left.as_deref(), path.left(), &mut left_failures),
                (node.right.as_deref(), path.right(), &mut right_failures),
            ] {
                let Some(child) = child else {
                    continue;
                };
                match self.gate.try_acquire() {
                    Some(permit) => s.spawn(move |_| {
                        let _permit = permit;
                        *out = self.walk(child, child_path);
                    }),
                    None => *out = self.walk(child, child_path),
                }
            }
        });

        data_failures.absorb(left_failures);
        data_failures.absorb(right_failures);
        data_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::sync::atomic::AtomicU64;

    fn counting_tree(nodes: usize) -> TaskNode<usize> {
        TaskNode::balanced((0..nodes).collect()).unwrap()
    }

    #[test]
    fn test_balanced_tree_shape() {
        let tree = counting_tree(1023);
        assert_eq!(tree.len(), 1023);
        assert_eq!(tree.depth(), 10);
        assert!(TaskNode::<u8>::balanced(Vec::new()).is_none());
    }

    #[test]
    fn test_skewed_tree_shape() {
        let tree = TaskNode::skewed(5, 3, |i| i);
        assert_eq!(tree.len(), 9);
        assert_eq!(tree.depth(), 6);
        assert_eq!(tree.data, 0);
        assert_eq!(tree.right.as_ref().unwrap().data, 6);
    }

    #[test]
    fn test_node_path_display() {
        assert_eq!(NodePath::root().to_string(), "root");
        assert_eq!(NodePath::root().left().right().to_string(), "root/L/R");
        let mut deep = NodePath::root();
        for _ in 0..70 {
            deep = deep.right();
        }
        assert_eq!(deep.depth(), 70);
        assert!(deep.to_string().starts_with("root/…/R"));
    }

    #[test]
    fn test_default_max_depth() {
        assert_eq!(default_max_depth(0), 2);
        assert_eq!(default_max_depth(1), 3);
        assert_eq!(default_max_depth(1023), 12);
        assert_eq!(default_max_depth(1024), 13);
    }

    #[test]
    fn test_fanout_gate_limits_permits() {
        let gate = FanoutGate::new(2);
        let a = gate.try_acquire();
        let b = gate.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.peak(), 2);
        drop(b);
        assert_eq!(gate.outstanding(), 0);
    }

    #[test]
    fn test_parallel_walk_matches_sequential() {
        let tree = counting_tree(4095);
        let expected: u64 = (0..4095u64).sum();

        for budget in [0, 1, 3, 64] {
            let scheduler = ForkJoinScheduler::new().with_fanout_budget(budget);
            let sum = AtomicU64::new(0);
            let visits = AtomicUsize::new(0);
            scheduler
                .parallel_walk(Some(&tree), |v| {
                    sum.fetch_add(*v as u64, Ordering::Relaxed);
                    visits.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
                .unwrap();
            assert_eq!(visits.load(Ordering::Relaxed), 4095, "budget {budget}");
            assert_eq!(sum.load(Ordering::Relaxed), expected);
            assert!(scheduler.gate().peak() <= budget);
        }

        let sequential = AtomicUsize::new(0);
        ForkJoinScheduler::new()
            .walk(Some(&tree), |_| {
                sequential.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(sequential.load(Ordering::Relaxed), 4095);
    }

    #[test]
    fn test_sequential_walk_is_preorder() {
        let tree = TaskNode::with_children(
            1,
            Some(TaskNode::with_children(2, Some(TaskNode::leaf(3)), None)),
            Some(TaskNode::leaf(4)),
        );
        let order = Mutex::new(Vec::new());
        ForkJoinScheduler::new()
            .walk(Some(&tree), |v| {
                order.lock().unwrap().push(*v);
                Ok(())
            })
            .unwrap();
        assert_eq!(order.into_inner().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let tree = TaskNode::skewed(100_000, 7_500, |i| i);
        let visits = AtomicUsize::new(0);
        ForkJoinScheduler::new()
            .parallel_walk(Some(&tree), |_| {
                visits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(visits.load(Ordering::Relaxed), 107_501);
    }

    #[test]
    fn test_huge_max_depth_is_clamped() {
        let tree = TaskNode::skewed(100_000, 10, |i| i);
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
    fn test_every_failing_subtree_is_reported() {
        let tree = counting_tree(255);
        let visits = AtomicUsize::new(0);
        let err = ForkJoinScheduler::new()
            .parallel_walk(Some(&tree), |v| {
                visits.fetch_add(1, Ordering::Relaxed);
                if *v % 100 == 7 {
                    anyhow::bail!("node {v} failed");
                }
                Ok(())
            })
            .unwrap_err();

        let agg = err.aggregated().unwrap();
        assert_eq!(agg.len(), 3); // 7, 107, 207
        assert!(agg.failures().iter().all(|f| matches!(f.origin, Origin::Node(_))));
        assert_eq!(visits.load(Ordering::Relaxed), 255);
    }

    #[test]
    fn test_single_failure_keeps_siblings() {
        let tree = counting_tree(31);
        let visits = AtomicUsize::new(0);
        let err = ForkJoinScheduler::new()
            .with_max_depth(2)
            .parallel_walk(Some(&tree), |v| {
                visits.fetch_add(1, Ordering::Relaxed);
                if *v == 15 {
                    anyhow::bail!("root failed");
                }
                Ok(())
            })
            .unwrap_err();
        let agg = err.aggregated().unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.failures()[0].origin, Origin::Node(NodePath::root()));
        assert_eq!(visits.load(Ordering::Relaxed), 31);
    }

    #[test]
    fn test_cancelled_walk() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tree = counting_tree(15);
        let err = ForkJoinScheduler::new()
            .with_cancel(cancel)
            .parallel_walk(Some(&tree), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ParallelError::Cancelled));
    }

    #[test]
    fn test_empty_tree_is_noop() {
        let scheduler = ForkJoinScheduler::new();
        assert!(scheduler.walk::<u8, _>(None, |_| Ok(())).is_ok());
        assert!(scheduler.parallel_walk::<u8, _>(None, |_| Ok(())).is_ok());
    }

    #[test]
    fn test_invoke_joins_all_actions() {
        let ran = AtomicUsize::new(0);
        let actions: Vec<Action<'_>> = (0..3)
            .map(|i| {
                let ran = &ran;
                Box::new(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                    if i == 2 {
                        anyhow::bail!("Center task blew up");
                    }
                    Ok(())
                }) as Action<'_>
            })
            .collect();

        let err = ForkJoinScheduler::new().invoke(actions).unwrap_err();
        assert_eq!(ran.load(Ordering::Relaxed), 3);
        let agg = err.aggregated().unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.failures()[0].origin, Origin::Task(2));
        assert_eq!(agg.failures()[0].kind, FailureKind::ItemFailure);
    }
}
