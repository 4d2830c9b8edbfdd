use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use parwork::config::EngineConfig;
use parwork::parallel::{ForkJoinScheduler, TaskNode};

use crate::cli::Output;

#[derive(Args)]
pub struct WalkArgs {
    /// Length of the root's left chain
    #[arg(long)]
    pub left: usize,

    /// Length of the root's right chain
    #[arg(long)]
    pub right: usize,

    /// Maximum outstanding spawned tasks
    #[arg(long)]
    pub budget: Option<usize>,

    /// Depth below which subtrees are walked sequentially
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Walk sequentially instead of fork-join
    #[arg(long)]
    pub sequential: bool,
}

pub fn execute(args: WalkArgs, config: &EngineConfig, output: &Output) -> Result<()> {
    let tree = TaskNode::skewed(args.left, args.right, |i| i as u64);
    let scheduler = ForkJoinScheduler::from_config(config);

    let visited = AtomicUsize::new(0);
    let visit = |_: &u64| -> anyhow::Result<()> {
        visited.fetch_add(1, Ordering::Relaxed);
        Ok(())
    };

    let started = Instant::now();
    if args.sequential {
        scheduler.walk(Some(&tree), visit).context("Sequential walk failed")?;
    } else {
        scheduler.parallel_walk(Some(&tree), visit).context("Parallel walk failed")?;
    }
    let elapsed = started.elapsed();

    let mode = if args.sequential { "sequential" } else { "fork-join" };
    output.header(&format!("Walk ({mode})"));
    output.key_value("Nodes", &tree.len().to_string(), false);
    output.key_value("Visited", &visited.load(Ordering::Relaxed).to_string(), true);
    output.key_value("Peak spawned", &scheduler.gate().peak().to_string(), false);
    output.key_value("Elapsed", &format!("{elapsed:?}"), false);
    output.success("Walk finished");
    Ok(())
}
