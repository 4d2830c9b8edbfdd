use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use parwork::config::EngineConfig;
use parwork::parallel::{CancellationToken, ExecutionOptions, IndexRange, ParallelExecutor};

use crate::cli::Output;

#[derive(Args)]
pub struct LoopArgs {
    /// First index (inclusive)
    #[arg(long, default_value_t = 0)]
    pub start: usize,

    /// Last index (exclusive)
    #[arg(long)]
    pub end: usize,

    /// Items per partition (default: derived from worker count)
    #[arg(long)]
    pub chunk: Option<usize>,

    /// Request a break when this index runs
    #[arg(long, conflicts_with = "stop_at")]
    pub break_at: Option<usize>,

    /// Request a stop when this index runs
    #[arg(long)]
    pub stop_at: Option<usize>,

    /// Cancel the loop after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Make the body fail when this index runs
    #[arg(long)]
    pub fail_at: Option<usize>,

    /// Simulated work per item in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,
}

pub fn execute(args: LoopArgs, config: &EngineConfig, output: &Output) -> Result<()> {
    let range = IndexRange::new(args.start, args.end).context("Invalid loop range")?;

    let pb = output.progress_bar(range.len() as u64, "items");
    let mut options = ExecutionOptions::from_config(config);
    if !output.is_quiet() {
        let bar = pb.clone();
        options = options.with_progress(move |current, _, _| bar.set_position(current as u64));
    }
    if let Some(chunk) = args.chunk {
        options = options.with_chunk_size(chunk);
    }
    if let Some(timeout) = args.timeout_ms {
        options = options.with_cancel(CancellationToken::after(Duration::from_millis(timeout)));
    }

    let processed = AtomicUsize::new(0);
    let delay = Duration::from_millis(args.delay_ms);
    let result = ParallelExecutor::new(options).run(range, |i, state| {
        if args.break_at == Some(i) {
            state.request_break(i)?;
        }
        if args.stop_at == Some(i) {
            state.request_stop()?;
        }
        if args.fail_at == Some(i) {
            anyhow::bail!("simulated failure");
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    pb.finish_and_clear();
    if let Err(err) = &result
        && let Some(agg) = err.aggregated()
    {
        for failure in agg.failures() {
            output.error(&failure.to_string());
        }
    }
    let result = result.context("Parallel loop failed")?;

    output.header(&format!("Loop over {range}"));
    output.key_value("Processed", &processed.load(Ordering::Relaxed).to_string(), false);
    output.key_value("Completed", &result.completed.to_string(), result.completed);
    let lowest = result
        .lowest_break_index
        .map_or_else(|| "none".to_string(), |i| i.to_string());
    output.key_value("Lowest break index", &lowest, false);
    output.key_value("Cancelled", &result.cancelled.to_string(), false);

    if result.completed {
        output.success("Loop ran to completion");
    } else if result.cancelled {
        output.warning("Loop was cancelled before finishing");
    } else {
        output.info("Loop ended early");
    }
    Ok(())
}
