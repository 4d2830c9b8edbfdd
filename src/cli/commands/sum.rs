use anyhow::{Context, Result, bail};
use clap::Args;
use parwork::config::EngineConfig;
use parwork::parallel::{Aggregator, ExecutionOptions};

use crate::cli::Output;

#[derive(Args)]
pub struct SumArgs {
    /// Sum the integers 0..END
    #[arg(long)]
    pub end: u64,

    /// Items per partition (default: derived from worker count)
    #[arg(long)]
    pub chunk: Option<usize>,
}

pub fn execute(args: SumArgs, config: &EngineConfig, output: &Output) -> Result<()> {
    let end = usize::try_from(args.end).context("END does not fit in this platform's index type")?;
    let mut options = ExecutionOptions::from_config(config);
    if let Some(chunk) = args.chunk {
        options = options.with_chunk_size(chunk);
    }

    let total = Aggregator::new(options)
        .aggregate(
            0..end,
            0u128,
            || 0u128,
            |acc, i| Ok(acc + i as u128),
            |total, local| *total += local,
        )
        .context("Parallel sum failed")?;

    let n = args.end as u128;
    let expected = if n == 0 { 0 } else { n * (n - 1) / 2 };

    output.key_value("Sum", &total.to_string(), true);
    output.key_value("Expected", &expected.to_string(), false);
    if total != expected {
        output.error("Parallel sum disagrees with the closed form");
        bail!("Sum mismatch: got {total}, expected {expected}");
    }
    output.success("Sum matches n(n-1)/2");
    Ok(())
}
