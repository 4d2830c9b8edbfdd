use anyhow::{Context, Result};
use clap::Args;
use parwork::parallel::FutureGraph;

use crate::cli::Output;

#[derive(Args)]
pub struct FuturesArgs {
    /// Input value for the graph
    #[arg(long)]
    pub a: i64,
}

fn f1(value: i64) -> anyhow::Result<i64> {
    value.checked_mul(42).context("F1 overflowed")
}

fn f2(value: i64) -> i64 {
    value % 2
}

fn f3(value: i64) -> i64 {
    value * value
}

fn f4(b: i64, d: i64) -> anyhow::Result<i64> {
    b.checked_mul(b)
        .and_then(|square| square.checked_sub(d))
        .context("F4 overflowed")
}

/// b = F1(a) and d = F3(F2(a)) run concurrently; e = F4(b, d) waits for both
pub fn execute(args: FuturesArgs, output: &Output) -> Result<()> {
    let graph = FutureGraph::new()?;
    let a = args.a;

    let b = graph.submit(move || f1(a));
    let d = graph.submit(move || Ok(f2(a))).then(|c| Ok(f3(c)));
    let e = graph.when_all(&[b.clone(), d.clone()], |values| f4(values[0], values[1]));

    let e = e.get().context("Future graph failed")?;
    output.key_value("b = F1(a)", &b.get()?.to_string(), false);
    output.key_value("d = F3(F2(a))", &d.get()?.to_string(), false);
    output.key_value("e = F4(b, d)", &e.to_string(), true);
    Ok(())
}
