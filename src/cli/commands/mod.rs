use anyhow::Result;
use clap::{Parser, Subcommand};
use parwork::config::{ConfigOverrides, EngineConfig};

use crate::cli::Output;

pub mod config;
pub mod futures;
pub mod loops;
pub mod sum;
pub mod walk;

#[derive(Parser)]
#[command(
    name = "parwork",
    version = env!("CARGO_PKG_VERSION"),
    about = "Partitioned parallel loops, aggregation, tree walks and futures",
    long_about = "parwork drives its parallel execution engine over generated workloads: \
                  partitioned loops with break/stop/timeout, map-reduce sums, fork-join \
                  walks over skewed trees and future dependency graphs."
)]
pub struct Cli {
    /// Increase verbosity (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Use custom configuration file
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Maximum concurrently active workers
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a partitioned loop with optional break, stop or timeout
    Loop(loops::LoopArgs),
    /// Sum 0..N with per-partition accumulators
    Sum(sum::SumArgs),
    /// Walk a skewed tree with the fork-join scheduler
    Walk(walk::WalkArgs),
    /// Evaluate a small future dependency graph
    Futures(futures::FuturesArgs),
    /// Configuration management
    Config(config::ConfigArgs),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        setup_logging(self.verbose, self.quiet);

        let mut overrides = ConfigOverrides {
            worker_limit: self.workers,
            ..Default::default()
        };
        if let Commands::Walk(args) = &self.command {
            overrides.max_depth = args.max_depth;
            overrides.fanout_budget = args.budget;
        }

        let config = EngineConfig::load(self.config.as_deref(), Some(overrides))?;
        tracing::debug!("Loaded configuration: {:?}", config);
        let output = Output::new(self.quiet);

        match self.command {
            Commands::Loop(args) => loops::execute(args, &config, &output),
            Commands::Sum(args) => sum::execute(args, &config, &output),
            Commands::Walk(args) => walk::execute(args, &config, &output),
            Commands::Futures(args) => futures::execute(args, &output),
            Commands::Config(args) => config::execute(args, &config),
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => tracing_subscriber::EnvFilter::new("warn"),
        1 => tracing_subscriber::EnvFilter::new("info"),
        2 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
