//! Command-line interface for parwork
//!
//! Each subcommand drives one engine entry point on generated workloads.

pub mod commands;
pub mod output;

pub use output::Output;
