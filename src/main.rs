use anyhow::Result;
use clap::Parser;

mod cli;

use cli::commands::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run()
}
