use anyhow::Result;
use clap::{Args, Subcommand};
use parwork::config::EngineConfig;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Display current merged configuration
    Show {
        /// Output format: toml, json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

pub fn execute(args: ConfigArgs, config: &EngineConfig) -> Result<()> {
    match args.command {
        ConfigCommand::Show { format } => {
            let rendered = match format.to_lowercase().as_str() {
                "toml" => config.to_toml()?,
                "json" => serde_json::to_string_pretty(config)?,
                _ => anyhow::bail!("Unsupported format: {}. Use toml or json", format),
            };
            println!("{}", rendered.trim_end());
        }
    }
    Ok(())
}
