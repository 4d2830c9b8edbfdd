use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::parallel::pool::calculate_workers;

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

const ENV_PREFIX: &str = "PARWORK_";

/// Engine tuning knobs shared by every entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrently active workers (0 = auto)
    pub worker_limit: usize,
    /// Percentage of CPU cores used when deriving the worker count
    pub thread_percentage: u8,
    pub partitions_per_worker: usize,
    /// Tree depth cutoff (0 = auto)
    pub max_depth: usize,
    /// Outstanding spawned tree tasks (0 = 4 x workers)
    pub fanout_budget: usize,
    pub progress_update_frequency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_limit: 0,
            thread_percentage: 100,
            partitions_per_worker: 4,
            max_depth: 0,
            fanout_budget: 0,
            progress_update_frequency: 5,
        }
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fanout_budget: Option<usize>,
}

impl EngineConfig {
    /// Load the layered configuration
    pub fn load(custom_config: Option<&str>, overrides: Option<ConfigOverrides>) -> Result<Self> {
        let figment = Self::figment(custom_config, ENV_PREFIX, overrides);
        let config: EngineConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        tracing::trace!("CONFIG LOAD: {:?}", config);
        Ok(config)
    }

    fn figment(custom_config: Option<&str>, env_prefix: &str, overrides: Option<ConfigOverrides>) -> Figment {
        let user = Self::user_config_base_path();
        let mut figment = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG)) // 1. Defaults (lowest)
            .merge(Toml::file(format!("{user}.toml"))) // 2. User config
            .merge(Json::file(format!("{user}.json")))
            .merge(Yaml::file(format!("{user}.yaml")))
            .merge(Toml::file("parwork.toml")) // 3. Repo config
            .merge(Json::file("parwork.json"))
            .merge(Yaml::file("parwork.yaml"));

        // 4. Custom config, format picked by extension
        if let Some(path) = custom_config {
            figment = if path.ends_with(".json") {
                figment.merge(Json::file(path))
            } else if path.ends_with(".yaml") || path.ends_with(".yml") {
                figment.merge(Yaml::file(path))
            } else {
                figment.merge(Toml::file(path))
            };
        }

        figment = figment.merge(Env::prefixed(env_prefix)); // 5. Environment

        if let Some(overrides) = overrides {
            tracing::trace!("CONFIG LOAD: Applying CLI overrides");
            figment = figment.merge(Serialized::defaults(overrides)); // 6. CLI (highest)
        }
        figment
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.thread_percentage) {
            bail!("thread_percentage must be between 1 and 100, got {}", self.thread_percentage);
        }
        if self.partitions_per_worker == 0 {
            bail!("partitions_per_worker must be at least 1");
        }
        if self.progress_update_frequency == 0 {
            bail!("progress_update_frequency must be at least 1");
        }
        Ok(())
    }

    /// Worker count after applying the CPU percentage and the limit
    pub fn resolved_workers(&self) -> usize {
        calculate_workers(self.worker_limit, self.thread_percentage)
    }

    pub fn resolved_fanout_budget(&self) -> usize {
        if self.fanout_budget > 0 {
            self.fanout_budget
        } else {
            self.resolved_workers() * 4
        }
    }

    /// The merged configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    fn user_config_base_path() -> String {
        match std::env::var("HOME") {
            Ok(home) => format!("{home}/.config/parwork/config"),
            Err(_) => "~/.config/parwork/config".to_string(),
        }
    }
}
