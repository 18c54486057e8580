//! Process configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `sous.toml` in the working directory, or the file named by
//!    `SOUS_CONFIG_PATH`
//! 3. Environment variables with the `SOUS_` prefix, `__` for nesting
//!    (`SOUS_POOL__POOL_SIZE=8`, `SOUS_LOG__FILTER=debug`)
//! 4. Explicit overrides passed to [`ConfigBuilder`]
//!
//! A `.env` file is loaded into the environment first when present.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::settings::{PoolSettings, DEFAULT_MAX_QUEUE_LENGTH, DEFAULT_POOL_SIZE};

const DEFAULT_CONFIG_FILE: &str = "sous.toml";
const DEFAULT_SETTINGS_FILE: &str = "sous-settings.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// Pool settings used when nothing has been persisted yet
    pub pool: PoolSettings,

    /// Where pool settings are persisted
    pub settings_path: PathBuf,

    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directives; `RUST_LOG` wins when set
    pub filter: String,
}

impl Config {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    pool: Option<PoolSettings>,
    skip_env: bool,
}

impl ConfigBuilder {
    /// Config file to read (overrides `SOUS_CONFIG_PATH` and the default search)
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Settings file location (overrides files and environment)
    pub fn settings_path(mut self, path: Option<PathBuf>) -> Self {
        self.settings_path = path;
        self
    }

    /// Default pool settings (overrides files and environment)
    pub fn pool(mut self, pool: Option<PoolSettings>) -> Self {
        self.pool = pool;
        self
    }

    /// Ignore `SOUS_*` environment variables and `.env`
    pub fn skip_env(mut self, skip: bool) -> Self {
        self.skip_env = skip;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !self.skip_env {
            dotenvy::dotenv().ok();
        }

        let env_path = if self.skip_env {
            None
        } else {
            std::env::var_os("SOUS_CONFIG_PATH").map(PathBuf::from)
        };

        let mut builder = config::Config::builder()
            .set_default("pool.pool_size", DEFAULT_POOL_SIZE as u64)?
            .set_default("pool.max_queue_length", DEFAULT_MAX_QUEUE_LENGTH as u64)?
            .set_default("settings_path", DEFAULT_SETTINGS_FILE)?
            .set_default("log.filter", "info")?;

        // An explicitly named file must exist; the default one is optional
        builder = match self.config_path.or(env_path) {
            Some(path) => builder.add_source(config::File::from(path.clone()).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix("SOUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(path) = self.settings_path {
            config.settings_path = path;
        }
        if let Some(pool) = self.pool {
            config.pool = pool;
        }

        config
            .pool
            .validate()
            .context("Invalid [pool] configuration")?;

        Ok(config)
    }
}
