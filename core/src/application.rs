//! Initialization and wiring
//!
//! Builds an [`Application`] from configuration: loads [`Config`], opens the
//! settings store, registers operations and starts the worker pool.
//!
//! # Example
//!
//! ```ignore
//! use sous_core::application::InitBuilder;
//!
//! let app = InitBuilder::new()
//!     .config_path("sous.toml")
//!     .init()
//!     .await?;
//! let id = app.pool().submit(&Recipe::from_text("trim | uppercase")?, " hi ".into())?;
//! app.shutdown().await;
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::pool::PoolController;
use crate::registry::{OperationDescriptor, OperationRegistry};
use crate::settings::{PoolSettings, SettingsStore, TomlSettingsStore};

/// A running engine: configuration plus the pool built from it
pub struct Application {
    pub config: Config,
    pool: PoolController,
}

impl Application {
    /// Wire an already loaded config to a registry and settings store
    pub fn new(
        config: Config,
        registry: OperationRegistry,
        store: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let pool = PoolController::with_store(registry, store, config.pool)
            .context("Failed to start worker pool")?;
        Ok(Self { config, pool })
    }

    pub fn pool(&self) -> &PoolController {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drain the pool: running requests finish, queued ones are cancelled
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Options for initializing the engine
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    /// Settings file path (overrides config file and env vars)
    pub settings_path: Option<PathBuf>,

    /// Default pool settings (overrides config file and env vars)
    pub pool: Option<PoolSettings>,

    /// Skip `SOUS_*` environment variables and `.env`
    pub skip_env: bool,

    /// Operations registered after the built-ins; an id already taken by a
    /// built-in replaces it
    pub operations: Vec<OperationDescriptor>,
}

/// Builder for constructing InitOptions
#[derive(Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.settings_path = Some(path.into());
        self
    }

    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.options.pool = Some(pool);
        self
    }

    pub fn skip_env(mut self, skip: bool) -> Self {
        self.options.skip_env = skip;
        self
    }

    /// Register an extra operation during initialization
    pub fn operation(mut self, descriptor: OperationDescriptor) -> Self {
        self.options.operations.push(descriptor);
        self
    }

    /// Initialize with the configured options
    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Load configuration and start the engine
///
/// Must run inside a Tokio runtime; the pool spawns its workers here.
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .config_path(options.config_path)
        .settings_path(options.settings_path)
        .pool(options.pool)
        .skip_env(options.skip_env)
        .build()?;

    let mut registry = OperationRegistry::with_builtins();
    for descriptor in options.operations {
        let id = descriptor.id.clone();
        registry
            .replace(descriptor)
            .with_context(|| format!("Failed to register operation '{}'", id))?;
    }

    let store = Arc::new(TomlSettingsStore::new(&config.settings_path));
    let app = Application::new(config, registry, store)?;

    let settings = app.pool.settings();
    info!(
        pool_size = settings.pool_size,
        max_queue_length = settings.max_queue_length,
        settings_path = %app.config.settings_path.display(),
        operations = app.pool.registry().len(),
        "Engine initialized"
    );

    Ok(app)
}
