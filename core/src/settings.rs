//! Pool settings and their persistence hooks
//!
//! [`PoolSettings`] is the unit of persisted state: read when the pool
//! controller is built, re-applied and saved on every later update. Where
//! it is stored is up to the [`SettingsStore`] implementation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::SettingsError;

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of workers; at least 1
    pub pool_size: usize,
    /// Requests allowed to wait for a worker; 0 means no waiting
    pub max_queue_length: usize,
}

impl PoolSettings {
    pub fn new(pool_size: usize, max_queue_length: usize) -> Result<Self, SettingsError> {
        let settings = Self {
            pool_size,
            max_queue_length,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pool_size == 0 {
            return Err(SettingsError::ZeroPoolSize);
        }
        Ok(())
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

/// Storage medium for [`PoolSettings`]
pub trait SettingsStore: Send + Sync {
    /// Previously saved settings, or `None` if nothing was saved yet
    fn load(&self) -> Result<Option<PoolSettings>>;

    fn save(&self, settings: &PoolSettings) -> Result<()>;
}

/// Settings kept in a TOML file
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Option<PoolSettings>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read settings from {}", self.path.display())
                })
            }
        };

        let settings: PoolSettings = toml::from_str(&text)
            .with_context(|| format!("Invalid settings file {}", self.path.display()))?;
        settings
            .validate()
            .with_context(|| format!("Invalid settings file {}", self.path.display()))?;

        Ok(Some(settings))
    }

    fn save(&self, settings: &PoolSettings) -> Result<()> {
        settings.validate()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let text = toml::to_string_pretty(settings).context("Failed to serialize settings")?;

        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }
}

/// Settings kept in memory, for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    saved: Mutex<Option<PoolSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(settings: PoolSettings) -> Self {
        Self {
            saved: Mutex::new(Some(settings)),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Option<PoolSettings>> {
        let saved = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("Settings store lock poisoned"))?;
        Ok(*saved)
    }

    fn save(&self, settings: &PoolSettings) -> Result<()> {
        settings.validate()?;
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("Settings store lock poisoned"))?;
        *saved = Some(*settings);
        Ok(())
    }
}
