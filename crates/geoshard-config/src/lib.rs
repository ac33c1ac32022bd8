//! Geoshard Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.geoshard/config.toml`
//! - Local config: `.geoshard/config.toml` (in workspace)
//! - CLI overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → CLI overrides.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default angular size of a grid cell, in degrees.
pub const DEFAULT_CELL_SIZE_DEGREES: f64 = 0.5;

/// Default tolerance used to match boundary vertices across cells.
pub const DEFAULT_BOUNDARY_TOLERANCE_METERS: f64 = 1.0;

/// Default population threshold for places copied into the global index.
pub const DEFAULT_MIN_PLACE_POPULATION: u64 = 50_000;

/// Root configuration for Geoshard.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GeoshardConfig {
    /// Dataset identity and partitioning
    pub dataset: DatasetConfig,

    /// Where shard files and the index live
    pub repository: RepositoryConfig,

    /// Lazy and bulk loading
    pub loading: LoadingConfig,

    /// Boundary stitching and place lookup tolerances
    pub stitching: StitchingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Dataset configuration.
///
/// # Example TOML
///
/// ```toml
/// [dataset]
/// name = "north-america"
/// cell_size_degrees = 0.5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Dataset name, used to name the index file (`index.<name>`)
    pub name: String,

    /// Height and width of one grid cell, in degrees
    pub cell_size_degrees: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            cell_size_degrees: DEFAULT_CELL_SIZE_DEGREES,
        }
    }
}

impl DatasetConfig {
    /// Validate dataset settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "dataset.name",
                "dataset name must not be empty",
            ));
        }
        if self.name.contains(['/', '\\']) {
            return Err(ConfigError::invalid_value(
                "dataset.name",
                format!("'{}' must not contain path separators", self.name),
            ));
        }
        if !(self.cell_size_degrees > 0.0 && self.cell_size_degrees <= 180.0) {
            return Err(ConfigError::invalid_value(
                "dataset.cell_size_degrees",
                format!("{} is outside (0, 180]", self.cell_size_degrees),
            ));
        }
        Ok(())
    }
}

/// Repository configuration.
///
/// The local repository holds one file per cell plus the index. When a remote
/// repository is configured, it is mirrored into the local one before loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Local dataset directory (default: `.geoshard/data`)
    pub local: PathBuf,

    /// Optional remote dataset directory mirrored into `local` before load
    pub remote: Option<PathBuf>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            local: PathBuf::from(".geoshard/data"),
            remote: None,
        }
    }
}

/// Loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    /// Worker threads for bulk loading and index builds (0 = auto-detect)
    pub threads: usize,

    /// Memory budget for loaded cells in MB (0 = unbounded)
    pub memory_budget_mb: usize,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            memory_budget_mb: 2048,
        }
    }
}

impl LoadingConfig {
    /// Memory budget in bytes, `None` when unbounded.
    pub fn memory_budget_bytes(&self) -> Option<usize> {
        (self.memory_budget_mb > 0).then(|| self.memory_budget_mb * 1024 * 1024)
    }
}

/// Stitching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchingConfig {
    /// Radius used to find equivalent boundary vertices in neighboring cells
    pub boundary_tolerance_meters: f64,

    /// Radius used by place-at-location lookups
    pub place_tolerance_meters: f64,

    /// Minimum population for a place to be copied into the global index
    pub min_place_population: u64,
}

impl Default for StitchingConfig {
    fn default() -> Self {
        Self {
            boundary_tolerance_meters: DEFAULT_BOUNDARY_TOLERANCE_METERS,
            place_tolerance_meters: DEFAULT_BOUNDARY_TOLERANCE_METERS,
            min_place_population: DEFAULT_MIN_PLACE_POPULATION,
        }
    }
}

impl StitchingConfig {
    /// Validate tolerances.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.boundary_tolerance_meters >= 0.0) {
            return Err(ConfigError::invalid_value(
                "stitching.boundary_tolerance_meters",
                "must be a non-negative number",
            ));
        }
        if !(self.place_tolerance_meters >= 0.0) {
            return Err(ConfigError::invalid_value(
                "stitching.place_tolerance_meters",
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured logging
    Json,
}

/// CLI overrides for configuration values.
///
/// Used to apply command-line arguments over file-based config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override dataset name
    pub dataset: Option<String>,

    /// Override local repository directory
    pub local_repository: Option<PathBuf>,

    /// Override remote repository directory
    pub remote_repository: Option<PathBuf>,

    /// Override log level
    pub log_level: Option<String>,

    /// Override worker threads
    pub threads: Option<usize>,
}

impl GeoshardConfig {
    /// Apply CLI overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref name) = overrides.dataset {
            self.dataset.name = name.clone();
        }

        if let Some(ref dir) = overrides.local_repository {
            self.repository.local = dir.clone();
        }

        if let Some(ref dir) = overrides.remote_repository {
            self.repository.remote = Some(dir.clone());
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }

        if let Some(threads) = overrides.threads {
            self.loading.threads = threads;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dataset.validate()?;
        self.stitching.validate()?;
        Ok(())
    }

    /// Get the effective local repository directory for a workspace.
    pub fn local_repository(&self, workspace_root: &Path) -> PathBuf {
        if self.repository.local.is_absolute() {
            self.repository.local.clone()
        } else {
            workspace_root.join(&self.repository.local)
        }
    }

    /// Get the remote repository to mirror from, if configured.
    pub fn remote_repository(&self, workspace_root: &Path) -> Option<PathBuf> {
        self.repository.remote.as_ref().map(|remote| {
            if remote.is_absolute() {
                remote.clone()
            } else {
                workspace_root.join(remote)
            }
        })
    }

    /// Get the index file path for a workspace.
    pub fn index_path(&self, workspace_root: &Path) -> PathBuf {
        self.local_repository(workspace_root)
            .join(format!("index.{}", self.dataset.name))
    }
}
