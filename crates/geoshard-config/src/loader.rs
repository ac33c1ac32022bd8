//! Configuration loader with inheritance support.
//!
//! Loads configuration from multiple sources and merges them:
//! 1. Global config: `~/.geoshard/config.toml`
//! 2. Local config: `.geoshard/config.toml` (in workspace)
//! 3. CLI overrides
//!
//! Later sources override earlier ones.

use crate::error::ConfigError;
use crate::{
    ConfigOverrides, DatasetConfig, GeoshardConfig, LoadingConfig, LoggingConfig,
    RepositoryConfig, StitchingConfig,
};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Global configuration directory name.
const GLOBAL_CONFIG_DIR: &str = ".geoshard";

/// Local configuration directory name.
const LOCAL_CONFIG_DIR: &str = ".geoshard";

/// Configuration loader with caching and inheritance support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Global config directory (e.g., `~/.geoshard`)
    global_config_dir: Option<PathBuf>,

    /// Cached global config
    global_config: Option<GeoshardConfig>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    ///
    /// Automatically detects the global config directory (`~/.geoshard`).
    pub fn new() -> Self {
        let global_config_dir = dirs::home_dir().map(|h| h.join(GLOBAL_CONFIG_DIR));

        Self {
            global_config_dir,
            global_config: None,
        }
    }

    /// Create a loader with a custom global config directory.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: Some(global_dir.into()),
            global_config: None,
        }
    }

    /// Get the global config file path.
    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_config_dir
            .as_ref()
            .map(|d| d.join(CONFIG_FILE_NAME))
    }

    /// Get the local config file path for a workspace.
    pub fn local_config_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(LOCAL_CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load configuration for a workspace with optional CLI overrides.
    ///
    /// Merges config in order: global → local → overrides, then validates
    /// the result.
    pub fn load(
        &mut self,
        workspace_root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<GeoshardConfig, ConfigError> {
        let mut config = GeoshardConfig::default();

        if let Some(global_config) = self.load_global()? {
            config = merge_configs(config, global_config);
        }

        if let Some(local_config) = self.load_local(workspace_root)? {
            config = merge_configs(config, local_config);
        }

        if let Some(ovr) = overrides {
            config.apply_overrides(ovr);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load only the global configuration.
    pub fn load_global(&mut self) -> Result<Option<GeoshardConfig>, ConfigError> {
        if let Some(ref config) = self.global_config {
            return Ok(Some(config.clone()));
        }

        let Some(global_path) = self.global_config_path() else {
            debug!("No home directory found, skipping global config");
            return Ok(None);
        };

        if !global_path.exists() {
            trace!("Global config not found at {:?}", global_path);
            return Ok(None);
        }

        debug!("Loading global config from {:?}", global_path);
        let config = load_config_file(&global_path)?;

        self.global_config = Some(config.clone());

        Ok(Some(config))
    }

    /// Load only the local configuration for a workspace.
    pub fn load_local(
        &self,
        workspace_root: &Path,
    ) -> Result<Option<GeoshardConfig>, ConfigError> {
        let local_path = self.local_config_path(workspace_root);

        if !local_path.exists() {
            trace!("Local config not found at {:?}", local_path);
            return Ok(None);
        }

        debug!("Loading local config from {:?}", local_path);
        load_config_file(&local_path).map(Some)
    }

    /// Save configuration to the local config file for a workspace.
    pub fn save_local(
        &self,
        workspace_root: &Path,
        config: &GeoshardConfig,
    ) -> Result<(), ConfigError> {
        let local_path = self.local_config_path(workspace_root);
        save_config_file(&local_path, config)
    }

    /// Initialize local configuration for a workspace.
    ///
    /// Creates `.geoshard/config.toml` with default configuration unless one
    /// already exists.
    pub fn init_local(&self, workspace_root: &Path) -> Result<PathBuf, ConfigError> {
        let local_dir = workspace_root.join(LOCAL_CONFIG_DIR);

        if !local_dir.exists() {
            std::fs::create_dir_all(&local_dir)
                .map_err(|e| ConfigError::create_dir(&local_dir, e))?;
        }

        let config_path = local_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            save_config_file(&config_path, &GeoshardConfig::default())?;
        }

        Ok(config_path)
    }

    /// Clear cached global configuration.
    pub fn clear_cache(&mut self) {
        self.global_config = None;
    }
}

/// Load a configuration file from disk.
fn load_config_file(path: &Path) -> Result<GeoshardConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;

    toml::from_str(&content).map_err(|e| ConfigError::parse_toml(path, e))
}

/// Save a configuration file to disk.
fn save_config_file(path: &Path, config: &GeoshardConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
}

/// Merge two configurations, with `overlay` taking precedence.
///
/// Values equal to the default are treated as unset, so partial files
/// only override what they mention.
fn merge_configs(base: GeoshardConfig, overlay: GeoshardConfig) -> GeoshardConfig {
    GeoshardConfig {
        dataset: merge_dataset(base.dataset, overlay.dataset),
        repository: merge_repository(base.repository, overlay.repository),
        loading: merge_loading(base.loading, overlay.loading),
        stitching: merge_stitching(base.stitching, overlay.stitching),
        logging: merge_logging(base.logging, overlay.logging),
    }
}

fn merge_dataset(base: DatasetConfig, overlay: DatasetConfig) -> DatasetConfig {
    let default = DatasetConfig::default();
    DatasetConfig {
        name: if overlay.name != default.name {
            overlay.name
        } else {
            base.name
        },
        cell_size_degrees: if overlay.cell_size_degrees != default.cell_size_degrees {
            overlay.cell_size_degrees
        } else {
            base.cell_size_degrees
        },
    }
}

fn merge_repository(base: RepositoryConfig, overlay: RepositoryConfig) -> RepositoryConfig {
    let default = RepositoryConfig::default();
    RepositoryConfig {
        local: if overlay.local != default.local {
            overlay.local
        } else {
            base.local
        },
        remote: overlay.remote.or(base.remote),
    }
}

fn merge_loading(base: LoadingConfig, overlay: LoadingConfig) -> LoadingConfig {
    let default = LoadingConfig::default();
    LoadingConfig {
        threads: if overlay.threads != default.threads {
            overlay.threads
        } else {
            base.threads
        },
        memory_budget_mb: if overlay.memory_budget_mb != default.memory_budget_mb {
            overlay.memory_budget_mb
        } else {
            base.memory_budget_mb
        },
    }
}

fn merge_stitching(base: StitchingConfig, overlay: StitchingConfig) -> StitchingConfig {
    let default = StitchingConfig::default();
    StitchingConfig {
        boundary_tolerance_meters: if overlay.boundary_tolerance_meters
            != default.boundary_tolerance_meters
        {
            overlay.boundary_tolerance_meters
        } else {
            base.boundary_tolerance_meters
        },
        place_tolerance_meters: if overlay.place_tolerance_meters
            != default.place_tolerance_meters
        {
            overlay.place_tolerance_meters
        } else {
            base.place_tolerance_meters
        },
        min_place_population: if overlay.min_place_population != default.min_place_population {
            overlay.min_place_population
        } else {
            base.min_place_population
        },
    }
}

fn merge_logging(base: LoggingConfig, overlay: LoggingConfig) -> LoggingConfig {
    LoggingConfig {
        level: if overlay.level != "info" {
            overlay.level
        } else {
            base.level
        },
        format: overlay.format,
    }
}
