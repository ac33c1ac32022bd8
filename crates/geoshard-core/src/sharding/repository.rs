//! On-disk dataset layout and remote mirroring.
//!
//! ```text
//! <root>/
//! ├── cells/<row>_<col>.shard   (one SQLite file per populated cell)
//! └── index.<dataset>           (global index container)
//! ```

use crate::sharding::cell::CellCoord;
use geoshard_config::GeoshardConfig;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Directory holding the shard files
pub const CELLS_DIR: &str = "cells";

/// Errors that can occur while preparing a repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk remote repository: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("remote repository not found: {}", path.display())]
    RemoteMissing { path: PathBuf },
}

impl RepositoryError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of a mirror pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: usize,
    pub up_to_date: usize,
}

/// A local dataset directory.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    dataset: String,
}

impl Repository {
    pub fn new(root: impl Into<PathBuf>, dataset: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dataset: dataset.into(),
        }
    }

    /// Repository described by `config`, relative paths resolved against
    /// `workspace_root`.
    pub fn from_config(config: &GeoshardConfig, workspace_root: &Path) -> Self {
        Self::new(
            config.local_repository(workspace_root),
            config.dataset.name.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn cells_dir(&self) -> PathBuf {
        self.root.join(CELLS_DIR)
    }

    pub fn cell_path(&self, coord: CellCoord) -> PathBuf {
        self.cells_dir().join(coord.file_name())
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(format!("index.{}", self.dataset))
    }

    /// Create the directory layout if missing.
    pub fn ensure_layout(&self) -> Result<(), RepositoryError> {
        let cells = self.cells_dir();
        std::fs::create_dir_all(&cells).map_err(|e| RepositoryError::io(cells, e))
    }

    /// Copy files from `remote` that are missing locally or differ in size or
    /// modification time.
    pub fn mirror_from(&self, remote: &Path) -> Result<MirrorStats, RepositoryError> {
        if !remote.is_dir() {
            return Err(RepositoryError::RemoteMissing {
                path: remote.to_path_buf(),
            });
        }
        self.ensure_layout()?;

        let mut stats = MirrorStats::default();
        for entry in WalkDir::new(remote).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(remote)
                .unwrap_or_else(|_| entry.path());
            let target = self.root.join(relative);

            let source_meta = entry.metadata()?;
            if Self::is_current(&target, source_meta.len(), source_meta.modified().ok()) {
                stats.up_to_date += 1;
                continue;
            }

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RepositoryError::io(parent, e))?;
            }
            Self::replace_file(entry.path(), &target, source_meta.modified().ok())?;
            debug!("Mirrored {}", relative.display());
            stats.copied += 1;
        }

        info!(
            "Mirrored {} from {}: {} copied, {} up to date",
            self.dataset,
            remote.display(),
            stats.copied,
            stats.up_to_date
        );
        Ok(stats)
    }

    /// Copy `source` next to `target` and rename it into place, so readers of
    /// `target` never observe a partially written file.
    fn replace_file(
        source: &Path,
        target: &Path,
        modified: Option<SystemTime>,
    ) -> Result<(), RepositoryError> {
        let staging = Self::staging_path(target);
        let result = Self::stage_copy(source, &staging, modified)
            .and_then(|()| std::fs::rename(&staging, target));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&staging);
            return Err(RepositoryError::io(target, e));
        }
        Ok(())
    }

    fn stage_copy(
        source: &Path,
        staging: &Path,
        modified: Option<SystemTime>,
    ) -> std::io::Result<()> {
        std::fs::copy(source, staging)?;
        if let Some(modified) = modified {
            // Keep mtimes aligned so the next pass can skip this file
            let file = std::fs::File::options().write(true).open(staging)?;
            file.set_modified(modified)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn staging_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{}.partial", name))
    }

    fn is_current(target: &Path, len: u64, modified: Option<SystemTime>) -> bool {
        let Ok(meta) = std::fs::metadata(target) else {
            return false;
        };
        meta.len() == len && meta.modified().ok() == modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let repo = Repository::new("/data/roads", "europe");
        assert_eq!(repo.cells_dir(), PathBuf::from("/data/roads/cells"));
        assert_eq!(
            repo.cell_path(CellCoord::new(3, 12)),
            PathBuf::from("/data/roads/cells/3_12.shard")
        );
        assert_eq!(repo.index_path(), PathBuf::from("/data/roads/index.europe"));
    }

    #[test]
    fn test_from_config_resolves_relative_root() {
        let mut config = GeoshardConfig::default();
        config.dataset.name = "alps".to_string();
        let repo = Repository::from_config(&config, Path::new("/work"));
        assert_eq!(repo.root(), Path::new("/work/.geoshard/data"));
        assert_eq!(repo.index_path(), PathBuf::from("/work/.geoshard/data/index.alps"));
    }

    #[test]
    fn test_mirror_copies_missing_and_skips_current() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("cells")).unwrap();
        std::fs::write(remote.path().join("cells/0_0.shard"), b"shard zero").unwrap();
        std::fs::write(remote.path().join("index.test"), b"index").unwrap();

        let repo = Repository::new(local.path(), "test");
        let first = repo.mirror_from(remote.path()).unwrap();
        assert_eq!(first, MirrorStats { copied: 2, up_to_date: 0 });
        assert_eq!(
            std::fs::read(local.path().join("cells/0_0.shard")).unwrap(),
            b"shard zero"
        );

        let second = repo.mirror_from(remote.path()).unwrap();
        assert_eq!(second, MirrorStats { copied: 0, up_to_date: 2 });
    }

    #[test]
    fn test_mirror_recopies_changed_file() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::write(remote.path().join("index.test"), b"v1").unwrap();

        let repo = Repository::new(local.path(), "test");
        repo.mirror_from(remote.path()).unwrap();

        std::fs::write(remote.path().join("index.test"), b"version two").unwrap();
        let stats = repo.mirror_from(remote.path()).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(
            std::fs::read(local.path().join("index.test")).unwrap(),
            b"version two"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_mirror_replaces_file_without_rewriting_open_copy() {
        use std::io::Read;

        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::write(remote.path().join("index.test"), b"v1").unwrap();

        let repo = Repository::new(local.path(), "test");
        repo.mirror_from(remote.path()).unwrap();
        let mut reader = std::fs::File::open(local.path().join("index.test")).unwrap();

        std::fs::write(remote.path().join("index.test"), b"version two").unwrap();
        repo.mirror_from(remote.path()).unwrap();

        // A reader opened before the pass keeps the complete old file
        let mut old = String::new();
        reader.read_to_string(&mut old).unwrap();
        assert_eq!(old, "v1");
        assert_eq!(
            std::fs::read(local.path().join("index.test")).unwrap(),
            b"version two"
        );
        assert!(!local.path().join(".index.test.partial").exists());

        let third = repo.mirror_from(remote.path()).unwrap();
        assert_eq!(third, MirrorStats { copied: 0, up_to_date: 1 });
    }

    #[test]
    fn test_mirror_missing_remote() {
        let local = TempDir::new().unwrap();
        let repo = Repository::new(local.path(), "test");
        let result = repo.mirror_from(&local.path().join("nowhere"));
        assert!(matches!(result, Err(RepositoryError::RemoteMissing { .. })));
    }
}
