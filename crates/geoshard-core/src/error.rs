//! Top-level error type for graph operations.

use crate::identifier::ShardId;
use crate::sharding::index::IndexError;
use crate::sharding::repository::RepositoryError;
use crate::sharding::store::ShardError;
use geoshard_config::ConfigError;
use thiserror::Error;

/// Errors surfaced by `ShardGraph`, `Grid` and `VirtualGraph` operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// One cell's shard file is missing, corrupt or unreadable. Other cells
    /// remain usable.
    #[error("failed to load shard {shard}: {source}")]
    ShardLoad {
        shard: ShardId,
        #[source]
        source: ShardError,
    },

    #[error("shard store error: {0}")]
    Shard(#[from] ShardError),

    #[error("global index error: {0}")]
    Index(#[from] IndexError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    /// Mutating entry point called on a read-only composition.
    #[error("unsupported operation on virtual graph: {operation}")]
    UnsupportedOperation { operation: &'static str },

    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

impl GraphError {
    /// Create a new ShardLoad error.
    pub fn shard_load(shard: ShardId, source: ShardError) -> Self {
        Self::ShardLoad { shard, source }
    }

    /// Create a new UnsupportedOperation error.
    pub fn unsupported(operation: &'static str) -> Self {
        Self::UnsupportedOperation { operation }
    }

    /// Whether this error is scoped to a single shard.
    pub fn is_shard_scoped(&self) -> bool {
        matches!(self, Self::ShardLoad { .. })
    }
}
