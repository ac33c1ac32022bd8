//! Sharding Module
//!
//! Storage and query layers for a road graph split over a grid of cells:
//! - SQLite-backed shard files, one per populated cell
//! - On-demand cell loading with a byte-budgeted LRU
//! - A global index of way ownership, significant places and cell sizes
//! - Scoped element views that stitch boundary vertices back together
//!
//! # Architecture
//!
//! ```text
//! VirtualGraph
//! ├── Grid (cells tiling the dataset bounds)
//! │   ├── Cell (lazy ShardGraph slot, per-cell loading lock)
//! │   └── MemoryBudgetCache (LRU eviction by bytes)
//! └── GlobalIndex (way → shard, place R-tree, memory estimates)
//!
//! Storage:
//! ├── cells/<row>_<col>.shard (SQLite shard files)
//! └── index.<dataset> (SQLite index container)
//! ```

pub mod builder;
pub mod cache;
pub mod cell;
pub mod grid;
pub mod index;
pub mod repository;
pub mod schema;
pub mod scoped;
pub mod store;
pub mod virtual_graph;

// Re-exports
pub use builder::{IndexBuildStats, IndexBuilder};
pub use cache::{estimate_memory, CacheMetrics, CellMemory, MemoryBudgetCache};
pub use cell::{Cell, CellCoord, DEFAULT_CELL_MEMORY_BYTES};
pub use grid::{Grid, DEFAULT_BOUNDARY_TOLERANCE_METERS};
pub use index::{
    DatasetMetadata, GlobalIndex, IndexError, IndexSettings, ScopedPlace,
    DEFAULT_PLACE_TOLERANCE_METERS, FIELD_MEMORY_SIZE_BY_CELL, FIELD_PLACES,
    FIELD_WAY_ID_TO_SHARD,
};
pub use repository::{MirrorStats, Repository, RepositoryError, CELLS_DIR};
pub use schema::{INDEX_FORMAT, INDEX_SCHEMA_VERSION, SHARD_SCHEMA_VERSION};
pub use scoped::{Scoped, ScopedEdge, ScopedMember, ScopedRelation, ScopedVertex};
pub use store::{ShardError, ShardStats, ShardStore};
pub use virtual_graph::{VirtualGraph, VirtualGraphStats};
