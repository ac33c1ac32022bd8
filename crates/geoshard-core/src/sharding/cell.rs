//! Grid cells.
//!
//! A `Cell` is one shard: fixed bounds and identity, plus a lazily populated
//! slot for its persisted sub-graph. Loads are serialized per cell with
//! double-checked locking so concurrent callers trigger a single file read.

use crate::error::GraphError;
use crate::graph::ShardGraph;
use crate::identifier::ShardId;
use crate::sharding::index::GlobalIndex;
use crate::sharding::store::{ShardError, ShardStore};
use geo::Rect;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Memory assumed for a cell with neither an index estimate nor a file.
pub const DEFAULT_CELL_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

/// Row/column position of a cell in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub row: u32,
    pub col: u32,
}

impl CellCoord {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// File name of this cell's shard inside the cells directory.
    pub fn file_name(&self) -> String {
        format!("{}_{}.shard", self.row, self.col)
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.row, self.col)
    }
}

/// One shard of the grid.
pub struct Cell {
    shard_id: ShardId,
    coord: CellCoord,
    bounds: Rect<f64>,
    neighbor_shard_ids: Vec<ShardId>,

    /// Shard file, `None` for cells without storage
    path: Option<PathBuf>,

    /// Whether the dataset has data for this cell; a missing file is then an error
    populated: bool,

    graph: RwLock<Option<Arc<ShardGraph>>>,
    loading_lock: Mutex<()>,
    load_count: AtomicUsize,
    file_size: OnceCell<Option<u64>>,
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("shard_id", &self.shard_id)
            .field("coord", &self.coord)
            .field("populated", &self.populated)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Cell {
    pub(crate) fn new(
        shard_id: ShardId,
        coord: CellCoord,
        bounds: Rect<f64>,
        path: Option<PathBuf>,
        populated: bool,
    ) -> Self {
        Self {
            shard_id,
            coord,
            bounds,
            neighbor_shard_ids: Vec::new(),
            path,
            populated,
            graph: RwLock::new(None),
            loading_lock: Mutex::new(()),
            load_count: AtomicUsize::new(0),
            file_size: OnceCell::new(),
        }
    }

    pub(crate) fn set_neighbors(&mut self, mut neighbors: Vec<ShardId>) {
        neighbors.sort();
        neighbors.dedup();
        self.neighbor_shard_ids = neighbors;
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn coord(&self) -> CellCoord {
        self.coord
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    /// Shard ids of adjacent cells (edges and corners), sorted.
    pub fn neighbor_shard_ids(&self) -> &[ShardId] {
        &self.neighbor_shard_ids
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Whether a shard file currently exists for this cell.
    pub fn has_persisted_data(&self) -> bool {
        self.path.as_deref().is_some_and(Path::exists)
    }

    /// Size of the shard file in bytes, read once.
    pub fn file_size(&self) -> Option<u64> {
        *self.file_size.get_or_init(|| {
            self.path
                .as_deref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
        })
    }

    /// Expected in-memory size: index estimate, else twice the file size,
    /// else `DEFAULT_CELL_MEMORY_BYTES`.
    pub fn estimated_memory_size(&self, index: Option<&GlobalIndex>) -> u64 {
        self.indexed_memory_size(index).unwrap_or_else(|| {
            self.file_size()
                .map(|size| size * 2)
                .unwrap_or(DEFAULT_CELL_MEMORY_BYTES)
        })
    }

    /// Memory size recorded for this cell by the global index.
    pub fn indexed_memory_size(&self, index: Option<&GlobalIndex>) -> Option<u64> {
        match index?.memory_size(self.coord) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(shard = %self.shard_id, error = %e, "Unreadable memory estimate, falling back to file size");
                None
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.graph.read().is_some()
    }

    /// Number of times the shard file has been read.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::Relaxed)
    }

    /// The loaded sub-graph, if any, without triggering a load.
    pub fn loaded_graph(&self) -> Option<Arc<ShardGraph>> {
        self.graph.read().clone()
    }

    /// The cell's sub-graph, loading it on first access.
    pub fn sub_graph(&self) -> Result<Arc<ShardGraph>, GraphError> {
        self.load().map(|(graph, _)| graph)
    }

    /// Load the sub-graph; the flag is true when this call performed the load.
    pub(crate) fn load(&self) -> Result<(Arc<ShardGraph>, bool), GraphError> {
        // First check without the loading lock
        if let Some(graph) = self.loaded_graph() {
            return Ok((graph, false));
        }

        let _guard = self.loading_lock.lock();

        // Second check: another thread may have finished loading
        if let Some(graph) = self.loaded_graph() {
            return Ok((graph, false));
        }

        let graph = Arc::new(self.read_graph()?);
        *self.graph.write() = Some(Arc::clone(&graph));
        Ok((graph, true))
    }

    fn read_graph(&self) -> Result<ShardGraph, GraphError> {
        let Some(path) = self.path.as_deref().filter(|p| p.exists()) else {
            if self.populated {
                let path = self.path.clone().unwrap_or_default();
                return Err(GraphError::shard_load(
                    self.shard_id,
                    ShardError::Missing { path },
                ));
            }
            return Ok(ShardGraph::new(self.shard_id, self.bounds));
        };

        debug!(shard = %self.shard_id, path = %path.display(), "Loading shard");
        self.load_count.fetch_add(1, Ordering::Relaxed);

        let graph = ShardStore::open(path, self.shard_id)
            .and_then(|store| store.read_graph())
            .map_err(|e| GraphError::shard_load(self.shard_id, e))?;

        debug!(
            shard = %self.shard_id,
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            "Loaded shard"
        );
        Ok(graph)
    }

    /// Drop the loaded sub-graph. Returns whether one was loaded.
    pub fn unload(&self) -> bool {
        let _guard = self.loading_lock.lock();
        let unloaded = self.graph.write().take().is_some();
        if unloaded {
            debug!(shard = %self.shard_id, "Unloaded shard");
        }
        unloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{rect_from_locations, Location};
    use crate::graph::{GraphStore, Vertex};
    use tempfile::TempDir;

    fn bounds() -> Rect<f64> {
        rect_from_locations(
            Location::from_degrees(0.0, 0.0),
            Location::from_degrees(1.0, 1.0),
        )
    }

    fn write_shard(path: &Path, shard_id: ShardId) {
        let mut graph = ShardGraph::new(shard_id, bounds());
        graph.add_vertex(Vertex::new(1, Location::from_degrees(0.5, 0.5)));
        graph.save(path).unwrap();
    }

    #[test]
    fn test_lazy_load_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0_0.shard");
        write_shard(&path, ShardId(0));

        let cell = Cell::new(ShardId(0), CellCoord::new(0, 0), bounds(), Some(path), true);
        assert!(!cell.is_loaded());

        let first = cell.sub_graph().unwrap();
        let second = cell.sub_graph().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cell.load_count(), 1);
        assert_eq!(first.vertex_count(), 1);
    }

    #[test]
    fn test_concurrent_loads_read_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0_0.shard");
        write_shard(&path, ShardId(0));

        let cell = Arc::new(Cell::new(
            ShardId(0),
            CellCoord::new(0, 0),
            bounds(),
            Some(path),
            true,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || cell.sub_graph().unwrap())
            })
            .collect();
        let graphs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(cell.load_count(), 1);
        assert!(graphs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_unload_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0_0.shard");
        write_shard(&path, ShardId(0));

        let cell = Cell::new(ShardId(0), CellCoord::new(0, 0), bounds(), Some(path), true);
        cell.sub_graph().unwrap();
        assert!(cell.unload());
        assert!(!cell.unload());
        cell.sub_graph().unwrap();
        assert_eq!(cell.load_count(), 2);
    }

    #[test]
    fn test_missing_file_on_populated_cell_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0_3.shard");

        let cell = Cell::new(ShardId(3), CellCoord::new(0, 3), bounds(), Some(path), true);
        let err = cell.sub_graph().unwrap_err();
        assert!(matches!(
            err,
            GraphError::ShardLoad {
                shard: ShardId(3),
                source: ShardError::Missing { .. }
            }
        ));
        assert!(!cell.is_loaded());
    }

    #[test]
    fn test_unpopulated_cell_is_empty() {
        let cell = Cell::new(ShardId(5), CellCoord::new(1, 1), bounds(), None, false);
        let graph = cell.sub_graph().unwrap();
        assert_eq!(graph.vertex_count(), 0);
        assert_eq!(cell.load_count(), 0);
        assert!(!cell.has_persisted_data());
    }

    #[test]
    fn test_estimated_memory_size_fallbacks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0_0.shard");
        write_shard(&path, ShardId(0));

        let cell = Cell::new(
            ShardId(0),
            CellCoord::new(0, 0),
            bounds(),
            Some(path.clone()),
            true,
        );
        let size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(cell.estimated_memory_size(None), size * 2);

        let empty = Cell::new(ShardId(1), CellCoord::new(0, 1), bounds(), None, false);
        assert_eq!(
            empty.estimated_memory_size(None),
            DEFAULT_CELL_MEMORY_BYTES
        );
    }
}
