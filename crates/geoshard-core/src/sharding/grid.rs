//! The cell grid.
//!
//! A regular lattice of `cell_size_degrees` cells laid over the dataset
//! bounds, with row-major shard ids. The last row and column are clipped to
//! the dataset bounds so the cells tile it exactly.
//!
//! Point ownership is half-open: each cell owns `[min, max)` on both axes,
//! except along the dataset's outer maximum edges, which are closed.

use crate::error::GraphError;
use crate::geometry::{Location, RectExt};
use crate::graph::ShardGraph;
use crate::identifier::{ShardId, MAX_SHARD_ID};
use crate::sharding::cache::{CellMemory, MemoryBudgetCache};
use crate::sharding::cell::{Cell, CellCoord};
use crate::sharding::index::GlobalIndex;
use geo::{coord, Rect};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default distance within which boundary vertices are considered for
/// stitching.
pub const DEFAULT_BOUNDARY_TOLERANCE_METERS: f64 = 1.0;

/// Owns every cell of a dataset.
pub struct Grid {
    bounds: Rect<f64>,
    cell_size_degrees: f64,
    rows: u32,
    cols: u32,

    /// Indexed by shard id
    cells: Vec<Arc<Cell>>,

    boundary_tolerance_meters: f64,
    cache: MemoryBudgetCache,
    index: Option<Arc<GlobalIndex>>,
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("cell_size_degrees", &self.cell_size_degrees)
            .finish()
    }
}

impl Grid {
    /// Build a grid whose cells have no storage (all cells empty).
    pub fn build(cell_size_degrees: f64, dataset_bounds: Rect<f64>) -> Result<Self, GraphError> {
        Self::layout(cell_size_degrees, dataset_bounds, |_| (None, false))
    }

    /// Build a grid over shard files in `cells_dir`.
    ///
    /// A cell is populated when its shard file exists at build time.
    pub fn build_in(
        cell_size_degrees: f64,
        dataset_bounds: Rect<f64>,
        cells_dir: &Path,
    ) -> Result<Self, GraphError> {
        Self::layout(cell_size_degrees, dataset_bounds, |coord| {
            let path = cells_dir.join(coord.file_name());
            let populated = path.exists();
            (Some(path), populated)
        })
    }

    /// Build a grid over `cells_dir` where exactly `populated` cells have data.
    pub fn open(
        cell_size_degrees: f64,
        dataset_bounds: Rect<f64>,
        cells_dir: &Path,
        populated: &[ShardId],
    ) -> Result<Self, GraphError> {
        let populated: HashSet<ShardId> = populated.iter().copied().collect();
        let cols = Self::divisions(dataset_bounds.width(), cell_size_degrees);
        Self::layout(cell_size_degrees, dataset_bounds, |coord| {
            let shard_id = ShardId(coord.row * cols + coord.col);
            (
                Some(cells_dir.join(coord.file_name())),
                populated.contains(&shard_id),
            )
        })
    }

    fn divisions(extent: f64, cell_size: f64) -> u32 {
        // Tolerate extents that are an exact multiple up to float noise
        ((extent / cell_size) - 1e-9).ceil().max(1.0) as u32
    }

    fn layout(
        cell_size_degrees: f64,
        bounds: Rect<f64>,
        storage: impl Fn(CellCoord) -> (Option<PathBuf>, bool),
    ) -> Result<Self, GraphError> {
        if !(cell_size_degrees.is_finite() && cell_size_degrees > 0.0) {
            return Err(GraphError::InvalidGrid(format!(
                "cell size must be positive, got {}",
                cell_size_degrees
            )));
        }
        let finite = [bounds.min().x, bounds.min().y, bounds.max().x, bounds.max().y]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(GraphError::InvalidGrid(
                "dataset bounds must be finite".to_string(),
            ));
        }

        let rows = Self::divisions(bounds.height(), cell_size_degrees);
        let cols = Self::divisions(bounds.width(), cell_size_degrees);
        if rows as u64 * cols as u64 > MAX_SHARD_ID as u64 {
            return Err(GraphError::InvalidGrid(format!(
                "{} x {} cells exceeds the shard id space",
                rows, cols
            )));
        }

        let mut cells = Vec::with_capacity((rows * cols) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let coord = CellCoord::new(row, col);
                let shard_id = ShardId(row * cols + col);
                let min_x = bounds.min().x + col as f64 * cell_size_degrees;
                let min_y = bounds.min().y + row as f64 * cell_size_degrees;
                let max_x = if col + 1 == cols {
                    bounds.max().x
                } else {
                    bounds.min().x + (col + 1) as f64 * cell_size_degrees
                };
                let max_y = if row + 1 == rows {
                    bounds.max().y
                } else {
                    bounds.min().y + (row + 1) as f64 * cell_size_degrees
                };
                let cell_bounds = Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y });

                let (path, populated) = storage(coord);
                let mut cell = Cell::new(shard_id, coord, cell_bounds, path, populated);
                cell.set_neighbors(Self::adjacent(row, col, rows, cols));
                cells.push(Arc::new(cell));
            }
        }

        debug!(rows, cols, cell_size_degrees, "Built grid");

        Ok(Self {
            bounds,
            cell_size_degrees,
            rows,
            cols,
            cells,
            boundary_tolerance_meters: DEFAULT_BOUNDARY_TOLERANCE_METERS,
            cache: MemoryBudgetCache::with_default_budget(),
            index: None,
        })
    }

    fn adjacent(row: u32, col: u32, rows: u32, cols: u32) -> Vec<ShardId> {
        let mut neighbors = Vec::with_capacity(8);
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let (r, c) = (row as i64 + dr, col as i64 + dc);
                if r >= 0 && c >= 0 && r < rows as i64 && c < cols as i64 {
                    neighbors.push(ShardId((r * cols as i64 + c) as u32));
                }
            }
        }
        neighbors
    }

    /// Set the memory budget for loaded cells.
    pub fn with_memory_budget(mut self, max_memory_bytes: usize) -> Self {
        self.cache = MemoryBudgetCache::new(max_memory_bytes);
        self
    }

    pub fn with_boundary_tolerance(mut self, meters: f64) -> Self {
        self.boundary_tolerance_meters = meters.max(0.0);
        self
    }

    /// Attach the global index used for memory estimates.
    pub fn with_index(mut self, index: Arc<GlobalIndex>) -> Self {
        self.index = Some(index);
        self
    }

    // ------------------------------------------------------------------------
    // Shape
    // ------------------------------------------------------------------------

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    pub fn cell_size_degrees(&self) -> f64 {
        self.cell_size_degrees
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn boundary_tolerance_meters(&self) -> f64 {
        self.boundary_tolerance_meters
    }

    pub fn index(&self) -> Option<&Arc<GlobalIndex>> {
        self.index.as_ref()
    }

    pub fn cells(&self) -> &[Arc<Cell>] {
        &self.cells
    }

    pub fn cell(&self, shard_id: ShardId) -> Option<&Arc<Cell>> {
        self.cells.get(shard_id.0 as usize)
    }

    pub fn cell_at(&self, coord: CellCoord) -> Option<&Arc<Cell>> {
        if coord.row >= self.rows || coord.col >= self.cols {
            return None;
        }
        self.cells.get((coord.row * self.cols + coord.col) as usize)
    }

    // ------------------------------------------------------------------------
    // Spatial resolution
    // ------------------------------------------------------------------------

    /// Row or column index for a coordinate already known to be in range.
    fn lattice_index(value: f64, origin: f64, size: f64, count: u32) -> u32 {
        let raw = ((value - origin) / size).floor();
        raw.clamp(0.0, (count - 1) as f64) as u32
    }

    /// The single cell owning `location`, `None` outside the dataset.
    pub fn cell_for(&self, location: &Location) -> Option<&Arc<Cell>> {
        if !self.bounds.contains_location(location) {
            return None;
        }
        let (x, y) = (location.longitude(), location.latitude());
        let mut row = Self::lattice_index(y, self.bounds.min().y, self.cell_size_degrees, self.rows);
        let mut col = Self::lattice_index(x, self.bounds.min().x, self.cell_size_degrees, self.cols);

        // Settle float noise against the actual cell bounds
        while row > 0 && y < self.row_min(row) {
            row -= 1;
        }
        while row + 1 < self.rows && y >= self.row_min(row + 1) {
            row += 1;
        }
        while col > 0 && x < self.col_min(col) {
            col -= 1;
        }
        while col + 1 < self.cols && x >= self.col_min(col + 1) {
            col += 1;
        }

        self.cell_at(CellCoord::new(row, col))
    }

    fn row_min(&self, row: u32) -> f64 {
        self.bounds.min().y + row as f64 * self.cell_size_degrees
    }

    fn col_min(&self, col: u32) -> f64 {
        self.bounds.min().x + col as f64 * self.cell_size_degrees
    }

    /// Every cell whose (closed) bounds intersect `rect`, by shard id.
    pub fn cells_intersecting(&self, rect: &Rect<f64>) -> Vec<Arc<Cell>> {
        let (min, max) = (rect.min(), rect.max());
        if max.x < self.bounds.min().x
            || min.x > self.bounds.max().x
            || max.y < self.bounds.min().y
            || min.y > self.bounds.max().y
        {
            return Vec::new();
        }

        let size = self.cell_size_degrees;
        let row_lo = Self::lattice_index(min.y, self.bounds.min().y, size, self.rows).saturating_sub(1);
        let row_hi = (Self::lattice_index(max.y, self.bounds.min().y, size, self.rows) + 1).min(self.rows - 1);
        let col_lo = Self::lattice_index(min.x, self.bounds.min().x, size, self.cols).saturating_sub(1);
        let col_hi = (Self::lattice_index(max.x, self.bounds.min().x, size, self.cols) + 1).min(self.cols - 1);

        let mut found = Vec::new();
        for row in row_lo..=row_hi {
            for col in col_lo..=col_hi {
                if let Some(cell) = self.cell_at(CellCoord::new(row, col)) {
                    let b = cell.bounds();
                    if b.min().x <= max.x && b.max().x >= min.x && b.min().y <= max.y && b.max().y >= min.y {
                        found.push(Arc::clone(cell));
                    }
                }
            }
        }
        found
    }

    /// The cell containing `location` plus every cell within `radius_meters`.
    pub fn neighbors(&self, location: &Location, radius_meters: f64) -> Vec<Arc<Cell>> {
        self.cells_intersecting(&location.within(radius_meters))
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Sub-graph of `cell`, loading it under the memory budget.
    ///
    /// Least recently used cells are unloaded first when the estimated size
    /// of `cell` would exceed the budget.
    pub fn sub_graph(&self, cell: &Cell) -> Result<Arc<ShardGraph>, GraphError> {
        let shard_id = cell.shard_id();
        let hit = self.cache.touch(shard_id);

        if !hit && !cell.is_loaded() {
            let estimate = cell.estimated_memory_size(self.index.as_deref()) as usize;
            let needed = self.cache.memory_needed_for(estimate);
            if needed > 0 {
                for candidate in self.cache.get_eviction_candidates_for(needed) {
                    if candidate == shard_id {
                        continue;
                    }
                    if let Some(evicted) = self.cell(candidate) {
                        evicted.unload();
                    }
                    self.cache.remove(candidate);
                    debug!(shard = %candidate, "Evicted shard to stay within memory budget");
                }
            }
        }

        let (graph, fresh) = cell.load()?;
        if fresh || !hit {
            let memory = match cell.indexed_memory_size(self.index.as_deref()) {
                Some(bytes) => CellMemory::from_bytes(bytes as usize),
                None => CellMemory::new(graph.vertex_count(), graph.forward_edge_count()),
            };
            self.cache.record_loaded(shard_id, memory);
        }
        Ok(graph)
    }

    /// Shard ids of cells whose sub-graph is in memory.
    pub fn loaded_cells(&self) -> Vec<ShardId> {
        self.cells
            .iter()
            .filter(|c| c.is_loaded())
            .map(|c| c.shard_id())
            .collect()
    }

    /// Unload every cell.
    pub fn unload_all(&self) {
        for cell in &self.cells {
            if cell.unload() {
                self.cache.remove(cell.shard_id());
            }
        }
    }

    pub fn cache(&self) -> &MemoryBudgetCache {
        &self.cache
    }
}
