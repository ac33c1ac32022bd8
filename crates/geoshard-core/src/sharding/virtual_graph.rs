//! Virtual Graph
//!
//! Presents a sharded dataset as one read-only graph. Spatial queries fan out
//! to the cells intersecting the query rectangle; identifier queries use the
//! shard carried by a scoped id, or the global index for bare way
//! identifiers. Counts come from the index metadata.

use crate::error::GraphError;
use crate::geometry::Location;
use crate::graph::{AttributeSet, FunctionalClass, GraphStore, ShardGraph};
use crate::identifier::{EdgeIdentifier, ScopedEdgeId, ScopedRelationId, ScopedVertexId, ShardId, WayIdentifier};
use crate::sharding::cache::CacheMetrics;
use crate::sharding::cell::Cell;
use crate::sharding::grid::Grid;
use crate::sharding::index::{DatasetMetadata, GlobalIndex, IndexSettings, ScopedPlace};
use crate::sharding::repository::Repository;
use crate::sharding::scoped::{Scoped, ScopedEdge, ScopedRelation, ScopedVertex};
use geo::Rect;
use geoshard_config::GeoshardConfig;
use rayon::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read-only composition of a grid and its global index.
pub struct VirtualGraph {
    grid: Arc<Grid>,
    index: Arc<GlobalIndex>,
    /// Worker pool size for bulk loads (0 = one per core)
    threads: usize,
}

impl std::fmt::Debug for VirtualGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualGraph")
            .field("grid", &self.grid)
            .field("index", &self.index)
            .finish()
    }
}

impl VirtualGraph {
    /// Open the dataset described by `config`.
    ///
    /// Mirrors the remote repository first when one is configured, then reads
    /// the index metadata and lays out the grid it describes. Fails without a
    /// partial graph if the index is absent or unreadable.
    pub fn open(config: &GeoshardConfig, workspace_root: &Path) -> Result<Self, GraphError> {
        config.validate()?;

        let repository = Repository::from_config(config, workspace_root);
        if let Some(remote) = config.remote_repository(workspace_root) {
            repository.mirror_from(&remote)?;
        }

        let settings = IndexSettings {
            min_place_population: config.stitching.min_place_population,
            place_tolerance_meters: config.stitching.place_tolerance_meters,
        };
        let index = Arc::new(GlobalIndex::load(&repository.index_path(), settings)?);
        let metadata = index.metadata();

        if (metadata.cell_size_degrees - config.dataset.cell_size_degrees).abs() > f64::EPSILON {
            warn!(
                "Configured cell size {} differs from the index ({}); using the index value",
                config.dataset.cell_size_degrees, metadata.cell_size_degrees
            );
        }

        let mut grid = Grid::open(
            metadata.cell_size_degrees,
            metadata.bounds(),
            &repository.cells_dir(),
            &metadata.populated_shards,
        )?
        .with_boundary_tolerance(config.stitching.boundary_tolerance_meters)
        .with_index(Arc::clone(&index));
        grid = grid.with_memory_budget(config.loading.memory_budget_bytes().unwrap_or(usize::MAX));

        info!(
            "Opened dataset {}: {} cells ({} populated)",
            metadata.name,
            grid.len(),
            metadata.populated_shards.len()
        );

        Ok(Self {
            grid: Arc::new(grid),
            index,
            threads: config.loading.threads,
        })
    }

    /// Compose an already built grid and index.
    pub fn from_parts(grid: Arc<Grid>, index: Arc<GlobalIndex>) -> Self {
        Self {
            grid,
            index,
            threads: 0,
        }
    }

    /// Worker pool size for `load_all`; 0 uses one thread per core.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    pub fn index(&self) -> &Arc<GlobalIndex> {
        &self.index
    }

    pub fn metadata(&self) -> DatasetMetadata {
        self.index.metadata()
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.grid.bounds()
    }

    // =========================================================================
    // Cell access
    // =========================================================================

    fn loaded(&self, cell: &Arc<Cell>) -> Result<Arc<ShardGraph>, GraphError> {
        self.grid.sub_graph(cell)
    }

    fn scope<T>(&self, cell: &Arc<Cell>, graph: &Arc<ShardGraph>, value: T) -> Scoped<T> {
        Scoped::new(Arc::clone(&self.grid), Arc::clone(cell), Arc::clone(graph), value)
    }

    /// Populated cells intersecting `rect`, each with its sub-graph.
    fn graphs_intersecting(&self, rect: &Rect<f64>) -> Result<Vec<(Arc<Cell>, Arc<ShardGraph>)>, GraphError> {
        let mut graphs = Vec::new();
        for cell in self.grid.cells_intersecting(rect) {
            if !cell.is_populated() {
                continue;
            }
            let graph = self.loaded(&cell)?;
            graphs.push((cell, graph));
        }
        Ok(graphs)
    }

    /// Every populated cell with its sub-graph, by shard id.
    fn all_graphs(&self) -> Result<Vec<(Arc<Cell>, Arc<ShardGraph>)>, GraphError> {
        let mut graphs = Vec::new();
        for cell in self.grid.cells().iter().filter(|c| c.is_populated()) {
            graphs.push((Arc::clone(cell), self.loaded(cell)?));
        }
        Ok(graphs)
    }

    fn populated_cell(&self, shard_id: ShardId) -> Option<&Arc<Cell>> {
        self.grid.cell(shard_id).filter(|c| c.is_populated())
    }

    // =========================================================================
    // Edges
    // =========================================================================

    /// Every traversal in the dataset, reverse traversals included.
    pub fn edges(&self) -> Result<Vec<ScopedEdge>, GraphError> {
        let mut edges = Vec::new();
        for (cell, graph) in self.all_graphs()? {
            edges.extend(graph.edges().map(|e| self.scope(&cell, &graph, e)));
        }
        Ok(edges)
    }

    pub fn forward_edges(&self) -> Result<Vec<ScopedEdge>, GraphError> {
        let mut edges = Vec::new();
        for (cell, graph) in self.all_graphs()? {
            edges.extend(
                graph
                    .forward_edges()
                    .map(|e| self.scope(&cell, &graph, e.clone())),
            );
        }
        Ok(edges)
    }

    pub fn edge(&self, id: ScopedEdgeId) -> Result<Option<ScopedEdge>, GraphError> {
        let Some(cell) = self.populated_cell(id.shard_id()) else {
            return Ok(None);
        };
        let graph = self.loaded(cell)?;
        Ok(graph.edge(id.local_id()).map(|e| self.scope(cell, &graph, e)))
    }

    /// Edge by its dataset-wide identifier.
    ///
    /// Looks in the shard the index records for the way first, and walks the
    /// way into neighboring cells only when that shard lacks the section.
    pub fn edge_for_identifier(&self, identifier: EdgeIdentifier) -> Result<Option<ScopedEdge>, GraphError> {
        let Some(start) = self.index.shard_for_way(identifier.way())? else {
            return Ok(None);
        };
        if let Some(cell) = self.populated_cell(start) {
            let graph = self.loaded(cell)?;
            if graph.edge_for_identifier(identifier.forward()).is_some() {
                return Ok(graph
                    .edge_for_identifier(identifier)
                    .map(|e| self.scope(cell, &graph, e)));
            }
        }

        let forward = identifier.forward();
        let stored = self
            .edges_for_way(identifier.way())?
            .into_iter()
            .find(|e| e.value().identifier == forward);
        Ok(stored.and_then(|edge| {
            if identifier.is_forward() {
                Some(edge)
            } else {
                edge.reversed()
            }
        }))
    }

    /// Every shard-local fragment of `way`, ordered by shard id then section.
    ///
    /// Starts at the shard recorded in the index and follows the way across
    /// clipped endpoints into neighboring cells.
    pub fn edges_for_way(&self, way: WayIdentifier) -> Result<Vec<ScopedEdge>, GraphError> {
        let Some(start) = self.index.shard_for_way(way)? else {
            return Ok(Vec::new());
        };

        let mut visited: HashSet<ShardId> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut fragments: Vec<(ShardId, Vec<ScopedEdge>)> = Vec::new();

        while let Some(shard_id) = queue.pop_front() {
            let Some(cell) = self.populated_cell(shard_id) else {
                continue;
            };
            let graph = self.loaded(cell)?;
            let route: Vec<ScopedEdge> = graph
                .edges_for_way(way)
                .into_iter()
                .map(|e| self.scope(cell, &graph, e.clone()))
                .collect();

            let mut crossings = Vec::new();
            for edge in &route {
                for vertex in [edge.from_vertex(), edge.to_vertex()].into_iter().flatten() {
                    if vertex.is_boundary() {
                        crossings.push(vertex.value().location);
                    }
                }
            }
            for location in crossings {
                for next in self.grid.neighbors(&location, self.grid.boundary_tolerance_meters()) {
                    let next_id = next.shard_id();
                    if !next.is_populated() || !visited.insert(next_id) {
                        continue;
                    }
                    if self.loaded(&next)?.contains_way(way) {
                        queue.push_back(next_id);
                    }
                }
            }

            fragments.push((shard_id, route));
        }

        fragments.sort_by_key(|(shard_id, _)| *shard_id);
        debug!("Way {} spans {} shards", way, fragments.len());
        Ok(fragments.into_iter().flat_map(|(_, route)| route).collect())
    }

    /// Forward edges whose geometry intersects `rect`.
    pub fn edges_intersecting(&self, rect: &Rect<f64>) -> Result<Vec<ScopedEdge>, GraphError> {
        let mut edges = Vec::new();
        for (cell, graph) in self.graphs_intersecting(rect)? {
            edges.extend(
                graph
                    .edges_intersecting(rect)
                    .into_iter()
                    .map(|e| self.scope(&cell, &graph, e.clone())),
            );
        }
        Ok(edges)
    }

    // =========================================================================
    // Vertices
    // =========================================================================

    pub fn vertex(&self, id: ScopedVertexId) -> Result<Option<ScopedVertex>, GraphError> {
        let Some(cell) = self.populated_cell(id.shard_id()) else {
            return Ok(None);
        };
        let graph = self.loaded(cell)?;
        Ok(graph
            .vertex(id.local_id())
            .map(|v| self.scope(cell, &graph, v.clone())))
    }

    /// Vertices inside `rect`. Boundary vertices appear once per shard that
    /// stores them.
    pub fn vertexes_inside(&self, rect: &Rect<f64>) -> Result<Vec<ScopedVertex>, GraphError> {
        let mut vertices = Vec::new();
        for (cell, graph) in self.graphs_intersecting(rect)? {
            vertices.extend(
                graph
                    .vertexes_inside(rect)
                    .into_iter()
                    .map(|v| self.scope(&cell, &graph, v.clone())),
            );
        }
        Ok(vertices)
    }

    /// Nearest vertex within `max_distance_m` of `location`, optionally only
    /// vertices touching an edge of at least `min_class`. Ties go to the lower
    /// scoped id.
    pub fn vertex_nearest(
        &self,
        location: &Location,
        max_distance_m: f64,
        min_class: Option<FunctionalClass>,
    ) -> Result<Option<ScopedVertex>, GraphError> {
        let mut best: Option<(f64, ScopedVertex)> = None;
        for (cell, graph) in self.graphs_intersecting(&location.within(max_distance_m))? {
            let Some((vertex, distance)) = graph.vertex_nearest(location, max_distance_m, min_class) else {
                continue;
            };
            let candidate = self.scope(&cell, &graph, vertex.clone());
            let better = match &best {
                None => true,
                Some((d, current)) => distance
                    .total_cmp(d)
                    .then(candidate.id().cmp(&current.id()))
                    .is_lt(),
            };
            if better {
                best = Some((distance, candidate));
            }
        }
        Ok(best.map(|(_, vertex)| vertex))
    }

    // =========================================================================
    // Relations and places
    // =========================================================================

    pub fn relations(&self) -> Result<Vec<ScopedRelation>, GraphError> {
        let mut relations = Vec::new();
        for (cell, graph) in self.all_graphs()? {
            relations.extend(graph.relations().map(|r| self.scope(&cell, &graph, r.clone())));
        }
        Ok(relations)
    }

    pub fn relation(&self, id: ScopedRelationId) -> Result<Option<ScopedRelation>, GraphError> {
        let Some(cell) = self.populated_cell(id.shard_id()) else {
            return Ok(None);
        };
        let graph = self.loaded(cell)?;
        Ok(graph
            .relation(id.local_id())
            .map(|r| self.scope(cell, &graph, r.clone())))
    }

    /// Significant places inside `rect`, from the global index.
    pub fn places_inside(&self, rect: &Rect<f64>) -> Result<Vec<ScopedPlace>, GraphError> {
        Ok(self.index.places_inside(rect)?)
    }

    pub fn place_at(&self, location: &Location) -> Result<Option<ScopedPlace>, GraphError> {
        Ok(self.index.place_at(location)?)
    }

    // =========================================================================
    // Counts
    // =========================================================================

    pub fn vertex_count(&self) -> u64 {
        self.index.metadata().vertex_count
    }

    pub fn edge_count(&self) -> u64 {
        self.index.metadata().edge_count
    }

    pub fn forward_edge_count(&self) -> u64 {
        self.index.metadata().forward_edge_count
    }

    pub fn relation_count(&self) -> u64 {
        self.index.metadata().relation_count
    }

    pub fn place_count(&self) -> u64 {
        self.index.metadata().place_count
    }

    // =========================================================================
    // Bulk loading
    // =========================================================================

    /// Load every populated cell and build all of its spatial indexes.
    pub fn load_all(&self) -> Result<usize, GraphError> {
        self.load_all_except(AttributeSet::empty())
    }

    /// Load every populated cell, building the attributes not in `except`.
    ///
    /// One task per cell on a bounded pool. All tasks finish before the first
    /// failure, if any, is returned.
    pub fn load_all_except(&self, except: AttributeSet) -> Result<usize, GraphError> {
        let cells: Vec<&Arc<Cell>> = self.grid.cells().iter().filter(|c| c.is_populated()).collect();
        info!("Loading {} cells", cells.len());
        let start = std::time::Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| GraphError::WorkerPool(e.to_string()))?;

        let results: Vec<Result<(), GraphError>> = pool.install(|| {
            cells
                .par_iter()
                .map(|cell| -> Result<(), GraphError> {
                    let graph = self.loaded(cell)?;
                    graph.load_all(except);
                    Ok(())
                })
                .collect()
        });

        let mut first_error = None;
        let mut failed = 0;
        for result in results {
            if let Err(e) = result {
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            warn!("{} of {} cells failed to load", failed, cells.len());
            return Err(e);
        }

        info!(
            "Loaded {} cells in {:.2}s",
            cells.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(cells.len())
    }

    /// Unload every cell, keeping the grid and index.
    pub fn unload_cells(&self) {
        self.grid.unload_all();
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.grid.cache().metrics()
    }

    pub fn stats(&self) -> VirtualGraphStats {
        let cache = self.grid.cache();
        let metrics = cache.metrics();
        VirtualGraphStats {
            total_cells: self.grid.len(),
            populated_cells: self.grid.cells().iter().filter(|c| c.is_populated()).count(),
            loaded_cells: self.grid.loaded_cells().len(),
            memory_usage_bytes: cache.current_memory_bytes(),
            memory_budget_bytes: cache.max_memory_bytes(),
            cache_hit_rate: metrics.hit_rate(),
            cache_evictions: metrics.evictions,
        }
    }
}

/// The virtual graph is read-only.
impl GraphStore for VirtualGraph {
    fn save(&self, _path: &Path) -> Result<(), GraphError> {
        Err(GraphError::unsupported("save"))
    }

    fn unload(&mut self) -> Result<(), GraphError> {
        Err(GraphError::unsupported("unload"))
    }

    fn load_archive(&mut self, _path: &Path) -> Result<(), GraphError> {
        Err(GraphError::unsupported("load_archive"))
    }
}

/// Statistics about the virtual graph state
#[derive(Debug, Clone)]
pub struct VirtualGraphStats {
    /// Cells in the grid
    pub total_cells: usize,
    /// Cells with persisted data
    pub populated_cells: usize,
    /// Cells whose sub-graph is in memory
    pub loaded_cells: usize,
    /// Current memory usage in bytes
    pub memory_usage_bytes: usize,
    /// Memory budget in bytes
    pub memory_budget_bytes: usize,
    /// Cache hit rate (0.0 - 1.0)
    pub cache_hit_rate: f64,
    /// Number of cells evicted
    pub cache_evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rect_from_locations;
    use crate::graph::{Edge, Vertex};
    use crate::sharding::builder::IndexBuilder;
    use crate::sharding::cell::CellCoord;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn loc(lat: f64, lon: f64) -> Location {
        Location::from_degrees(lat, lon)
    }

    /// 1 x 3 strip; way 5 runs through all three cells.
    fn strip(dir: &Path) -> VirtualGraph {
        let bounds = rect_from_locations(loc(0.0, 0.0), loc(0.5, 1.5));
        let layout = Grid::build(0.5, bounds).unwrap();
        for col in 0..3u32 {
            let cell = layout.cell(ShardId(col)).unwrap();
            let west = loc(0.25, col as f64 * 0.5);
            let east = loc(0.25, (col + 1) as f64 * 0.5);
            let mut graph = ShardGraph::new(cell.shard_id(), cell.bounds());
            let mut a = Vertex::new(1, west);
            if col > 0 {
                a = a.clipped();
            }
            let mut b = Vertex::new(2, east);
            if col < 2 {
                b = b.clipped();
            }
            graph.add_vertex(a);
            graph.add_vertex(b);
            graph.add_edge(
                Edge::new(1, EdgeIdentifier::new(WayIdentifier(5), col), 1, 2)
                    .reversible()
                    .with_functional_class(FunctionalClass::MajorArterial),
            );
            graph.save(&dir.join(CellCoord::new(0, col).file_name())).unwrap();
        }

        let grid = Grid::build_in(0.5, bounds, dir).unwrap();
        let (index, _) = IndexBuilder::new(IndexSettings::default()).build(&grid, "strip").unwrap();
        let index = Arc::new(index);
        let grid = grid.with_index(Arc::clone(&index));
        VirtualGraph::from_parts(Arc::new(grid), index)
    }

    #[test]
    fn test_edge_for_identifier_follows_way_across_shards() {
        let temp_dir = TempDir::new().unwrap();
        let graph = strip(temp_dir.path());

        let fragments = graph.edges_for_way(WayIdentifier(5)).unwrap();
        let shards: Vec<ShardId> = fragments.iter().map(|e| e.shard_id()).collect();
        assert_eq!(shards, vec![ShardId(0), ShardId(1), ShardId(2)]);

        let last = graph
            .edge_for_identifier(EdgeIdentifier::new(WayIdentifier(5), 2))
            .unwrap()
            .unwrap();
        assert_eq!(last.shard_id(), ShardId(2));

        let reverse = graph
            .edge_for_identifier(EdgeIdentifier::new(WayIdentifier(5), 1).reversed())
            .unwrap()
            .unwrap();
        assert_eq!(reverse.id(), ScopedEdgeId::make(ShardId(1), -1));

        assert!(graph.edge_for_identifier(EdgeIdentifier::new(WayIdentifier(6), 0)).unwrap().is_none());
    }

    #[test]
    fn test_counts_come_from_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let graph = strip(temp_dir.path());

        // Four distinct vertices: two ends plus two shared boundary points
        assert_eq!(graph.vertex_count(), 4);
        assert_eq!(graph.forward_edge_count(), 3);
        assert_eq!(graph.edge_count(), 6);
        assert_eq!(graph.relation_count(), 0);
        assert_eq!(graph.edges().unwrap().len(), 6);
    }

    #[test]
    fn test_vertex_nearest_across_cells() {
        let temp_dir = TempDir::new().unwrap();
        let graph = strip(temp_dir.path());

        let nearest = graph
            .vertex_nearest(&loc(0.25, 0.5001), 100.0, None)
            .unwrap()
            .unwrap();
        assert_eq!(nearest.value().location, loc(0.25, 0.5));
        // Equal distance in shards 0 and 1: lowest scoped id wins
        assert_eq!(nearest.shard_id(), ShardId(0));

        assert!(graph
            .vertex_nearest(&loc(0.25, 0.25), 10.0, None)
            .unwrap()
            .is_none());
        assert!(graph
            .vertex_nearest(&loc(0.25, 0.5), 10.0, Some(FunctionalClass::Freeway))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mutation_is_unsupported() {
        let temp_dir = TempDir::new().unwrap();
        let mut graph = strip(temp_dir.path());

        assert!(matches!(
            graph.save(&temp_dir.path().join("copy")),
            Err(GraphError::UnsupportedOperation { operation: "save" })
        ));
        assert!(matches!(graph.unload(), Err(GraphError::UnsupportedOperation { .. })));
        assert!(matches!(
            graph.load_archive(temp_dir.path()),
            Err(GraphError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_load_all_materializes_every_cell() {
        let temp_dir = TempDir::new().unwrap();
        let graph = strip(temp_dir.path()).with_threads(2);

        assert_eq!(graph.load_all().unwrap(), 3);
        let stats = graph.stats();
        assert_eq!(stats.loaded_cells, 3);
        assert_eq!(stats.populated_cells, 3);

        graph.unload_cells();
        assert_eq!(graph.stats().loaded_cells, 0);
    }
}
