//! Global index build pass.
//!
//! Walks every cell with a shard file on a bounded rayon pool, feeds each
//! sub-graph to `GlobalIndex::build_entry`, then derives the dataset counts
//! and writes the index container.

use crate::error::GraphError;
use crate::geometry::Location;
use crate::graph::{GradeSeparation, ShardGraph};
use crate::identifier::ShardId;
use crate::sharding::cell::Cell;
use crate::sharding::grid::Grid;
use crate::sharding::index::{DatasetMetadata, GlobalIndex, IndexSettings};
use crate::sharding::store::ShardStore;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Statistics from an index build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBuildStats {
    /// Cells whose shard file was read
    pub shards_indexed: usize,
    /// Distinct ways mapped to an owning shard
    pub ways: usize,
    /// Places above the population threshold
    pub places: usize,
    /// Vertices with boundary copies counted once
    pub vertices: u64,
    pub edges: u64,
}

/// Per-shard contribution to the dataset counts.
struct ShardTally {
    shard_id: ShardId,
    vertices: u64,
    boundary_vertices: Vec<(Location, GradeSeparation)>,
    edges: u64,
    forward_edges: u64,
    relations: u64,
}

impl ShardTally {
    fn of(graph: &ShardGraph) -> Self {
        let mut vertices = 0;
        let mut boundary_vertices = Vec::new();
        for vertex in graph.vertices() {
            // Same equivalence rule as scoped vertices
            if vertex.clipped || vertex.synthetic {
                boundary_vertices.push((vertex.location, vertex.grade));
            } else {
                vertices += 1;
            }
        }
        Self {
            shard_id: graph.shard_id(),
            vertices,
            boundary_vertices,
            edges: graph.edge_count() as u64,
            forward_edges: graph.forward_edge_count() as u64,
            relations: graph.relation_count() as u64,
        }
    }
}

/// Builds the global index of a grid.
pub struct IndexBuilder {
    settings: IndexSettings,
    threads: usize,
}

impl IndexBuilder {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            threads: 0,
        }
    }

    /// Worker pool size; 0 uses one thread per core.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Build the index of every cell in `grid` that has a shard file.
    pub fn build(
        &self,
        grid: &Grid,
        dataset_name: &str,
    ) -> Result<(GlobalIndex, IndexBuildStats), GraphError> {
        let mut metadata =
            DatasetMetadata::new(dataset_name, grid.bounds(), grid.cell_size_degrees());
        metadata.min_place_population = self.settings.min_place_population;
        let index = GlobalIndex::create(metadata.clone(), self.settings.clone());

        let cells: Vec<&Arc<Cell>> = grid
            .cells()
            .iter()
            .filter(|c| c.has_persisted_data())
            .collect();
        info!("Indexing {} shards of {}", cells.len(), dataset_name);
        let start = std::time::Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| GraphError::WorkerPool(e.to_string()))?;

        // Every task runs to completion; the first failure is reported afterwards
        let results: Vec<Result<ShardTally, GraphError>> = pool.install(|| {
            cells
                .par_iter()
                .map(|cell| Self::index_cell(&index, cell))
                .collect()
        });

        let mut tallies = Vec::with_capacity(results.len());
        for result in results {
            tallies.push(result?);
        }

        let mut boundary: HashSet<(Location, GradeSeparation)> = HashSet::new();
        for tally in &tallies {
            metadata.vertex_count += tally.vertices;
            metadata.edge_count += tally.edges;
            metadata.forward_edge_count += tally.forward_edges;
            metadata.relation_count += tally.relations;
            boundary.extend(tally.boundary_vertices.iter().copied());
        }
        metadata.vertex_count += boundary.len() as u64;
        metadata.place_count = index.place_count()? as u64;

        let mut populated: Vec<ShardId> = tallies.iter().map(|t| t.shard_id).collect();
        populated.sort();
        metadata.populated_shards = populated;

        index.set_metadata(metadata.clone());

        let stats = IndexBuildStats {
            shards_indexed: tallies.len(),
            ways: index.way_count()?,
            places: metadata.place_count as usize,
            vertices: metadata.vertex_count,
            edges: metadata.edge_count,
        };

        info!(
            "Indexed {} shards in {:.2}s: {} ways, {} places",
            stats.shards_indexed,
            start.elapsed().as_secs_f64(),
            stats.ways,
            stats.places
        );

        Ok((index, stats))
    }

    /// Build the index and write it to `path`.
    pub fn build_and_save(
        &self,
        grid: &Grid,
        dataset_name: &str,
        path: &Path,
    ) -> Result<IndexBuildStats, GraphError> {
        let (index, stats) = self.build(grid, dataset_name)?;
        index.save(path, &index.metadata())?;
        Ok(stats)
    }

    fn index_cell(index: &GlobalIndex, cell: &Cell) -> Result<ShardTally, GraphError> {
        let shard_id = cell.shard_id();
        let path = cell
            .path()
            .ok_or_else(|| GraphError::InvalidGrid(format!("cell {} has no storage", shard_id)))?;

        // Read directly; the build pass must not pin every sub-graph in memory
        let graph = ShardStore::open(path, shard_id)
            .and_then(|store| store.read_graph())
            .map_err(|e| GraphError::shard_load(shard_id, e))?;

        index.build_entry(cell, &graph)?;
        index.record_memory_size(cell.coord(), graph.estimated_memory() as u64)?;

        debug!(
            "Indexed shard {} ({} vertices, {} edges)",
            shard_id,
            graph.vertex_count(),
            graph.edge_count()
        );
        Ok(ShardTally::of(&graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rect_from_locations;
    use crate::graph::{Edge, GraphStore, Place, Vertex};
    use crate::identifier::{EdgeIdentifier, WayIdentifier};
    use crate::sharding::cell::CellCoord;
    use crate::sharding::store::ShardError;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn loc(lat: f64, lon: f64) -> Location {
        Location::from_degrees(lat, lon)
    }

    /// 1 x 2 grid; way 42 crosses the boundary at longitude 0.5.
    fn write_dataset(dir: &Path) -> Grid {
        let bounds = rect_from_locations(loc(0.0, 0.0), loc(0.5, 1.0));
        let layout = Grid::build(0.5, bounds).unwrap();
        let border = loc(0.25, 0.5);

        let mut west = ShardGraph::new(ShardId(0), layout.cell(ShardId(0)).unwrap().bounds());
        west.add_vertex(Vertex::new(1, loc(0.25, 0.25)));
        west.add_vertex(Vertex::new(2, border).clipped());
        west.add_edge(Edge::new(1, EdgeIdentifier::new(WayIdentifier(42), 0), 1, 2).reversible());
        west.add_place(Place {
            local_id: 1,
            name: "Westville".to_string(),
            location: loc(0.2, 0.2),
            population: 75_000,
        });
        west.save(&dir.join(CellCoord::new(0, 0).file_name())).unwrap();

        let mut east = ShardGraph::new(ShardId(1), layout.cell(ShardId(1)).unwrap().bounds());
        east.add_vertex(Vertex::new(1, border).clipped());
        east.add_vertex(Vertex::new(2, loc(0.25, 0.75)));
        east.add_edge(Edge::new(7, EdgeIdentifier::new(WayIdentifier(42), 1), 1, 2));
        east.add_place(Place {
            local_id: 1,
            name: "Easton".to_string(),
            location: loc(0.3, 0.8),
            population: 900,
        });
        east.save(&dir.join(CellCoord::new(0, 1).file_name())).unwrap();

        Grid::build_in(0.5, bounds, dir).unwrap()
    }

    #[test]
    fn test_build_counts_boundary_vertices_once() {
        let temp_dir = TempDir::new().unwrap();
        let grid = write_dataset(temp_dir.path());

        let (index, stats) = IndexBuilder::new(IndexSettings::default())
            .with_threads(2)
            .build(&grid, "strip")
            .unwrap();

        assert_eq!(stats.shards_indexed, 2);
        assert_eq!(stats.ways, 1);
        assert_eq!(stats.places, 1);

        let metadata = index.metadata();
        assert_eq!(metadata.vertex_count, 3);
        assert_eq!(metadata.forward_edge_count, 2);
        assert_eq!(metadata.edge_count, 3);
        assert_eq!(metadata.populated_shards, vec![ShardId(0), ShardId(1)]);
        assert_eq!(index.shard_for_way(WayIdentifier(42)).unwrap(), Some(ShardId(0)));
        assert!(index.memory_size(CellCoord::new(0, 1)).unwrap().is_some());
    }

    #[test]
    fn test_build_counts_shared_synthetic_vertex_once() {
        let temp_dir = TempDir::new().unwrap();
        let bounds = rect_from_locations(loc(0.0, 0.0), loc(0.5, 1.0));
        let layout = Grid::build(0.5, bounds).unwrap();
        let junction = loc(0.25, 0.5);

        for (id, interior) in [(0, loc(0.25, 0.25)), (1, loc(0.25, 0.75))] {
            let cell = layout.cell(ShardId(id)).unwrap();
            let mut graph = ShardGraph::new(cell.shard_id(), cell.bounds());
            graph.add_vertex(Vertex::new(1, interior));
            graph.add_vertex(Vertex::new(2, junction).synthetic());
            graph.add_edge(Edge::new(1, EdgeIdentifier::new(WayIdentifier(60 + id as u64), 0), 1, 2));
            graph.save(&temp_dir.path().join(cell.coord().file_name())).unwrap();
        }
        let grid = Grid::build_in(0.5, bounds, temp_dir.path()).unwrap();

        let (_, stats) = IndexBuilder::new(IndexSettings::default())
            .build(&grid, "strip")
            .unwrap();

        // Two interior vertices plus the junction both shards carry
        assert_eq!(stats.vertices, 3);
    }

    #[test]
    fn test_build_and_save_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let grid = write_dataset(temp_dir.path());
        let path = temp_dir.path().join("index.strip");

        IndexBuilder::new(IndexSettings::default())
            .build_and_save(&grid, "strip", &path)
            .unwrap();

        let loaded = GlobalIndex::load(&path, IndexSettings::default()).unwrap();
        assert_eq!(loaded.metadata().name, "strip");
        assert_eq!(loaded.metadata().place_count, 1);
        assert_eq!(loaded.places().unwrap()[0].place.name, "Westville");
    }

    #[test]
    fn test_build_reports_corrupt_shard() {
        let temp_dir = TempDir::new().unwrap();
        let grid = write_dataset(temp_dir.path());
        std::fs::write(temp_dir.path().join("0_1.shard"), b"garbage").unwrap();

        let result = IndexBuilder::new(IndexSettings::default()).build(&grid, "strip");
        match result {
            Err(GraphError::ShardLoad { shard, source }) => {
                assert_eq!(shard, ShardId(1));
                assert!(!matches!(source, ShardError::Missing { .. }));
            }
            other => panic!("expected shard load error, got {:?}", other.map(|(_, s)| s)),
        }
    }
}
