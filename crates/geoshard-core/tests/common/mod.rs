//! Common test utilities for integration tests.
//!
//! Builds small sharded datasets inside a temporary workspace: shard files
//! laid out on a grid, plus the global index over them.

#![allow(dead_code)]

use std::path::Path;

use geo::Rect;
use tempfile::TempDir;

use geoshard_config::GeoshardConfig;
use geoshard_core::sharding::{IndexBuildStats, IndexBuilder, IndexSettings, Repository};
use geoshard_core::{
    rect_from_locations, Edge, EdgeIdentifier, FunctionalClass, GraphStore, Grid, Location, Place,
    ShardGraph, ShardId, Vertex, VirtualGraph, WayIdentifier,
};

pub const DATASET: &str = "fixture";

pub fn loc(lat: f64, lon: f64) -> Location {
    Location::from_degrees(lat, lon)
}

/// A dataset under construction in a temporary workspace.
pub struct TestDataset {
    temp_dir: TempDir,
    cell_size: f64,
    bounds: Rect<f64>,
    layout: Grid,
}

impl TestDataset {
    /// Empty dataset of `rows` x `cols` cells anchored at (0, 0).
    pub fn new(rows: u32, cols: u32, cell_size: f64) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let bounds = rect_from_locations(
            loc(0.0, 0.0),
            loc(rows as f64 * cell_size, cols as f64 * cell_size),
        );
        let layout = Grid::build(cell_size, bounds).expect("Failed to lay out grid");
        let dataset = Self {
            temp_dir,
            cell_size,
            bounds,
            layout,
        };
        dataset
            .repository()
            .ensure_layout()
            .expect("Failed to create repository");
        dataset
    }

    pub fn workspace(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    pub fn config(&self) -> GeoshardConfig {
        let mut config = GeoshardConfig::default();
        config.dataset.name = DATASET.to_string();
        config.dataset.cell_size_degrees = self.cell_size;
        config
    }

    pub fn repository(&self) -> Repository {
        Repository::from_config(&self.config(), self.workspace())
    }

    /// Empty sub-graph covering the cell of `shard`.
    pub fn shard(&self, shard: u32) -> ShardGraph {
        let cell = self.layout.cell(ShardId(shard)).expect("No such shard");
        ShardGraph::new(cell.shard_id(), cell.bounds())
    }

    /// Persist `graph` as its cell's shard file.
    pub fn write(&self, graph: &ShardGraph) {
        let cell = self
            .layout
            .cell(graph.shard_id())
            .expect("Graph shard outside grid");
        graph
            .save(&self.repository().cell_path(cell.coord()))
            .expect("Failed to write shard");
    }

    /// Overwrite a shard file with bytes that are not a shard.
    pub fn corrupt(&self, shard: u32) {
        let cell = self.layout.cell(ShardId(shard)).expect("No such shard");
        std::fs::write(
            self.repository().cell_path(cell.coord()),
            b"not a shard file",
        )
        .expect("Failed to corrupt shard");
    }

    /// Build the global index over the shard files written so far.
    pub fn build_index(&self) -> IndexBuildStats {
        let repository = self.repository();
        let grid = Grid::build_in(self.cell_size, self.bounds, &repository.cells_dir())
            .expect("Failed to lay out grid");
        IndexBuilder::new(IndexSettings::default())
            .build_and_save(&grid, DATASET, &repository.index_path())
            .expect("Failed to build index")
    }

    /// Open the dataset through its workspace configuration.
    pub fn open(&self) -> VirtualGraph {
        VirtualGraph::open(&self.config(), self.workspace()).expect("Failed to open dataset")
    }
}

/// Single reversible edge of `way` between two vertices of one shard.
pub fn add_segment(
    graph: &mut ShardGraph,
    edge_local: i64,
    way: u64,
    section: u32,
    from: (i64, Location, bool),
    to: (i64, Location, bool),
) {
    for (local_id, location, clipped) in [from, to] {
        if graph.vertex(local_id).is_none() {
            let vertex = Vertex::new(local_id, location);
            graph.add_vertex(if clipped { vertex.clipped() } else { vertex });
        }
    }
    graph.add_edge(
        Edge::new(
            edge_local,
            EdgeIdentifier::new(WayIdentifier(way), section),
            from.0,
            to.0,
        )
        .reversible()
        .with_functional_class(FunctionalClass::Local)
        .with_length(from.1.distance_to(&to.1)),
    );
}

/// Way crossing from shard 0 into shard 1 at longitude 0.5.
pub const CROSSING_WAY: u64 = 20;
/// Way entirely inside shard 1, stored with local edge id 7.
pub const INTERIOR_WAY: u64 = 42;
/// Way entirely inside shard 3.
pub const NORTHEAST_WAY: u64 = 77;

/// 2 x 2 grid of half-degree cells with an indexed road network:
///
/// ```text
///   row 1 | shard 2 (empty)   | shard 3: way 77        |
///   row 0 | shard 0: way 20 --+-- shard 1: way 20, 42 |
/// ```
///
/// Shard 0 also carries a place of population 50,000.
pub fn road_network() -> TestDataset {
    let dataset = TestDataset::new(2, 2, 0.5);
    let crossing = loc(0.25, 0.5);

    let mut sw = dataset.shard(0);
    add_segment(
        &mut sw,
        1,
        CROSSING_WAY,
        0,
        (1, loc(0.25, 0.2), false),
        (2, crossing, true),
    );
    sw.add_place(Place {
        local_id: 1,
        name: "Springfield".to_string(),
        location: loc(0.1, 0.1),
        population: 50_000,
    });
    sw.add_place(Place {
        local_id: 2,
        name: "Shelbyville".to_string(),
        location: loc(0.2, 0.1),
        population: 49_999,
    });
    dataset.write(&sw);

    let mut se = dataset.shard(1);
    add_segment(
        &mut se,
        1,
        CROSSING_WAY,
        1,
        (10, crossing, true),
        (11, loc(0.25, 0.8), false),
    );
    add_segment(
        &mut se,
        7,
        INTERIOR_WAY,
        0,
        (20, loc(0.1, 0.6), false),
        (21, loc(0.1, 0.9), false),
    );
    dataset.write(&se);

    let mut ne = dataset.shard(3);
    add_segment(
        &mut ne,
        1,
        NORTHEAST_WAY,
        0,
        (1, loc(0.6, 0.6), false),
        (2, loc(0.9, 0.9), false),
    );
    dataset.write(&ne);

    dataset.build_index();
    dataset
}
