//! Boundary Stitching Tests
//!
//! Checks that the virtual graph behaves like one graph across cell borders:
//! - Boundary copies of a vertex compare equal and share adjacency
//! - Aggregated degrees account for every traversal exactly once
//! - The grid tiles its bounds without gaps or overlaps
//! - Concurrent first access loads a cell once

mod common;

use std::collections::HashSet;

use pretty_assertions::assert_eq;

use common::{loc, road_network, CROSSING_WAY};
use geoshard_core::{
    RoadEdge, RoadVertex, ScopedVertex, ScopedVertexId, ShardId, WayIdentifier,
};

// ============================================================================
// Vertex equivalence
// ============================================================================

#[test]
fn test_boundary_copies_are_one_vertex() {
    let dataset = road_network();
    let graph = dataset.open();

    let west = graph
        .vertex(ScopedVertexId::make(ShardId(0), 2))
        .unwrap()
        .unwrap();
    let east = graph
        .vertex(ScopedVertexId::make(ShardId(1), 10))
        .unwrap()
        .unwrap();

    assert!(west.is_clipped());
    assert_eq!(west, east);
    assert_ne!(west.id(), east.id());

    let ids: Vec<ScopedVertexId> = west.equivalents().unwrap().iter().map(|v| v.id()).collect();
    assert_eq!(
        ids,
        vec![
            ScopedVertexId::make(ShardId(0), 2),
            ScopedVertexId::make(ShardId(1), 10)
        ]
    );
}

#[test]
fn test_boundary_adjacency_matches_from_either_side() {
    let dataset = road_network();
    let graph = dataset.open();

    let west = graph
        .vertex(ScopedVertexId::make(ShardId(0), 2))
        .unwrap()
        .unwrap();
    let east = graph
        .vertex(ScopedVertexId::make(ShardId(1), 10))
        .unwrap()
        .unwrap();

    // Forward section 0 enters, reverse section 0 leaves; section 1 the opposite
    assert_eq!(west.in_degree().unwrap(), 2);
    assert_eq!(west.out_degree().unwrap(), 2);

    let sections = |edges: Vec<geoshard_core::ScopedEdge>| -> HashSet<(u32, bool)> {
        edges
            .iter()
            .map(|e| (e.identifier().section(), e.is_forward()))
            .collect()
    };
    assert_eq!(
        sections(west.out_edges().unwrap()),
        sections(east.out_edges().unwrap())
    );
    assert_eq!(
        sections(west.out_edges().unwrap()),
        HashSet::from([(0, false), (1, true)])
    );
    assert_eq!(
        sections(east.in_edges().unwrap()),
        HashSet::from([(0, true), (1, false)])
    );
}

#[test]
fn test_degrees_account_for_every_traversal() {
    let dataset = road_network();
    let graph = dataset.open();

    let vertices: HashSet<ScopedVertex> = graph
        .vertexes_inside(&dataset.bounds())
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(vertices.len() as u64, graph.vertex_count());

    let mut total_in = 0;
    let mut total_out = 0;
    for vertex in &vertices {
        total_in += vertex.in_degree().unwrap();
        total_out += vertex.out_degree().unwrap();
    }

    assert_eq!(total_out as u64, graph.edge_count());
    assert_eq!(total_in, total_out);
}

#[test]
fn test_route_endpoints_connect_across_boundary() {
    let dataset = road_network();
    let graph = dataset.open();

    let route = graph.edges_for_way(WayIdentifier(CROSSING_WAY)).unwrap();
    assert_eq!(route.len(), 2);

    let exit = route[0].to_vertex().unwrap();
    let entry = route[1].from_vertex().unwrap();
    assert_eq!(exit, entry);
    assert_eq!(exit.location(), loc(0.25, 0.5));
}

// ============================================================================
// Grid tiling
// ============================================================================

#[test]
fn test_every_location_has_exactly_one_cell() {
    let dataset = common::TestDataset::new(3, 4, 0.25);
    let grid = geoshard_core::Grid::build(0.25, dataset.bounds()).unwrap();
    assert_eq!(grid.len(), 12);

    for step_lat in 0..=15 {
        for step_lon in 0..=20 {
            let location = loc(step_lat as f64 * 0.05, step_lon as f64 * 0.05);
            let owner = grid
                .cell_for(&location)
                .unwrap_or_else(|| panic!("{} has no cell", location));

            let containing: Vec<ShardId> = grid
                .cells_intersecting(&geo::Rect::new(location.as_point().0, location.as_point().0))
                .iter()
                .map(|c| c.shard_id())
                .collect();
            assert!(containing.contains(&owner.shard_id()));
        }
    }

    // Outside the bounds
    assert!(grid.cell_for(&loc(-0.01, 0.1)).is_none());
    assert!(grid.cell_for(&loc(0.1, 1.01)).is_none());
}

#[test]
fn test_cells_partition_bounds_area() {
    let dataset = common::TestDataset::new(3, 4, 0.25);
    let grid = geoshard_core::Grid::build(0.25, dataset.bounds()).unwrap();

    let area: f64 = grid
        .cells()
        .iter()
        .map(|c| c.bounds().width() * c.bounds().height())
        .sum();
    let bounds = dataset.bounds();
    assert!((area - bounds.width() * bounds.height()).abs() < 1e-9);

    let ids: Vec<u32> = grid.cells().iter().map(|c| c.shard_id().0).collect();
    assert_eq!(ids, (0..12).collect::<Vec<_>>());
}

// ============================================================================
// Lazy loading
// ============================================================================

#[test]
fn test_concurrent_first_access_loads_once() {
    let dataset = road_network();
    let graph = dataset.open();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let vertex = graph
                    .vertex(ScopedVertexId::make(ShardId(1), 20))
                    .unwrap()
                    .unwrap();
                assert_eq!(vertex.location(), loc(0.1, 0.6));
            });
        }
    });

    let cell = graph.grid().cell(ShardId(1)).unwrap();
    assert_eq!(cell.load_count(), 1);
    assert!(cell.is_loaded());
}

#[test]
fn test_reload_after_unload() {
    let dataset = road_network();
    let graph = dataset.open();

    let before = graph.edges_for_way(WayIdentifier(CROSSING_WAY)).unwrap();
    graph.unload_cells();
    assert!(graph.grid().loaded_cells().is_empty());

    let after = graph.edges_for_way(WayIdentifier(CROSSING_WAY)).unwrap();
    assert_eq!(before, after);
    assert_eq!(graph.grid().cell(ShardId(0)).unwrap().load_count(), 2);
}
