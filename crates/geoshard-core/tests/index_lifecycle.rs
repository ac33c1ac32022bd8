//! Global Index Lifecycle Tests
//!
//! Builds the index over shard files on disk, persists it, reloads it and
//! checks that every field reads back lazily and intact.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package geoshard-core --test index_lifecycle
//! ```

mod common;

use pretty_assertions::assert_eq;

use common::{loc, road_network, TestDataset, CROSSING_WAY, INTERIOR_WAY, NORTHEAST_WAY};
use geoshard_core::sharding::{
    IndexSettings, FIELD_MEMORY_SIZE_BY_CELL, FIELD_PLACES, FIELD_WAY_ID_TO_SHARD,
};
use geoshard_core::{
    CellCoord, GlobalIndex, Grid, IndexBuilder, Place, ScopedPlaceId, ShardId, WayIdentifier,
};

#[test]
fn test_build_stats_reflect_dataset() {
    let dataset = TestDataset::new(2, 2, 0.5);
    let mut graph = dataset.shard(2);
    common::add_segment(
        &mut graph,
        1,
        5,
        0,
        (1, loc(0.6, 0.1), false),
        (2, loc(0.7, 0.2), false),
    );
    dataset.write(&graph);

    let stats = dataset.build_index();
    assert_eq!(stats.shards_indexed, 1);
    assert_eq!(stats.ways, 1);
    assert_eq!(stats.places, 0);
    assert_eq!(stats.vertices, 2);
    assert_eq!(stats.edges, 2);
}

#[test]
fn test_saved_index_round_trip() {
    let dataset = road_network();
    let index =
        GlobalIndex::load(&dataset.repository().index_path(), IndexSettings::default()).unwrap();

    let metadata = index.metadata();
    assert_eq!(metadata.name, common::DATASET);
    assert_eq!(metadata.cell_size_degrees, 0.5);
    assert_eq!(metadata.bounds(), dataset.bounds());
    assert_eq!(
        metadata.populated_shards,
        vec![ShardId(0), ShardId(1), ShardId(3)]
    );

    assert_eq!(index.shard_for_way(WayIdentifier(CROSSING_WAY)).unwrap(), Some(ShardId(0)));
    assert_eq!(index.shard_for_way(WayIdentifier(INTERIOR_WAY)).unwrap(), Some(ShardId(1)));
    assert_eq!(index.shard_for_way(WayIdentifier(NORTHEAST_WAY)).unwrap(), Some(ShardId(3)));
    assert_eq!(index.shard_for_way(WayIdentifier(1)).unwrap(), None);
    assert_eq!(index.way_count().unwrap(), 3);

    assert!(index.memory_size(CellCoord::new(0, 0)).unwrap().unwrap() > 0);
    assert_eq!(index.memory_size(CellCoord::new(1, 0)).unwrap(), None);
}

#[test]
fn test_places_inside_returns_significant_place_only() {
    let dataset = road_network();
    let index =
        GlobalIndex::load(&dataset.repository().index_path(), IndexSettings::default()).unwrap();

    let places = index.places_inside(&dataset.bounds()).unwrap();
    assert_eq!(places.len(), 1);
    assert_eq!(places[0].id(), ScopedPlaceId::make(ShardId(0), 1));
    assert_eq!(
        places[0].place,
        Place {
            local_id: 1,
            name: "Springfield".to_string(),
            location: loc(0.1, 0.1),
            population: 50_000,
        }
    );

    // The 49,999 place stays in its shard only
    assert!(index.place_at(&loc(0.2, 0.1)).unwrap().is_none());
    assert_eq!(
        index.place_at(&loc(0.1, 0.1)).unwrap().map(|p| p.id()),
        Some(ScopedPlaceId::make(ShardId(0), 1))
    );
}

#[test]
fn test_fields_load_on_first_use() {
    let dataset = road_network();
    let index =
        GlobalIndex::load(&dataset.repository().index_path(), IndexSettings::default()).unwrap();

    assert!(!index.is_field_loaded(FIELD_WAY_ID_TO_SHARD));
    assert!(!index.is_field_loaded(FIELD_PLACES));
    assert!(!index.is_field_loaded(FIELD_MEMORY_SIZE_BY_CELL));

    index.shard_for_way(WayIdentifier(INTERIOR_WAY)).unwrap();
    assert!(index.is_field_loaded(FIELD_WAY_ID_TO_SHARD));
    assert!(!index.is_field_loaded(FIELD_PLACES));

    index.place_count().unwrap();
    assert!(index.is_field_loaded(FIELD_PLACES));
    assert!(!index.is_field_loaded(FIELD_MEMORY_SIZE_BY_CELL));
}

#[test]
fn test_rebuild_replaces_index() {
    let dataset = road_network();

    // Drop shard 3 and rebuild
    std::fs::remove_file(dataset.repository().cell_path(CellCoord::new(1, 1))).unwrap();
    let grid = Grid::build_in(0.5, dataset.bounds(), &dataset.repository().cells_dir()).unwrap();
    IndexBuilder::new(IndexSettings::default())
        .build_and_save(&grid, common::DATASET, &dataset.repository().index_path())
        .unwrap();

    let graph = dataset.open();
    assert_eq!(graph.metadata().populated_shards, vec![ShardId(0), ShardId(1)]);
    assert!(graph
        .edges_for_way(WayIdentifier(NORTHEAST_WAY))
        .unwrap()
        .is_empty());
}

#[test]
fn test_unrecognized_container_rejected() {
    let dataset = TestDataset::new(1, 1, 0.5);
    let path = dataset.repository().index_path();
    std::fs::write(&path, b"plain text, not an index").unwrap();

    assert!(GlobalIndex::load(&path, IndexSettings::default()).is_err());
}
