//! Geoshard Core - Partitioned storage and queries for large road graphs
//!
//! This crate provides the core functionality for sharded road networks:
//! - A grid of geographic cells, each persisted as an independent sub-graph
//! - Scoped identifiers giving shard-local ids dataset-wide meaning
//! - A global index of way ownership and significant places
//! - A read-only virtual graph that stitches cell boundaries back together

pub mod error;
pub mod geometry;
pub mod graph;
pub mod identifier;
pub mod sharding;

// Re-exports for convenience
pub use error::GraphError;
pub use geometry::{bounding_rect, rect_from_locations, BoundsRecord, Location, RectExt};
pub use graph::{
    AttributeSet, Edge, FunctionalClass, GradeSeparation, GraphStore, Place, Relation,
    RelationMember, RoadEdge, RoadVertex, ShardAttribute, ShardGraph, Vertex,
};
pub use identifier::{
    EdgeIdentifier, NodeIdentifier, RelationIdentifier, ScopedEdgeId, ScopedIdentifier,
    ScopedPlaceId, ScopedRelationId, ScopedVertexId, ShardId, WayIdentifier,
};

// Sharding re-exports
pub use sharding::{
    Cell, CellCoord, DatasetMetadata, GlobalIndex, Grid, IndexBuilder, IndexSettings, Repository,
    Scoped, ScopedEdge, ScopedMember, ScopedPlace, ScopedRelation, ScopedVertex, VirtualGraph,
};
