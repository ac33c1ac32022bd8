//! SQLite Schema Definitions for Shard Files and the Index Container
//!
//! Each cell is persisted as a self-contained SQLite database holding the
//! vertices, edges, relations and places of its sub-graph. The global index is
//! a second SQLite database with a metadata table and named JSON fields that
//! can be read independently.

/// Schema version for shard databases
pub const SHARD_SCHEMA_VERSION: &str = "1.0";

/// Schema version for the index container
pub const INDEX_SCHEMA_VERSION: &str = "1.0";

/// Format tag stored in every index container
pub const INDEX_FORMAT: &str = "geoshard-index";

/// SQL to create the vertices table
///
/// Locations are stored in fixed-point 1e-7 degree units so that reloading a
/// shard yields bit-identical locations.
pub const SCHEMA_CREATE_VERTICES: &str = r#"
CREATE TABLE IF NOT EXISTS vertices (
    local_id INTEGER PRIMARY KEY NOT NULL,

    -- Source map node, NULL for synthetic vertices
    node_id INTEGER,

    latitude_e7 INTEGER NOT NULL,
    longitude_e7 INTEGER NOT NULL,
    grade INTEGER NOT NULL DEFAULT 0,

    clipped INTEGER NOT NULL DEFAULT 0,
    synthetic INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the edges table
///
/// Only forward edges are stored; reverse traversals are derived from the
/// `reversible` flag on load.
pub const SCHEMA_CREATE_EDGES: &str = r#"
CREATE TABLE IF NOT EXISTS edges (
    local_id INTEGER PRIMARY KEY NOT NULL CHECK (local_id > 0),

    -- way_id * 1000000 + section
    identifier INTEGER NOT NULL UNIQUE,

    from_vertex INTEGER NOT NULL,
    to_vertex INTEGER NOT NULL,

    reversible INTEGER NOT NULL DEFAULT 0,
    functional_class INTEGER NOT NULL DEFAULT 0,
    length_m REAL NOT NULL DEFAULT 0,

    -- Intermediate shape points as JSON
    shape_json TEXT
)
"#;

/// SQL to create the relations table
pub const SCHEMA_CREATE_RELATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS relations (
    local_id INTEGER PRIMARY KEY NOT NULL,
    identifier INTEGER NOT NULL,
    relation_type TEXT NOT NULL,
    members_json TEXT NOT NULL
)
"#;

/// SQL to create the places table
pub const SCHEMA_CREATE_PLACES: &str = r#"
CREATE TABLE IF NOT EXISTS places (
    local_id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    latitude_e7 INTEGER NOT NULL,
    longitude_e7 INTEGER NOT NULL,
    population INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create indexes for efficient queries
pub const SCHEMA_CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_vertices_node ON vertices(node_id);
CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_vertex);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_vertex);
CREATE INDEX IF NOT EXISTS idx_relations_identifier ON relations(identifier);
"#;

/// SQL to create the shard metadata table
pub const SCHEMA_CREATE_SHARD_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS shard_metadata (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

/// Column names for vertex queries (in order for row mapping)
pub const VERTEX_COLUMNS: &str =
    "local_id, node_id, latitude_e7, longitude_e7, grade, clipped, synthetic";

/// Column names for edge queries (in order for row mapping)
pub const EDGE_COLUMNS: &str =
    "local_id, identifier, from_vertex, to_vertex, reversible, functional_class, length_m, shape_json";

/// Column names for relation queries (in order for row mapping)
pub const RELATION_COLUMNS: &str = "local_id, identifier, relation_type, members_json";

/// Column names for place queries (in order for row mapping)
pub const PLACE_COLUMNS: &str = "local_id, name, latitude_e7, longitude_e7, population";

/// SQL to create the index container metadata table
pub const INDEX_CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS index_metadata (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

/// SQL to create the index container field table
///
/// Each row is one independently deserializable field.
pub const INDEX_CREATE_FIELDS: &str = r#"
CREATE TABLE IF NOT EXISTS index_fields (
    name TEXT PRIMARY KEY NOT NULL,
    data TEXT NOT NULL
)
"#;
