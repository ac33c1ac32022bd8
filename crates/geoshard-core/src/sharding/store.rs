//! SQLite Shard Store
//!
//! A wrapper around rusqlite for one cell's shard file. Each shard file is a
//! self-contained SQLite database storing the vertices, edges, relations and
//! places of that cell's sub-graph.

use crate::geometry::{BoundsRecord, Location};
use crate::graph::{
    AttributeSet, Edge, FunctionalClass, GradeSeparation, Place, Relation, ShardGraph, Vertex,
};
use crate::identifier::{EdgeIdentifier, NodeIdentifier, RelationIdentifier, ShardId};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Result as SqliteResult};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::schema::{
    EDGE_COLUMNS, PLACE_COLUMNS, RELATION_COLUMNS, SCHEMA_CREATE_EDGES, SCHEMA_CREATE_INDEXES,
    SCHEMA_CREATE_PLACES, SCHEMA_CREATE_RELATIONS, SCHEMA_CREATE_SHARD_METADATA,
    SCHEMA_CREATE_VERTICES, SHARD_SCHEMA_VERSION, VERTEX_COLUMNS,
};

/// Errors that can occur during shard file operations
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard file not found: {}", path.display())]
    Missing { path: PathBuf },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: String, found: String },

    #[error("Missing shard metadata: {0}")]
    MissingMetadata(&'static str),

    #[error("Shard file belongs to shard {found}, expected {expected}")]
    ShardMismatch { expected: ShardId, found: String },

    #[error("Corrupt shard data: {0}")]
    Corrupt(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connection to one shard database
pub struct ShardStore {
    conn: Connection,
    shard_id: ShardId,
}

impl ShardStore {
    /// Open an existing shard file read-only
    pub fn open(path: &Path, shard_id: ShardId) -> Result<Self, ShardError> {
        if !path.exists() {
            return Err(ShardError::Missing {
                path: path.to_path_buf(),
            });
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure_read(&conn)?;

        let store = Self { conn, shard_id };

        let version = store
            .get_metadata("schema_version")?
            .ok_or(ShardError::MissingMetadata("schema_version"))?;
        if version != SHARD_SCHEMA_VERSION {
            return Err(ShardError::SchemaVersionMismatch {
                expected: SHARD_SCHEMA_VERSION.to_string(),
                found: version,
            });
        }

        let stored_id = store
            .get_metadata("shard_id")?
            .ok_or(ShardError::MissingMetadata("shard_id"))?;
        if stored_id != shard_id.to_string() {
            return Err(ShardError::ShardMismatch {
                expected: shard_id,
                found: stored_id,
            });
        }

        Ok(store)
    }

    /// Create a new shard database, replacing any existing file
    pub fn create(path: &Path, shard_id: ShardId) -> Result<Self, ShardError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let conn = Connection::open(path)?;
        Self::configure_write(&conn)?;
        Self::create_schema(&conn)?;

        let store = Self { conn, shard_id };
        store.set_metadata("schema_version", SHARD_SCHEMA_VERSION)?;
        store.set_metadata("shard_id", &shard_id.to_string())?;
        Ok(store)
    }

    /// Create an in-memory shard database (for testing)
    pub fn in_memory(shard_id: ShardId) -> Result<Self, ShardError> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;

        let store = Self { conn, shard_id };
        store.set_metadata("schema_version", SHARD_SCHEMA_VERSION)?;
        store.set_metadata("shard_id", &shard_id.to_string())?;
        Ok(store)
    }

    fn create_schema(conn: &Connection) -> SqliteResult<()> {
        conn.execute(SCHEMA_CREATE_VERTICES, [])?;
        conn.execute(SCHEMA_CREATE_EDGES, [])?;
        conn.execute(SCHEMA_CREATE_RELATIONS, [])?;
        conn.execute(SCHEMA_CREATE_PLACES, [])?;
        conn.execute(SCHEMA_CREATE_SHARD_METADATA, [])?;
        conn.execute_batch(SCHEMA_CREATE_INDEXES)?;
        Ok(())
    }

    /// Shard files are copied between repositories, so no WAL sidecar files
    fn configure_write(conn: &Connection) -> SqliteResult<()> {
        conn.pragma_update(None, "journal_mode", "DELETE")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    fn configure_read(conn: &Connection) -> SqliteResult<()> {
        conn.pragma_update(None, "cache_size", -16000)?; // 16MB cache
        conn.pragma_update(None, "mmap_size", 268435456)?; // 256MB mmap
        Ok(())
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    // =========================================================================
    // Metadata Operations
    // =========================================================================

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, ShardError> {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM shard_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), ShardError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO shard_metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // =========================================================================
    // Vertex Operations
    // =========================================================================

    /// Insert multiple vertices in a transaction
    pub fn insert_vertices(&self, vertices: &[Vertex]) -> Result<(), ShardError> {
        let tx = self.conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO vertices ({VERTEX_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?;

            for vertex in vertices {
                stmt.execute(params![
                    vertex.local_id,
                    vertex.node.map(|n| n.0),
                    vertex.location.latitude_e7(),
                    vertex.location.longitude_e7(),
                    vertex.grade.0,
                    vertex.clipped,
                    vertex.synthetic,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Query all vertices in the shard
    pub fn query_all_vertices(&self) -> Result<Vec<Vertex>, ShardError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERTEX_COLUMNS} FROM vertices ORDER BY local_id"
        ))?;

        let vertices = stmt
            .query_map([], Self::row_to_vertex)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(vertices)
    }

    /// Get vertex count
    pub fn vertex_count(&self) -> Result<usize, ShardError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM vertices", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn row_to_vertex(row: &rusqlite::Row<'_>) -> SqliteResult<Vertex> {
        Ok(Vertex {
            local_id: row.get(0)?,
            node: row.get::<_, Option<i64>>(1)?.map(NodeIdentifier),
            location: Location::from_e7(row.get(2)?, row.get(3)?),
            grade: GradeSeparation(row.get(4)?),
            clipped: row.get(5)?,
            synthetic: row.get(6)?,
        })
    }

    // =========================================================================
    // Edge Operations
    // =========================================================================

    /// Insert multiple forward edges in a transaction
    pub fn insert_edges(&self, edges: &[Edge]) -> Result<(), ShardError> {
        let tx = self.conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO edges ({EDGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ))?;

            for edge in edges {
                let shape_json = if edge.shape.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&edge.shape)?)
                };

                stmt.execute(params![
                    edge.local_id,
                    edge.identifier.0,
                    edge.from,
                    edge.to,
                    edge.reversible,
                    edge.functional_class.as_u8(),
                    edge.length_m,
                    shape_json,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Query all forward edges in the shard
    pub fn query_all_edges(&self) -> Result<Vec<Edge>, ShardError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {EDGE_COLUMNS} FROM edges ORDER BY local_id"))?;

        let rows = stmt
            .query_map([], Self::row_to_edge)?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter().map(EdgeRow::decode).collect()
    }

    /// Get edge count (forward edges only)
    pub fn edge_count(&self) -> Result<usize, ShardError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn row_to_edge(row: &rusqlite::Row<'_>) -> SqliteResult<EdgeRow> {
        Ok(EdgeRow {
            local_id: row.get(0)?,
            identifier: EdgeIdentifier(row.get(1)?),
            from: row.get(2)?,
            to: row.get(3)?,
            reversible: row.get(4)?,
            functional_class: row.get(5)?,
            length_m: row.get(6)?,
            shape_json: row.get(7)?,
        })
    }

    // =========================================================================
    // Relation and Place Operations
    // =========================================================================

    /// Insert multiple relations in a transaction
    pub fn insert_relations(&self, relations: &[Relation]) -> Result<(), ShardError> {
        let tx = self.conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO relations ({RELATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4)"
            ))?;

            for relation in relations {
                stmt.execute(params![
                    relation.local_id,
                    relation.identifier.0,
                    relation.relation_type,
                    serde_json::to_string(&relation.members)?,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Query all relations in the shard
    pub fn query_all_relations(&self) -> Result<Vec<Relation>, ShardError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations ORDER BY local_id"
        ))?;

        let rows = stmt
            .query_map([], Self::row_to_relation)?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter().map(RelationRow::decode).collect()
    }

    fn row_to_relation(row: &rusqlite::Row<'_>) -> SqliteResult<RelationRow> {
        Ok(RelationRow {
            local_id: row.get(0)?,
            identifier: RelationIdentifier(row.get(1)?),
            relation_type: row.get(2)?,
            members_json: row.get(3)?,
        })
    }

    /// Insert multiple places in a transaction
    pub fn insert_places(&self, places: &[Place]) -> Result<(), ShardError> {
        let tx = self.conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO places ({PLACE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
            ))?;

            for place in places {
                stmt.execute(params![
                    place.local_id,
                    place.name,
                    place.location.latitude_e7(),
                    place.location.longitude_e7(),
                    place.population as i64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Query all places in the shard
    pub fn query_all_places(&self) -> Result<Vec<Place>, ShardError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PLACE_COLUMNS} FROM places ORDER BY local_id"
        ))?;

        let places = stmt
            .query_map([], |row| {
                Ok(Place {
                    local_id: row.get(0)?,
                    name: row.get(1)?,
                    location: Location::from_e7(row.get(2)?, row.get(3)?),
                    population: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(places)
    }

    // =========================================================================
    // Whole-graph Operations
    // =========================================================================

    /// Persist an entire sub-graph
    pub fn write_graph(&self, graph: &ShardGraph) -> Result<(), ShardError> {
        self.set_metadata(
            "bounds",
            &serde_json::to_string(&BoundsRecord::from(graph.bounds()))?,
        )?;
        self.set_metadata("attributes", &graph.attributes().to_list())?;

        let vertices: Vec<Vertex> = graph.vertices().cloned().collect();
        let edges: Vec<Edge> = graph.forward_edges().cloned().collect();
        let relations: Vec<Relation> = graph.relations().cloned().collect();
        let places: Vec<Place> = graph.places().cloned().collect();

        self.insert_vertices(&vertices)?;
        self.insert_edges(&edges)?;
        self.insert_relations(&relations)?;
        self.insert_places(&places)?;
        Ok(())
    }

    /// Load the entire sub-graph
    pub fn read_graph(&self) -> Result<ShardGraph, ShardError> {
        let bounds_json = self
            .get_metadata("bounds")?
            .ok_or(ShardError::MissingMetadata("bounds"))?;
        let bounds: BoundsRecord = serde_json::from_str(&bounds_json)?;
        let attributes = self
            .get_metadata("attributes")?
            .map(|list| AttributeSet::parse_list(&list))
            .unwrap_or_else(AttributeSet::all);

        let mut graph = ShardGraph::new(self.shard_id, bounds.into()).with_attributes(attributes);

        for vertex in self.query_all_vertices()? {
            graph.add_vertex(vertex);
        }
        for edge in self.query_all_edges()? {
            let local_id = edge.local_id;
            if graph.add_edge(edge).is_none() {
                return Err(ShardError::Corrupt(format!(
                    "edge {} references a missing vertex",
                    local_id
                )));
            }
        }
        for relation in self.query_all_relations()? {
            graph.add_relation(relation);
        }
        for place in self.query_all_places()? {
            graph.add_place(place);
        }

        Ok(graph)
    }

    /// Get shard statistics
    pub fn stats(&self) -> Result<ShardStats, ShardError> {
        Ok(ShardStats {
            vertex_count: self.vertex_count()?,
            edge_count: self.edge_count()?,
            shard_id: self.shard_id,
        })
    }
}

// ============================================================================
// Row decoding
// ============================================================================

/// An edge row whose encoded columns have not been decoded yet
struct EdgeRow {
    local_id: i64,
    identifier: EdgeIdentifier,
    from: i64,
    to: i64,
    reversible: bool,
    functional_class: i64,
    length_m: f64,
    shape_json: Option<String>,
}

impl EdgeRow {
    fn decode(self) -> Result<Edge, ShardError> {
        let functional_class = u8::try_from(self.functional_class)
            .ok()
            .and_then(FunctionalClass::from_u8)
            .ok_or_else(|| {
                ShardError::Corrupt(format!(
                    "edge {} has unknown functional class {}",
                    self.local_id, self.functional_class
                ))
            })?;
        let shape = match self.shape_json {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                ShardError::Corrupt(format!("edge {} shape: {}", self.local_id, e))
            })?,
            None => Vec::new(),
        };

        Ok(Edge {
            local_id: self.local_id,
            identifier: self.identifier,
            from: self.from,
            to: self.to,
            reversible: self.reversible,
            functional_class,
            length_m: self.length_m,
            shape,
        })
    }
}

/// A relation row with its members still encoded
struct RelationRow {
    local_id: i64,
    identifier: RelationIdentifier,
    relation_type: String,
    members_json: String,
}

impl RelationRow {
    fn decode(self) -> Result<Relation, ShardError> {
        let members = serde_json::from_str(&self.members_json).map_err(|e| {
            ShardError::Corrupt(format!("relation {} members: {}", self.local_id, e))
        })?;

        Ok(Relation {
            local_id: self.local_id,
            identifier: self.identifier,
            relation_type: self.relation_type,
            members,
        })
    }
}

/// Statistics about a shard file
#[derive(Debug, Clone)]
pub struct ShardStats {
    pub vertex_count: usize,
    pub edge_count: usize,
    pub shard_id: ShardId,
}
