//! Global Index
//!
//! The cross-shard artifact of a dataset: dataset metadata, the way → owning
//! shard table, the merged list of significant places with an R-tree over
//! them, and per-cell memory estimates.
//!
//! The container is a SQLite file with an `index_metadata` table and one
//! `index_fields` row per field. Metadata is read when the index is opened;
//! each field is deserialized on first use, independently of the others.

use crate::geometry::{BoundsRecord, Location, RectExt};
use crate::graph::{Place, ShardGraph};
use crate::identifier::{ScopedPlaceId, ShardId, WayIdentifier};
use crate::sharding::cell::{Cell, CellCoord};
use dashmap::DashMap;
use geo::Rect;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{INDEX_CREATE_FIELDS, INDEX_CREATE_METADATA, INDEX_FORMAT, INDEX_SCHEMA_VERSION};

/// Field names inside the container
pub const FIELD_WAY_ID_TO_SHARD: &str = "way_id_to_shard";
pub const FIELD_PLACES: &str = "places";
pub const FIELD_MEMORY_SIZE_BY_CELL: &str = "memory_size_by_cell";

/// Default search radius for `place_at`
pub const DEFAULT_PLACE_TOLERANCE_METERS: f64 = 1.0;

type PlaceEntry = GeomWithData<[f64; 2], usize>;

/// Errors that can occur while reading or writing the global index
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index container not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("unrecognized index container {}: {reason}", path.display())]
    UnrecognizedContainer { path: PathBuf, reason: String },

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: String, found: String },

    #[error("index container has no dataset metadata")]
    MissingMetadata,

    #[error("index field '{0}' is missing")]
    MissingField(&'static str),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dataset-level facts stored with the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub bounds: BoundsRecord,
    pub cell_size_degrees: f64,
    pub min_place_population: u64,
    /// Shards with persisted data, sorted
    #[serde(default)]
    pub populated_shards: Vec<ShardId>,
    #[serde(default)]
    pub vertex_count: u64,
    #[serde(default)]
    pub edge_count: u64,
    #[serde(default)]
    pub forward_edge_count: u64,
    #[serde(default)]
    pub relation_count: u64,
    #[serde(default)]
    pub place_count: u64,
}

impl DatasetMetadata {
    pub fn new(name: impl Into<String>, bounds: Rect<f64>, cell_size_degrees: f64) -> Self {
        Self {
            name: name.into(),
            bounds: bounds.into(),
            cell_size_degrees,
            min_place_population: geoshard_config::DEFAULT_MIN_PLACE_POPULATION,
            populated_shards: Vec::new(),
            vertex_count: 0,
            edge_count: 0,
            forward_edge_count: 0,
            relation_count: 0,
            place_count: 0,
        }
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds.into()
    }
}

/// Tunables for building and querying the index.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Places below this population are not copied into the index
    pub min_place_population: u64,
    /// Search radius used by `place_at`
    pub place_tolerance_meters: f64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            min_place_population: geoshard_config::DEFAULT_MIN_PLACE_POPULATION,
            place_tolerance_meters: DEFAULT_PLACE_TOLERANCE_METERS,
        }
    }
}

/// A place together with its owning shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPlace {
    pub shard_id: ShardId,
    pub place: Place,
}

impl ScopedPlace {
    pub fn new(shard_id: ShardId, place: Place) -> Self {
        Self { shard_id, place }
    }

    pub fn id(&self) -> ScopedPlaceId {
        ScopedPlaceId::make(self.shard_id, self.place.local_id)
    }

    pub fn location(&self) -> Location {
        self.place.location
    }
}

/// Persisted form of a scoped place (packed id plus the place fields).
#[derive(Debug, Serialize, Deserialize)]
struct PlaceRecord {
    id: u64,
    name: String,
    location: Location,
    population: u64,
}

impl From<&ScopedPlace> for PlaceRecord {
    fn from(scoped: &ScopedPlace) -> Self {
        Self {
            id: scoped.id().as_u64(),
            name: scoped.place.name.clone(),
            location: scoped.place.location,
            population: scoped.place.population,
        }
    }
}

impl From<PlaceRecord> for ScopedPlace {
    fn from(record: PlaceRecord) -> Self {
        let id = ScopedPlaceId::from_u64(record.id);
        ScopedPlace::new(
            id.shard_id(),
            Place {
                local_id: id.local_id(),
                name: record.name,
                location: record.location,
                population: record.population,
            },
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CellMemoryRecord {
    row: u32,
    col: u32,
    bytes: u64,
}

/// The global index of a dataset.
pub struct GlobalIndex {
    /// Container the deferred fields are read from; `None` for a new index
    source: Option<PathBuf>,
    settings: IndexSettings,
    metadata: RwLock<DatasetMetadata>,

    way_id_to_shard: OnceCell<DashMap<WayIdentifier, ShardId>>,
    places: OnceCell<RwLock<Vec<ScopedPlace>>>,
    /// Lock order: `places` before `place_tree`
    place_tree: Mutex<Option<Arc<RTree<PlaceEntry>>>>,
    memory_size_by_cell: OnceCell<DashMap<CellCoord, u64>>,
}

impl std::fmt::Debug for GlobalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalIndex")
            .field("source", &self.source)
            .field("dataset", &self.metadata.read().name)
            .finish()
    }
}

impl GlobalIndex {
    /// Create an empty index ready for `build_entry` calls.
    pub fn create(metadata: DatasetMetadata, settings: IndexSettings) -> Self {
        Self {
            source: None,
            settings,
            metadata: RwLock::new(metadata),
            way_id_to_shard: OnceCell::with_value(DashMap::new()),
            places: OnceCell::with_value(RwLock::new(Vec::new())),
            place_tree: Mutex::new(None),
            memory_size_by_cell: OnceCell::with_value(DashMap::new()),
        }
    }

    /// Open an index container, reading only its metadata.
    pub fn load(path: &Path, settings: IndexSettings) -> Result<Self, IndexError> {
        if !path.exists() {
            return Err(IndexError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let conn = Self::open_read_only(path)?;
        let unrecognized = |reason: String| IndexError::UnrecognizedContainer {
            path: path.to_path_buf(),
            reason,
        };

        let format = Self::get_metadata(&conn, "format").map_err(|e| unrecognized(e.to_string()))?;
        match format.as_deref() {
            Some(INDEX_FORMAT) => {}
            Some(other) => return Err(unrecognized(format!("format tag '{}'", other))),
            None => return Err(unrecognized("no format tag".to_string())),
        }

        let version = Self::get_metadata(&conn, "schema_version")?.unwrap_or_default();
        if version != INDEX_SCHEMA_VERSION {
            return Err(IndexError::SchemaVersionMismatch {
                expected: INDEX_SCHEMA_VERSION.to_string(),
                found: version,
            });
        }

        let dataset = Self::get_metadata(&conn, "dataset")?.ok_or(IndexError::MissingMetadata)?;
        let metadata: DatasetMetadata = serde_json::from_str(&dataset)?;

        info!(
            dataset = %metadata.name,
            shards = metadata.populated_shards.len(),
            "Opened global index"
        );

        Ok(Self {
            source: Some(path.to_path_buf()),
            settings,
            metadata: RwLock::new(metadata),
            way_id_to_shard: OnceCell::new(),
            places: OnceCell::new(),
            place_tree: Mutex::new(None),
            memory_size_by_cell: OnceCell::new(),
        })
    }

    fn open_read_only(path: &Path) -> Result<Connection, IndexError> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| IndexError::UnrecognizedContainer {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>, IndexError> {
        let value = conn
            .query_row(
                "SELECT value FROM index_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Read and deserialize one named field from the source container.
    fn read_field<T: DeserializeOwned>(&self, name: &'static str) -> Result<T, IndexError> {
        let path = self.source.as_deref().ok_or(IndexError::MissingField(name))?;
        let conn = Self::open_read_only(path)?;
        let data: String = conn
            .query_row("SELECT data FROM index_fields WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(IndexError::MissingField(name))?;
        debug!(field = name, bytes = data.len(), "Loaded index field");
        Ok(serde_json::from_str(&data)?)
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn metadata(&self) -> DatasetMetadata {
        self.metadata.read().clone()
    }

    pub fn set_metadata(&self, metadata: DatasetMetadata) {
        *self.metadata.write() = metadata;
    }

    /// Whether a named field has been deserialized.
    pub fn is_field_loaded(&self, name: &str) -> bool {
        match name {
            FIELD_WAY_ID_TO_SHARD => self.way_id_to_shard.get().is_some(),
            FIELD_PLACES => self.places.get().is_some(),
            FIELD_MEMORY_SIZE_BY_CELL => self.memory_size_by_cell.get().is_some(),
            _ => false,
        }
    }

    // =========================================================================
    // Lazy fields
    // =========================================================================

    fn ways(&self) -> Result<&DashMap<WayIdentifier, ShardId>, IndexError> {
        self.way_id_to_shard.get_or_try_init(|| {
            let entries: Vec<(u64, u32)> = self.read_field(FIELD_WAY_ID_TO_SHARD)?;
            Ok(entries
                .into_iter()
                .map(|(way, shard)| (WayIdentifier(way), ShardId(shard)))
                .collect())
        })
    }

    fn place_list(&self) -> Result<&RwLock<Vec<ScopedPlace>>, IndexError> {
        self.places.get_or_try_init(|| {
            let records: Vec<PlaceRecord> = self.read_field(FIELD_PLACES)?;
            Ok(RwLock::new(records.into_iter().map(ScopedPlace::from).collect()))
        })
    }

    fn memory_sizes(&self) -> Result<&DashMap<CellCoord, u64>, IndexError> {
        self.memory_size_by_cell.get_or_try_init(|| {
            let records: Vec<CellMemoryRecord> = self.read_field(FIELD_MEMORY_SIZE_BY_CELL)?;
            Ok(records
                .into_iter()
                .map(|r| (CellCoord::new(r.row, r.col), r.bytes))
                .collect())
        })
    }

    // =========================================================================
    // Building
    // =========================================================================

    /// Record one shard's contribution.
    ///
    /// Every forward edge's way is mapped to the shard, keeping the lowest
    /// shard id when several shards contain the way. Places with population of
    /// at least the configured minimum are copied. Safe to call concurrently
    /// for different cells.
    pub fn build_entry(&self, cell: &Cell, graph: &ShardGraph) -> Result<(), IndexError> {
        let shard_id = cell.shard_id();

        let ways = self.ways()?;
        for edge in graph.forward_edges() {
            ways.entry(edge.way())
                .and_modify(|owner| {
                    if shard_id < *owner {
                        *owner = shard_id;
                    }
                })
                .or_insert(shard_id);
        }

        let significant: Vec<ScopedPlace> = graph
            .places_with_population_at_least(self.settings.min_place_population)
            .map(|p| ScopedPlace::new(shard_id, p.clone()))
            .collect();

        let mut places = self.place_list()?.write();
        places.retain(|p| p.shard_id != shard_id);
        places.extend(significant);
        *self.place_tree.lock() = None;

        Ok(())
    }

    pub fn record_memory_size(&self, coord: CellCoord, bytes: u64) -> Result<(), IndexError> {
        self.memory_sizes()?.insert(coord, bytes);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// One shard known to contain `way`.
    pub fn shard_for_way(&self, way: WayIdentifier) -> Result<Option<ShardId>, IndexError> {
        Ok(self.ways()?.get(&way).map(|entry| *entry))
    }

    pub fn way_count(&self) -> Result<usize, IndexError> {
        Ok(self.ways()?.len())
    }

    pub fn memory_size(&self, coord: CellCoord) -> Result<Option<u64>, IndexError> {
        Ok(self.memory_sizes()?.get(&coord).map(|entry| *entry))
    }

    pub fn place_count(&self) -> Result<usize, IndexError> {
        Ok(self.place_list()?.read().len())
    }

    /// Every indexed place, ordered by scoped id.
    pub fn places(&self) -> Result<Vec<ScopedPlace>, IndexError> {
        let mut places = self.place_list()?.read().clone();
        places.sort_by_key(ScopedPlace::id);
        Ok(places)
    }

    /// Indexed places inside `rect` (closed), ordered by scoped id.
    pub fn places_inside(&self, rect: &Rect<f64>) -> Result<Vec<ScopedPlace>, IndexError> {
        let places = self.place_list()?.read();
        let tree = {
            let mut slot = self.place_tree.lock();
            Arc::clone(slot.get_or_insert_with(|| {
                debug!(places = places.len(), "Building place index");
                Arc::new(RTree::bulk_load(
                    places
                        .iter()
                        .enumerate()
                        .map(|(i, p)| GeomWithData::new(p.location().as_array(), i))
                        .collect(),
                ))
            }))
        };

        let mut found: Vec<ScopedPlace> = tree
            .locate_in_envelope(&rect.envelope())
            .filter_map(|entry| places.get(entry.data).cloned())
            .collect();
        found.sort_by_key(ScopedPlace::id);
        Ok(found)
    }

    /// The indexed place exactly at `location`.
    pub fn place_at(&self, location: &Location) -> Result<Option<ScopedPlace>, IndexError> {
        let candidates = self.places_inside(&location.within(self.settings.place_tolerance_meters))?;
        Ok(candidates
            .into_iter()
            .find(|p| p.location() == *location))
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the index to `path` atomically (temporary sibling, then rename).
    pub fn save(&self, path: &Path, metadata: &DatasetMetadata) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        let mut ways: Vec<(u64, u32)> = self
            .ways()?
            .iter()
            .map(|entry| (entry.key().0, entry.value().0))
            .collect();
        ways.sort_unstable();

        let places: Vec<PlaceRecord> = self.places()?.iter().map(PlaceRecord::from).collect();

        let mut memory: Vec<CellMemoryRecord> = self
            .memory_sizes()?
            .iter()
            .map(|entry| CellMemoryRecord {
                row: entry.key().row,
                col: entry.key().col,
                bytes: *entry.value(),
            })
            .collect();
        memory.sort_by_key(|r| (r.row, r.col));

        {
            let conn = Connection::open(&tmp_path)?;
            conn.pragma_update(None, "journal_mode", "DELETE")?;
            conn.execute(INDEX_CREATE_METADATA, [])?;
            conn.execute(INDEX_CREATE_FIELDS, [])?;

            let tx = conn.unchecked_transaction()?;
            {
                let mut meta = tx.prepare("INSERT INTO index_metadata (key, value) VALUES (?1, ?2)")?;
                meta.execute(params!["format", INDEX_FORMAT])?;
                meta.execute(params!["schema_version", INDEX_SCHEMA_VERSION])?;
                meta.execute(params!["dataset", serde_json::to_string(metadata)?])?;

                let mut fields = tx.prepare("INSERT INTO index_fields (name, data) VALUES (?1, ?2)")?;
                fields.execute(params![FIELD_WAY_ID_TO_SHARD, serde_json::to_string(&ways)?])?;
                fields.execute(params![FIELD_PLACES, serde_json::to_string(&places)?])?;
                fields.execute(params![FIELD_MEMORY_SIZE_BY_CELL, serde_json::to_string(&memory)?])?;
            }
            tx.commit()?;
        }

        std::fs::rename(&tmp_path, path)?;
        self.set_metadata(metadata.clone());

        info!(
            path = %path.display(),
            ways = ways.len(),
            places = places.len(),
            "Saved global index"
        );
        Ok(())
    }
}
