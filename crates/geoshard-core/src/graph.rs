//! Per-shard road graph.
//!
//! `ShardGraph` is the self-contained sub-graph persisted for one grid cell:
//! vertices, directed edges (with reversible edges exposing a reverse
//! traversal), relations and places. It is backed by petgraph for adjacency
//! and by lazily built `rstar` trees for spatial queries.
//!
//! # Edge directions
//!
//! Only the forward direction of an edge is stored. A reversible edge with
//! local id `n` also exposes its reverse traversal as local id `-n`, with
//! `from`/`to` swapped and a negated `EdgeIdentifier`.

use crate::error::GraphError;
use crate::geometry::{Location, RectExt};
use crate::identifier::{
    EdgeIdentifier, NodeIdentifier, RelationIdentifier, ShardId, WayIdentifier,
};
use crate::sharding::cache::estimate_memory;
use crate::sharding::store::ShardStore;
use geo::{Intersects, LineString, Rect};
use once_cell::sync::OnceCell;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rstar::primitives::{GeomWithData, Rectangle as Envelope};
use rstar::RTree;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

type PointEntry = GeomWithData<[f64; 2], i64>;
type EdgeEntry = GeomWithData<Envelope<[f64; 2]>, i64>;

// ============================================================================
// Element attributes
// ============================================================================

/// Road importance, ordered from least to most important.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalClass {
    #[default]
    Unclassified = 0,
    Local = 1,
    Collector = 2,
    MinorArterial = 3,
    MajorArterial = 4,
    Freeway = 5,
}

impl FunctionalClass {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unclassified),
            1 => Some(Self::Local),
            2 => Some(Self::Collector),
            3 => Some(Self::MinorArterial),
            4 => Some(Self::MajorArterial),
            5 => Some(Self::Freeway),
            _ => None,
        }
    }
}

/// Vertical level of a vertex (0 = ground, positive = bridges, negative = tunnels).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct GradeSeparation(pub i8);

// ============================================================================
// Elements
// ============================================================================

/// A vertex of the road graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub local_id: i64,
    /// Source map node, `None` for synthetic vertices
    pub node: Option<NodeIdentifier>,
    pub location: Location,
    pub grade: GradeSeparation,
    /// Materialized at the literal edge of the owning cell
    pub clipped: bool,
    /// Invented to close a clipped shape
    pub synthetic: bool,
}

impl Vertex {
    pub fn new(local_id: i64, location: Location) -> Self {
        Self {
            local_id,
            node: None,
            location,
            grade: GradeSeparation::default(),
            clipped: false,
            synthetic: false,
        }
    }

    pub fn with_node(mut self, node: NodeIdentifier) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_grade(mut self, grade: GradeSeparation) -> Self {
        self.grade = grade;
        self
    }

    pub fn clipped(mut self) -> Self {
        self.clipped = true;
        self
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }
}

/// A directed edge of the road graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Positive for the stored direction, negated for the reverse traversal
    pub local_id: i64,
    pub identifier: EdgeIdentifier,
    /// Local id of the start vertex
    pub from: i64,
    /// Local id of the end vertex
    pub to: i64,
    pub reversible: bool,
    pub functional_class: FunctionalClass,
    pub length_m: f64,
    /// Intermediate shape points, excluding the endpoints
    pub shape: Vec<Location>,
}

impl Edge {
    pub fn new(local_id: i64, identifier: EdgeIdentifier, from: i64, to: i64) -> Self {
        Self {
            local_id,
            identifier,
            from,
            to,
            reversible: false,
            functional_class: FunctionalClass::default(),
            length_m: 0.0,
            shape: Vec::new(),
        }
    }

    pub fn reversible(mut self) -> Self {
        self.reversible = true;
        self
    }

    pub fn with_functional_class(mut self, class: FunctionalClass) -> Self {
        self.functional_class = class;
        self
    }

    pub fn with_length(mut self, meters: f64) -> Self {
        self.length_m = meters;
        self
    }

    pub fn with_shape(mut self, shape: Vec<Location>) -> Self {
        self.shape = shape;
        self
    }

    pub fn is_forward(&self) -> bool {
        self.local_id > 0
    }

    pub fn way(&self) -> WayIdentifier {
        self.identifier.way()
    }

    /// The opposite traversal of this edge.
    pub fn reversed(&self) -> Edge {
        let mut shape = self.shape.clone();
        shape.reverse();
        Edge {
            local_id: -self.local_id,
            identifier: self.identifier.reversed(),
            from: self.to,
            to: self.from,
            reversible: self.reversible,
            functional_class: self.functional_class,
            length_m: self.length_m,
            shape,
        }
    }
}

/// Member of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationMember {
    Way { way: WayIdentifier, role: String },
    Node { node: NodeIdentifier, role: String },
}

impl RelationMember {
    pub fn role(&self) -> &str {
        match self {
            RelationMember::Way { role, .. } | RelationMember::Node { role, .. } => role,
        }
    }
}

/// A relation (turn restriction, route, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub local_id: i64,
    pub identifier: RelationIdentifier,
    pub relation_type: String,
    pub members: Vec<RelationMember>,
}

/// A populated place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub local_id: i64,
    pub name: String,
    pub location: Location,
    pub population: u64,
}

// ============================================================================
// Element traits
// ============================================================================

/// Read surface shared by base and scoped vertices.
pub trait RoadVertex {
    fn location(&self) -> Location;
    fn grade_separation(&self) -> GradeSeparation;
    fn is_clipped(&self) -> bool;
    fn is_synthetic(&self) -> bool;
    fn node_identifier(&self) -> Option<NodeIdentifier>;
}

/// Read surface shared by base and scoped edges.
pub trait RoadEdge {
    fn identifier(&self) -> EdgeIdentifier;
    fn functional_class(&self) -> FunctionalClass;
    fn length_meters(&self) -> f64;
    fn is_reversible(&self) -> bool;
    fn shape(&self) -> &[Location];

    fn way(&self) -> WayIdentifier {
        self.identifier().way()
    }

    fn is_forward(&self) -> bool {
        self.identifier().is_forward()
    }
}

impl RoadVertex for Vertex {
    fn location(&self) -> Location {
        self.location
    }

    fn grade_separation(&self) -> GradeSeparation {
        self.grade
    }

    fn is_clipped(&self) -> bool {
        self.clipped
    }

    fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    fn node_identifier(&self) -> Option<NodeIdentifier> {
        self.node
    }
}

impl RoadEdge for Edge {
    fn identifier(&self) -> EdgeIdentifier {
        self.identifier
    }

    fn functional_class(&self) -> FunctionalClass {
        self.functional_class
    }

    fn length_meters(&self) -> f64 {
        self.length_m
    }

    fn is_reversible(&self) -> bool {
        self.reversible
    }

    fn shape(&self) -> &[Location] {
        &self.shape
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Lazily materialized parts of a shard graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardAttribute {
    VertexIndex,
    EdgeIndex,
    PlaceIndex,
}

impl ShardAttribute {
    pub const ALL: [ShardAttribute; 3] = [
        ShardAttribute::VertexIndex,
        ShardAttribute::EdgeIndex,
        ShardAttribute::PlaceIndex,
    ];

    fn bit(self) -> u8 {
        match self {
            ShardAttribute::VertexIndex => 0b001,
            ShardAttribute::EdgeIndex => 0b010,
            ShardAttribute::PlaceIndex => 0b100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardAttribute::VertexIndex => "vertex_index",
            ShardAttribute::EdgeIndex => "edge_index",
            ShardAttribute::PlaceIndex => "place_index",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "vertex_index" => Some(ShardAttribute::VertexIndex),
            "edge_index" => Some(ShardAttribute::EdgeIndex),
            "place_index" => Some(ShardAttribute::PlaceIndex),
            _ => None,
        }
    }
}

/// A set of `ShardAttribute`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeSet(u8);

impl AttributeSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        ShardAttribute::ALL.into_iter().collect()
    }

    pub fn with(mut self, attribute: ShardAttribute) -> Self {
        self.insert(attribute);
        self
    }

    pub fn insert(&mut self, attribute: ShardAttribute) {
        self.0 |= attribute.bit();
    }

    pub fn contains(&self, attribute: ShardAttribute) -> bool {
        self.0 & attribute.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ShardAttribute> + '_ {
        ShardAttribute::ALL
            .into_iter()
            .filter(move |a| self.contains(*a))
    }

    /// Parse a comma-separated list; unknown names are skipped.
    pub fn parse_list(s: &str) -> Self {
        s.split(',').filter_map(ShardAttribute::parse).collect()
    }

    pub fn to_list(&self) -> String {
        self.iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<ShardAttribute> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = ShardAttribute>>(iter: I) -> Self {
        let mut set = AttributeSet::empty();
        for attribute in iter {
            set.insert(attribute);
        }
        set
    }
}

// ============================================================================
// Persistence surface
// ============================================================================

/// Persistence entry points of a graph.
pub trait GraphStore {
    /// Write the graph to `path`.
    fn save(&self, path: &Path) -> Result<(), GraphError>;

    /// Release lazily materialized state.
    fn unload(&mut self) -> Result<(), GraphError>;

    /// Replace the graph with the archive at `path`.
    fn load_archive(&mut self, path: &Path) -> Result<(), GraphError>;
}

// ============================================================================
// ShardGraph
// ============================================================================

/// The road graph of one shard.
pub struct ShardGraph {
    shard_id: ShardId,
    bounds: Rect<f64>,
    attributes: AttributeSet,

    graph: StableGraph<Vertex, Edge, petgraph::Directed>,

    /// Vertex local id → NodeIndex
    vertex_index_map: HashMap<i64, NodeIndex>,

    /// Forward edge local id → EdgeIndex
    edge_index_map: HashMap<i64, EdgeIndex>,

    /// Forward edge identifier → edge local id
    edges_by_identifier: HashMap<EdgeIdentifier, i64>,

    edges_by_way: HashMap<WayIdentifier, Vec<i64>>,
    vertices_by_node: HashMap<NodeIdentifier, i64>,
    vertices_by_location: HashMap<Location, Vec<i64>>,

    relations: BTreeMap<i64, Relation>,
    relations_by_identifier: HashMap<RelationIdentifier, i64>,
    places: BTreeMap<i64, Place>,

    reversible_count: usize,

    vertex_tree: OnceCell<RTree<PointEntry>>,
    edge_tree: OnceCell<RTree<EdgeEntry>>,
    place_tree: OnceCell<RTree<PointEntry>>,
}

impl fmt::Debug for ShardGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardGraph")
            .field("shard_id", &self.shard_id)
            .field("vertices", &self.vertex_count())
            .field("edges", &self.edge_count())
            .field("relations", &self.relation_count())
            .field("places", &self.place_count())
            .finish()
    }
}

impl ShardGraph {
    /// Create an empty graph for `shard_id` covering `bounds`.
    pub fn new(shard_id: ShardId, bounds: Rect<f64>) -> Self {
        Self {
            shard_id,
            bounds,
            attributes: AttributeSet::all(),
            graph: StableGraph::new(),
            vertex_index_map: HashMap::new(),
            edge_index_map: HashMap::new(),
            edges_by_identifier: HashMap::new(),
            edges_by_way: HashMap::new(),
            vertices_by_node: HashMap::new(),
            vertices_by_location: HashMap::new(),
            relations: BTreeMap::new(),
            relations_by_identifier: HashMap::new(),
            places: BTreeMap::new(),
            reversible_count: 0,
            vertex_tree: OnceCell::new(),
            edge_tree: OnceCell::new(),
            place_tree: OnceCell::new(),
        }
    }

    /// Restrict the attributes this graph can materialize.
    pub fn with_attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    pub fn attributes(&self) -> AttributeSet {
        self.attributes
    }

    /// Whether this graph can build the given attribute.
    pub fn supports(&self, attribute: ShardAttribute) -> bool {
        self.attributes.contains(attribute)
    }

    /// Whether the given attribute has been built.
    pub fn is_materialized(&self, attribute: ShardAttribute) -> bool {
        match attribute {
            ShardAttribute::VertexIndex => self.vertex_tree.get().is_some(),
            ShardAttribute::EdgeIndex => self.edge_tree.get().is_some(),
            ShardAttribute::PlaceIndex => self.place_tree.get().is_some(),
        }
    }

    /// Build every supported attribute not in `except`.
    pub fn load_all(&self, except: AttributeSet) {
        for attribute in self.attributes.iter().filter(|a| !except.contains(*a)) {
            match attribute {
                ShardAttribute::VertexIndex => {
                    self.vertex_tree();
                }
                ShardAttribute::EdgeIndex => {
                    self.edge_tree();
                }
                ShardAttribute::PlaceIndex => {
                    self.place_tree();
                }
            }
        }
    }

    fn invalidate_indexes(&mut self) {
        self.vertex_tree.take();
        self.edge_tree.take();
        self.place_tree.take();
    }

    // ------------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------------

    /// Add a vertex, replacing any vertex with the same local id.
    pub fn add_vertex(&mut self, vertex: Vertex) -> NodeIndex {
        self.invalidate_indexes();
        let local_id = vertex.local_id;

        if let Some(&idx) = self.vertex_index_map.get(&local_id) {
            if let Some(old) = self.graph.node_weight(idx).cloned() {
                self.forget_vertex(&old);
            }
            self.remember_vertex(&vertex);
            self.graph[idx] = vertex;
            return idx;
        }

        self.remember_vertex(&vertex);
        let idx = self.graph.add_node(vertex);
        self.vertex_index_map.insert(local_id, idx);
        idx
    }

    fn remember_vertex(&mut self, vertex: &Vertex) {
        if let Some(node) = vertex.node {
            self.vertices_by_node.insert(node, vertex.local_id);
        }
        self.vertices_by_location
            .entry(vertex.location)
            .or_default()
            .push(vertex.local_id);
    }

    fn forget_vertex(&mut self, vertex: &Vertex) {
        if let Some(node) = vertex.node {
            self.vertices_by_node.remove(&node);
        }
        if let Some(ids) = self.vertices_by_location.get_mut(&vertex.location) {
            ids.retain(|id| *id != vertex.local_id);
            if ids.is_empty() {
                self.vertices_by_location.remove(&vertex.location);
            }
        }
    }

    /// Add a forward edge, replacing any edge with the same local id.
    ///
    /// Returns `None` if the local id is not positive or either endpoint is
    /// missing.
    pub fn add_edge(&mut self, edge: Edge) -> Option<EdgeIndex> {
        if edge.local_id <= 0 || !edge.identifier.is_forward() {
            return None;
        }
        let from = *self.vertex_index_map.get(&edge.from)?;
        let to = *self.vertex_index_map.get(&edge.to)?;

        self.invalidate_indexes();
        if let Some(old_idx) = self.edge_index_map.remove(&edge.local_id) {
            if let Some(old) = self.graph.remove_edge(old_idx) {
                self.forget_edge(&old);
            }
        }

        self.edges_by_identifier
            .insert(edge.identifier, edge.local_id);
        self.edges_by_way
            .entry(edge.way())
            .or_default()
            .push(edge.local_id);
        if edge.reversible {
            self.reversible_count += 1;
        }

        let local_id = edge.local_id;
        let idx = self.graph.add_edge(from, to, edge);
        self.edge_index_map.insert(local_id, idx);
        Some(idx)
    }

    fn forget_edge(&mut self, edge: &Edge) {
        self.edges_by_identifier.remove(&edge.identifier);
        if let Some(ids) = self.edges_by_way.get_mut(&edge.way()) {
            ids.retain(|id| *id != edge.local_id);
            if ids.is_empty() {
                self.edges_by_way.remove(&edge.way());
            }
        }
        if edge.reversible {
            self.reversible_count -= 1;
        }
    }

    pub fn add_relation(&mut self, relation: Relation) {
        if let Some(old) = self.relations.get(&relation.local_id) {
            self.relations_by_identifier.remove(&old.identifier);
        }
        self.relations_by_identifier
            .insert(relation.identifier, relation.local_id);
        self.relations.insert(relation.local_id, relation);
    }

    pub fn add_place(&mut self, place: Place) {
        self.place_tree.take();
        self.places.insert(place.local_id, place);
    }

    // ------------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------------

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of traversable directed edges (reverse traversals included).
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count() + self.reversible_count
    }

    pub fn forward_edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn place_count(&self) -> usize {
        self.places.len()
    }

    /// Estimated in-memory footprint in bytes.
    pub fn estimated_memory(&self) -> usize {
        estimate_memory(self.vertex_count(), self.forward_edge_count())
    }

    // ------------------------------------------------------------------------
    // Vertices
    // ------------------------------------------------------------------------

    pub fn vertex(&self, local_id: i64) -> Option<&Vertex> {
        self.vertex_index_map
            .get(&local_id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn contains_vertex(&self, local_id: i64) -> bool {
        self.vertex_index_map.contains_key(&local_id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.graph.node_weights()
    }

    pub fn vertex_for_identifier(&self, node: NodeIdentifier) -> Option<&Vertex> {
        self.vertices_by_node
            .get(&node)
            .and_then(|&local| self.vertex(local))
    }

    pub fn contains_node(&self, node: NodeIdentifier) -> bool {
        self.vertices_by_node.contains_key(&node)
    }

    /// Vertices at exactly `location`.
    pub fn vertices_at(&self, location: &Location) -> impl Iterator<Item = &Vertex> {
        self.vertices_by_location
            .get(location)
            .into_iter()
            .flatten()
            .filter_map(|&local| self.vertex(local))
    }

    /// Vertices inside `rect` (closed), ordered by local id.
    pub fn vertexes_inside(&self, rect: &Rect<f64>) -> Vec<&Vertex> {
        let mut found: Vec<&Vertex> = if self.supports(ShardAttribute::VertexIndex) {
            self.vertex_tree()
                .locate_in_envelope(&rect.envelope())
                .filter_map(|entry| self.vertex(entry.data))
                .collect()
        } else {
            self.vertices()
                .filter(|v| rect.contains_location(&v.location))
                .collect()
        };
        found.sort_by_key(|v| v.local_id);
        found
    }

    /// Nearest vertex within `max_distance_m`, optionally restricted to
    /// vertices touching an edge of at least `min_class`.
    pub fn vertex_nearest(
        &self,
        location: &Location,
        max_distance_m: f64,
        min_class: Option<FunctionalClass>,
    ) -> Option<(&Vertex, f64)> {
        self.vertexes_inside(&location.within(max_distance_m))
            .into_iter()
            .filter(|v| match min_class {
                Some(class) => self.touches_class(v.local_id, class),
                None => true,
            })
            .map(|v| (v, v.location.distance_to(location)))
            .filter(|(_, d)| *d <= max_distance_m)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.local_id.cmp(&b.0.local_id)))
    }

    fn touches_class(&self, vertex_local: i64, class: FunctionalClass) -> bool {
        let Some(&idx) = self.vertex_index_map.get(&vertex_local) else {
            return false;
        };
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .chain(self.graph.edges_directed(idx, Direction::Incoming))
            .any(|e| e.weight().functional_class >= class)
    }

    // ------------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------------

    /// Edge by local id; negative ids resolve to the reverse traversal of a
    /// reversible edge.
    pub fn edge(&self, local_id: i64) -> Option<Edge> {
        let stored = self.stored_edge(local_id.abs())?;
        if local_id > 0 {
            Some(stored.clone())
        } else if stored.reversible {
            Some(stored.reversed())
        } else {
            None
        }
    }

    fn stored_edge(&self, local_id: i64) -> Option<&Edge> {
        self.edge_index_map
            .get(&local_id)
            .and_then(|&idx| self.graph.edge_weight(idx))
    }

    pub fn contains_edge(&self, local_id: i64) -> bool {
        self.edge(local_id).is_some()
    }

    /// Every traversable edge: each stored edge, followed by its reverse when
    /// reversible.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.forward_edges().flat_map(|e| {
            std::iter::once(e.clone()).chain(e.reversible.then(|| e.reversed()))
        })
    }

    /// Stored (forward) edges.
    pub fn forward_edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    pub fn edge_for_identifier(&self, identifier: EdgeIdentifier) -> Option<Edge> {
        let local = *self.edges_by_identifier.get(&identifier.forward())?;
        if identifier.is_forward() {
            self.edge(local)
        } else {
            self.edge(-local)
        }
    }

    pub fn contains_way(&self, way: WayIdentifier) -> bool {
        self.edges_by_way.contains_key(&way)
    }

    /// Forward edges of `way`, ordered by section.
    pub fn edges_for_way(&self, way: WayIdentifier) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self
            .edges_by_way
            .get(&way)
            .into_iter()
            .flatten()
            .filter_map(|&local| self.stored_edge(local))
            .collect();
        edges.sort_by_key(|e| e.identifier.section());
        edges
    }

    /// Full polyline of an edge, endpoints included.
    pub fn edge_geometry(&self, edge: &Edge) -> LineString<f64> {
        let mut points = Vec::with_capacity(edge.shape.len() + 2);
        if let Some(v) = self.vertex(edge.from) {
            points.push(v.location);
        }
        points.extend(edge.shape.iter().copied());
        if let Some(v) = self.vertex(edge.to) {
            points.push(v.location);
        }
        LineString::from(
            points
                .into_iter()
                .map(|l| (l.longitude(), l.latitude()))
                .collect::<Vec<_>>(),
        )
    }

    /// Stored edges whose geometry intersects `rect`, ordered by local id.
    pub fn edges_intersecting(&self, rect: &Rect<f64>) -> Vec<&Edge> {
        let candidates: Vec<&Edge> = if self.supports(ShardAttribute::EdgeIndex) {
            self.edge_tree()
                .locate_in_envelope_intersecting(&rect.envelope())
                .filter_map(|entry| self.stored_edge(entry.data))
                .collect()
        } else {
            self.forward_edges().collect()
        };
        let mut found: Vec<&Edge> = candidates
            .into_iter()
            .filter(|e| rect.intersects(&self.edge_geometry(e)))
            .collect();
        found.sort_by_key(|e| e.local_id);
        found
    }

    /// Edges leaving the vertex, reverse traversals included.
    pub fn out_edges(&self, vertex_local: i64) -> Vec<Edge> {
        self.adjacent_edges(vertex_local, Direction::Outgoing)
    }

    /// Edges entering the vertex, reverse traversals included.
    pub fn in_edges(&self, vertex_local: i64) -> Vec<Edge> {
        self.adjacent_edges(vertex_local, Direction::Incoming)
    }

    fn adjacent_edges(&self, vertex_local: i64, direction: Direction) -> Vec<Edge> {
        let Some(&idx) = self.vertex_index_map.get(&vertex_local) else {
            return Vec::new();
        };
        let mut edges: Vec<Edge> = self
            .graph
            .edges_directed(idx, direction)
            .map(|e| e.weight().clone())
            .collect();
        edges.extend(
            self.graph
                .edges_directed(idx, direction.opposite())
                .filter(|e| e.weight().reversible)
                .map(|e| e.weight().reversed()),
        );
        edges
    }

    // ------------------------------------------------------------------------
    // Relations and places
    // ------------------------------------------------------------------------

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn relation(&self, local_id: i64) -> Option<&Relation> {
        self.relations.get(&local_id)
    }

    pub fn contains_relation(&self, local_id: i64) -> bool {
        self.relations.contains_key(&local_id)
    }

    pub fn relation_for_identifier(&self, identifier: RelationIdentifier) -> Option<&Relation> {
        self.relations_by_identifier
            .get(&identifier)
            .and_then(|local| self.relations.get(local))
    }

    pub fn places(&self) -> impl Iterator<Item = &Place> {
        self.places.values()
    }

    pub fn place(&self, local_id: i64) -> Option<&Place> {
        self.places.get(&local_id)
    }

    pub fn places_inside(&self, rect: &Rect<f64>) -> Vec<&Place> {
        let mut found: Vec<&Place> = if self.supports(ShardAttribute::PlaceIndex) {
            self.place_tree()
                .locate_in_envelope(&rect.envelope())
                .filter_map(|entry| self.places.get(&entry.data))
                .collect()
        } else {
            self.places()
                .filter(|p| rect.contains_location(&p.location))
                .collect()
        };
        found.sort_by_key(|p| p.local_id);
        found
    }

    pub fn places_with_population_at_least(&self, population: u64) -> impl Iterator<Item = &Place> {
        self.places().filter(move |p| p.population >= population)
    }

    // ------------------------------------------------------------------------
    // Spatial indexes
    // ------------------------------------------------------------------------

    fn vertex_tree(&self) -> &RTree<PointEntry> {
        self.vertex_tree.get_or_init(|| {
            RTree::bulk_load(
                self.vertices()
                    .map(|v| GeomWithData::new(v.location.as_array(), v.local_id))
                    .collect(),
            )
        })
    }

    fn edge_tree(&self) -> &RTree<EdgeEntry> {
        self.edge_tree.get_or_init(|| {
            let entries = self
                .forward_edges()
                .filter_map(|e| {
                    let line = self.edge_geometry(e);
                    let (mut min, mut max) = ([f64::MAX; 2], [f64::MIN; 2]);
                    for c in line.coords() {
                        min = [min[0].min(c.x), min[1].min(c.y)];
                        max = [max[0].max(c.x), max[1].max(c.y)];
                    }
                    (min[0] <= max[0])
                        .then(|| GeomWithData::new(Envelope::from_corners(min, max), e.local_id))
                })
                .collect();
            RTree::bulk_load(entries)
        })
    }

    fn place_tree(&self) -> &RTree<PointEntry> {
        self.place_tree.get_or_init(|| {
            RTree::bulk_load(
                self.places()
                    .map(|p| GeomWithData::new(p.location.as_array(), p.local_id))
                    .collect(),
            )
        })
    }
}

impl GraphStore for ShardGraph {
    fn save(&self, path: &Path) -> Result<(), GraphError> {
        let store = ShardStore::create(path, self.shard_id)?;
        store.write_graph(self)?;
        Ok(())
    }

    fn unload(&mut self) -> Result<(), GraphError> {
        self.invalidate_indexes();
        Ok(())
    }

    fn load_archive(&mut self, path: &Path) -> Result<(), GraphError> {
        let store = ShardStore::open(path, self.shard_id)?;
        *self = store.read_graph()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rect_from_locations;
    use pretty_assertions::assert_eq;

    fn loc(lat: f64, lon: f64) -> Location {
        Location::from_degrees(lat, lon)
    }

    fn unit_bounds() -> Rect<f64> {
        rect_from_locations(loc(0.0, 0.0), loc(1.0, 1.0))
    }

    /// Triangle a -> b -> c with b -> c reversible.
    fn triangle() -> ShardGraph {
        let mut g = ShardGraph::new(ShardId(1), unit_bounds());
        g.add_vertex(Vertex::new(1, loc(0.1, 0.1)).with_node(NodeIdentifier(100)));
        g.add_vertex(Vertex::new(2, loc(0.1, 0.5)).with_node(NodeIdentifier(200)));
        g.add_vertex(Vertex::new(3, loc(0.5, 0.5)).with_node(NodeIdentifier(300)));

        g.add_edge(
            Edge::new(1, EdgeIdentifier::new(WayIdentifier(10), 0), 1, 2)
                .with_functional_class(FunctionalClass::Local),
        )
        .unwrap();
        g.add_edge(
            Edge::new(2, EdgeIdentifier::new(WayIdentifier(10), 1), 2, 3)
                .reversible()
                .with_functional_class(FunctionalClass::Freeway)
                .with_shape(vec![loc(0.3, 0.55)]),
        )
        .unwrap();
        g
    }

    #[test]
    fn test_counts() {
        let g = triangle();
        assert_eq!(g.vertex_count(), 3);
        assert_eq!(g.forward_edge_count(), 2);
        assert_eq!(g.edge_count(), 3);
        assert_eq!(g.edges().count(), 3);
    }

    #[test]
    fn test_reverse_edge_view() {
        let g = triangle();
        let rev = g.edge(-2).unwrap();
        assert_eq!(rev.local_id, -2);
        assert_eq!((rev.from, rev.to), (3, 2));
        assert!(!rev.identifier.is_forward());

        // One-way edges have no reverse
        assert!(g.edge(-1).is_none());
        assert!(g.contains_edge(-2));
        assert!(!g.contains_edge(-1));
    }

    #[test]
    fn test_edge_for_identifier() {
        let g = triangle();
        let id = EdgeIdentifier::new(WayIdentifier(10), 1);
        assert_eq!(g.edge_for_identifier(id).unwrap().local_id, 2);
        assert_eq!(g.edge_for_identifier(id.reversed()).unwrap().local_id, -2);
        assert!(g
            .edge_for_identifier(EdgeIdentifier::new(WayIdentifier(10), 0).reversed())
            .is_none());
    }

    #[test]
    fn test_adjacency_includes_reverse_traversals() {
        let g = triangle();
        let out_of_c: Vec<i64> = g.out_edges(3).iter().map(|e| e.local_id).collect();
        assert_eq!(out_of_c, vec![-2]);

        let mut into_b: Vec<i64> = g.in_edges(2).iter().map(|e| e.local_id).collect();
        into_b.sort();
        assert_eq!(into_b, vec![-2, 1]);
    }

    #[test]
    fn test_add_edge_requires_endpoints() {
        let mut g = triangle();
        let edge = Edge::new(9, EdgeIdentifier::new(WayIdentifier(11), 0), 1, 99);
        assert!(g.add_edge(edge).is_none());
        let negative = Edge::new(-9, EdgeIdentifier::new(WayIdentifier(11), 0), 1, 2);
        assert!(g.add_edge(negative).is_none());
    }

    #[test]
    fn test_replace_edge_keeps_indexes_consistent() {
        let mut g = triangle();
        g.add_edge(Edge::new(2, EdgeIdentifier::new(WayIdentifier(12), 0), 2, 3))
            .unwrap();
        assert_eq!(g.forward_edge_count(), 2);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.edges_for_way(WayIdentifier(10)).len(), 1);
        assert!(g.contains_way(WayIdentifier(12)));
        assert!(g
            .edge_for_identifier(EdgeIdentifier::new(WayIdentifier(10), 1))
            .is_none());
    }

    #[test]
    fn test_vertexes_inside_and_nearest() {
        let g = triangle();
        let rect = rect_from_locations(loc(0.0, 0.0), loc(0.2, 0.6));
        let ids: Vec<i64> = g.vertexes_inside(&rect).iter().map(|v| v.local_id).collect();
        assert_eq!(ids, vec![1, 2]);

        let (nearest, distance) = g.vertex_nearest(&loc(0.1, 0.11), 5_000.0, None).unwrap();
        assert_eq!(nearest.local_id, 1);
        assert!(distance < 1_200.0);

        // Vertex 1 only touches a local road
        let (freeway_vertex, _) = g
            .vertex_nearest(&loc(0.1, 0.11), 50_000.0, Some(FunctionalClass::Freeway))
            .unwrap();
        assert_eq!(freeway_vertex.local_id, 2);
    }

    #[test]
    fn test_linear_scan_without_vertex_index() {
        let g = triangle().with_attributes(AttributeSet::empty());
        let rect = rect_from_locations(loc(0.0, 0.0), loc(0.2, 0.6));
        assert_eq!(g.vertexes_inside(&rect).len(), 2);
        assert!(!g.is_materialized(ShardAttribute::VertexIndex));
    }

    #[test]
    fn test_edges_intersecting_uses_shape() {
        let g = triangle();
        // Only the shape point of edge 2 lies in this box
        let rect = rect_from_locations(loc(0.29, 0.54), loc(0.31, 0.56));
        let ids: Vec<i64> = g.edges_intersecting(&rect).iter().map(|e| e.local_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_vertex_lookup_by_node_and_location() {
        let g = triangle();
        assert_eq!(g.vertex_for_identifier(NodeIdentifier(200)).unwrap().local_id, 2);
        assert!(g.contains_node(NodeIdentifier(300)));
        assert_eq!(g.vertices_at(&loc(0.5, 0.5)).count(), 1);
        assert_eq!(g.vertices_at(&loc(0.9, 0.9)).count(), 0);
    }

    #[test]
    fn test_load_all_except() {
        let g = triangle();
        g.load_all(AttributeSet::empty().with(ShardAttribute::PlaceIndex));
        assert!(g.is_materialized(ShardAttribute::VertexIndex));
        assert!(g.is_materialized(ShardAttribute::EdgeIndex));
        assert!(!g.is_materialized(ShardAttribute::PlaceIndex));
    }

    #[test]
    fn test_places() {
        let mut g = triangle();
        g.add_place(Place {
            local_id: 1,
            name: "Smallville".to_string(),
            location: loc(0.2, 0.2),
            population: 900,
        });
        g.add_place(Place {
            local_id: 2,
            name: "Metropolis".to_string(),
            location: loc(0.8, 0.8),
            population: 2_000_000,
        });

        let big: Vec<&str> = g
            .places_with_population_at_least(50_000)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(big, vec!["Metropolis"]);

        let rect = rect_from_locations(loc(0.0, 0.0), loc(0.5, 0.5));
        assert_eq!(g.places_inside(&rect).len(), 1);
    }

    #[test]
    fn test_relations() {
        let mut g = triangle();
        g.add_relation(Relation {
            local_id: 1,
            identifier: RelationIdentifier(5000),
            relation_type: "restriction".to_string(),
            members: vec![
                RelationMember::Way {
                    way: WayIdentifier(10),
                    role: "from".to_string(),
                },
                RelationMember::Node {
                    node: NodeIdentifier(200),
                    role: "via".to_string(),
                },
            ],
        });
        assert_eq!(g.relation_count(), 1);
        assert_eq!(
            g.relation_for_identifier(RelationIdentifier(5000))
                .unwrap()
                .members[1]
                .role(),
            "via"
        );
    }

    #[test]
    fn test_attribute_set() {
        let set = AttributeSet::empty()
            .with(ShardAttribute::EdgeIndex)
            .with(ShardAttribute::PlaceIndex);
        assert_eq!(set.to_list(), "edge_index,place_index");
        assert_eq!(AttributeSet::parse_list("edge_index,place_index"), set);
        assert!(!set.contains(ShardAttribute::VertexIndex));
        assert_eq!(AttributeSet::all().iter().count(), 3);
    }
}
