//! Shard-scoped element views and boundary stitching.
//!
//! A `Scoped<T>` pairs an element of one shard's sub-graph with its owning
//! cell and a handle to the grid, so it can reach neighbor cells. Vertices
//! that were clipped at a cell boundary exist once per touching shard; the
//! scoped views reassemble them:
//!
//! - clipped or synthetic vertices compare by `(location, grade)`
//! - a clipped vertex's adjacency is the union over its equivalents in the
//!   owning and nearby cells
//! - relation members are resolved across neighbor cells, with one way member
//!   per shard-local fragment of a boundary-crossing way
//!
//! Equivalence is computed on demand and never cached.

use crate::error::GraphError;
use crate::geometry::Location;
use crate::graph::{
    Edge, FunctionalClass, GradeSeparation, Relation, RelationMember, RoadEdge, RoadVertex,
    ShardGraph, Vertex,
};
use crate::identifier::{
    EdgeIdentifier, NodeIdentifier, RelationIdentifier, ScopedEdgeId, ScopedRelationId,
    ScopedVertexId, ShardId, WayIdentifier,
};
use crate::sharding::cell::Cell;
use crate::sharding::grid::Grid;
use geo::LineString;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub use crate::sharding::index::ScopedPlace;

/// An element of one shard's sub-graph together with its owning cell.
#[derive(Clone)]
pub struct Scoped<T> {
    grid: Arc<Grid>,
    cell: Arc<Cell>,
    graph: Arc<ShardGraph>,
    value: T,
}

pub type ScopedVertex = Scoped<Vertex>;
pub type ScopedEdge = Scoped<Edge>;
pub type ScopedRelation = Scoped<Relation>;

impl<T> Scoped<T> {
    pub(crate) fn new(grid: Arc<Grid>, cell: Arc<Cell>, graph: Arc<ShardGraph>, value: T) -> Self {
        Self {
            grid,
            cell,
            graph,
            value,
        }
    }

    pub fn cell(&self) -> &Arc<Cell> {
        &self.cell
    }

    pub fn shard_id(&self) -> ShardId {
        self.cell.shard_id()
    }

    /// The wrapped shard-local element.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    /// The sub-graph the element was read from.
    pub fn sub_graph(&self) -> &Arc<ShardGraph> {
        &self.graph
    }

    fn rescope<U>(&self, value: U) -> Scoped<U> {
        Scoped::new(
            Arc::clone(&self.grid),
            Arc::clone(&self.cell),
            Arc::clone(&self.graph),
            value,
        )
    }

    /// Loaded sub-graphs of the cells within the stitching tolerance of
    /// `location`, by shard id.
    fn nearby_graphs(&self, location: &Location) -> Result<Vec<(Arc<Cell>, Arc<ShardGraph>)>, GraphError> {
        self.grid
            .neighbors(location, self.grid.boundary_tolerance_meters())
            .into_iter()
            .map(|cell| -> Result<_, GraphError> {
                let graph = if cell.shard_id() == self.shard_id() {
                    Arc::clone(&self.graph)
                } else {
                    self.grid.sub_graph(&cell)?
                };
                Ok((cell, graph))
            })
            .collect()
    }
}

impl<T: fmt::Debug> fmt::Debug for Scoped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped")
            .field("shard_id", &self.shard_id())
            .field("value", &self.value)
            .finish()
    }
}

// ============================================================================
// Vertices
// ============================================================================

impl Scoped<Vertex> {
    pub fn id(&self) -> ScopedVertexId {
        ScopedVertexId::make(self.shard_id(), self.value.local_id)
    }

    /// Whether this vertex has copies in other shards.
    pub fn is_boundary(&self) -> bool {
        self.value.clipped || self.value.synthetic
    }

    /// Every representation of this vertex across the owning and nearby
    /// cells, by shard id. A vertex that is neither clipped nor synthetic is
    /// its own single equivalent.
    pub fn equivalents(&self) -> Result<Vec<ScopedVertex>, GraphError> {
        if !self.is_boundary() {
            return Ok(vec![self.clone()]);
        }

        let location = self.value.location;
        let grade = self.value.grade;
        let mut found = Vec::new();
        for (cell, graph) in self.nearby_graphs(&location)? {
            let matching: Vec<Vertex> = graph
                .vertices_at(&location)
                .filter(|v| v.grade == grade)
                .cloned()
                .collect();
            for vertex in matching {
                found.push(Scoped::new(
                    Arc::clone(&self.grid),
                    Arc::clone(&cell),
                    Arc::clone(&graph),
                    vertex,
                ));
            }
        }
        found.sort_by_key(|v| v.id());
        Ok(found)
    }

    /// Edges leaving this vertex, gathered across its equivalents.
    pub fn out_edges(&self) -> Result<Vec<ScopedEdge>, GraphError> {
        self.adjacent(ShardGraph::out_edges)
    }

    /// Edges entering this vertex, gathered across its equivalents.
    pub fn in_edges(&self) -> Result<Vec<ScopedEdge>, GraphError> {
        self.adjacent(ShardGraph::in_edges)
    }

    pub fn out_degree(&self) -> Result<usize, GraphError> {
        Ok(self.out_edges()?.len())
    }

    pub fn in_degree(&self) -> Result<usize, GraphError> {
        Ok(self.in_edges()?.len())
    }

    fn adjacent(&self, edges_of: fn(&ShardGraph, i64) -> Vec<Edge>) -> Result<Vec<ScopedEdge>, GraphError> {
        let mut edges = Vec::new();
        for vertex in self.equivalents()? {
            edges.extend(
                edges_of(&vertex.graph, vertex.value.local_id)
                    .into_iter()
                    .map(|e| vertex.rescope(e)),
            );
        }
        Ok(edges)
    }
}

impl PartialEq for Scoped<Vertex> {
    fn eq(&self, other: &Self) -> bool {
        if self.is_boundary() || other.is_boundary() {
            self.value.location == other.value.location && self.value.grade == other.value.grade
        } else {
            self.id() == other.id()
        }
    }
}

impl Eq for Scoped<Vertex> {}

impl Hash for Scoped<Vertex> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Consistent with both equality rules: equal vertices share a location
        self.value.location.hash(state);
        self.value.grade.hash(state);
    }
}

impl RoadVertex for Scoped<Vertex> {
    fn location(&self) -> Location {
        self.value.location
    }

    fn grade_separation(&self) -> GradeSeparation {
        self.value.grade
    }

    fn is_clipped(&self) -> bool {
        self.value.clipped
    }

    fn is_synthetic(&self) -> bool {
        self.value.synthetic
    }

    fn node_identifier(&self) -> Option<NodeIdentifier> {
        self.value.node
    }
}

// ============================================================================
// Edges
// ============================================================================

impl Scoped<Edge> {
    /// Scoped id; negative local ids denote reverse traversals.
    pub fn id(&self) -> ScopedEdgeId {
        ScopedEdgeId::make(self.shard_id(), self.value.local_id)
    }

    pub fn from_vertex(&self) -> Option<ScopedVertex> {
        self.graph
            .vertex(self.value.from)
            .map(|v| self.rescope(v.clone()))
    }

    pub fn to_vertex(&self) -> Option<ScopedVertex> {
        self.graph.vertex(self.value.to).map(|v| self.rescope(v.clone()))
    }

    /// The opposite traversal, if the edge is reversible.
    pub fn reversed(&self) -> Option<ScopedEdge> {
        self.value
            .reversible
            .then(|| self.rescope(self.value.reversed()))
    }

    pub fn geometry(&self) -> LineString<f64> {
        self.graph.edge_geometry(&self.value)
    }
}

impl PartialEq for Scoped<Edge> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Scoped<Edge> {}

impl Hash for Scoped<Edge> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl RoadEdge for Scoped<Edge> {
    fn identifier(&self) -> EdgeIdentifier {
        self.value.identifier
    }

    fn functional_class(&self) -> FunctionalClass {
        self.value.functional_class
    }

    fn length_meters(&self) -> f64 {
        self.value.length_m
    }

    fn is_reversible(&self) -> bool {
        self.value.reversible
    }

    fn shape(&self) -> &[Location] {
        &self.value.shape
    }
}

// ============================================================================
// Relations
// ============================================================================

/// A relation member resolved against the grid.
#[derive(Debug, Clone)]
pub enum ScopedMember {
    /// One shard-local fragment of a way, ordered by section
    Way { role: String, route: Vec<ScopedEdge> },
    Node { role: String, vertex: ScopedVertex },
}

impl ScopedMember {
    pub fn role(&self) -> &str {
        match self {
            ScopedMember::Way { role, .. } | ScopedMember::Node { role, .. } => role,
        }
    }

    /// Shard the member was resolved in.
    pub fn shard_id(&self) -> Option<ShardId> {
        match self {
            ScopedMember::Way { route, .. } => route.first().map(Scoped::shard_id),
            ScopedMember::Node { vertex, .. } => Some(vertex.shard_id()),
        }
    }
}

impl Scoped<Relation> {
    pub fn id(&self) -> ScopedRelationId {
        ScopedRelationId::make(self.shard_id(), self.value.local_id)
    }

    pub fn identifier(&self) -> RelationIdentifier {
        self.value.identifier
    }

    pub fn relation_type(&self) -> &str {
        &self.value.relation_type
    }

    /// Members resolved in the owning cell or its neighbors. Members that no
    /// reachable shard contains are left out.
    pub fn members(&self) -> Result<Vec<ScopedMember>, GraphError> {
        let mut resolved = Vec::with_capacity(self.value.members.len());
        for member in &self.value.members {
            match member {
                RelationMember::Way { way, role } => {
                    resolved.extend(self.resolve_way(*way, role)?);
                }
                RelationMember::Node { node, role } => {
                    if let Some(vertex) = self.resolve_node(*node)? {
                        resolved.push(ScopedMember::Node {
                            role: role.clone(),
                            vertex,
                        });
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Owning cell first, then neighbors in shard id order.
    fn candidate_graphs(&self) -> impl Iterator<Item = Result<(Arc<Cell>, Arc<ShardGraph>), GraphError>> + '_ {
        let own = std::iter::once(Ok((Arc::clone(&self.cell), Arc::clone(&self.graph))));
        let neighbors = self
            .cell
            .neighbor_shard_ids()
            .iter()
            .filter_map(|id| self.grid.cell(*id))
            .map(|cell| -> Result<_, GraphError> { Ok((Arc::clone(cell), self.grid.sub_graph(cell)?)) });
        own.chain(neighbors)
    }

    fn route_in(&self, cell: &Arc<Cell>, graph: &Arc<ShardGraph>, way: WayIdentifier) -> Vec<ScopedEdge> {
        graph
            .edges_for_way(way)
            .into_iter()
            .map(|e| {
                Scoped::new(
                    Arc::clone(&self.grid),
                    Arc::clone(cell),
                    Arc::clone(graph),
                    e.clone(),
                )
            })
            .collect()
    }

    fn resolve_way(&self, way: WayIdentifier, role: &str) -> Result<Vec<ScopedMember>, GraphError> {
        let mut resolved_in = None;
        for candidate in self.candidate_graphs() {
            let (cell, graph) = candidate?;
            if graph.contains_way(way) {
                resolved_in = Some((cell, graph));
                break;
            }
        }
        let Some((cell, graph)) = resolved_in else {
            return Ok(Vec::new());
        };

        let route = self.route_in(&cell, &graph, way);
        let crosses_boundary = route
            .first()
            .and_then(|e| e.from_vertex())
            .is_some_and(|v| v.value.clipped)
            || route
                .last()
                .and_then(|e| e.to_vertex())
                .is_some_and(|v| v.value.clipped);

        let mut members = vec![ScopedMember::Way {
            role: role.to_string(),
            route,
        }];

        if crosses_boundary {
            for id in self.cell.neighbor_shard_ids() {
                if *id == cell.shard_id() {
                    continue;
                }
                let Some(other) = self.grid.cell(*id) else {
                    continue;
                };
                let other_graph = self.grid.sub_graph(other)?;
                if other_graph.contains_way(way) {
                    members.push(ScopedMember::Way {
                        role: role.to_string(),
                        route: self.route_in(other, &other_graph, way),
                    });
                }
            }
        }

        Ok(members)
    }

    fn resolve_node(&self, node: NodeIdentifier) -> Result<Option<ScopedVertex>, GraphError> {
        for candidate in self.candidate_graphs() {
            let (cell, graph) = candidate?;
            if let Some(vertex) = graph.vertex_for_identifier(node) {
                let vertex = vertex.clone();
                return Ok(Some(Scoped::new(Arc::clone(&self.grid), cell, graph, vertex)));
            }
        }
        Ok(None)
    }
}

impl PartialEq for Scoped<Relation> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Scoped<Relation> {}
