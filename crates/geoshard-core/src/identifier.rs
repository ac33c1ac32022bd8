//! Identifiers for road-network elements.
//!
//! Two families live here:
//! - base identifiers carried over from the source map data (`WayIdentifier`,
//!   `EdgeIdentifier`, `NodeIdentifier`, `RelationIdentifier`), meaningful
//!   across the whole dataset;
//! - `ScopedIdentifier<K>`, a `(shard_id, local_id)` pair that gives a
//!   shard-local id global meaning.
//!
//! # Packed layout
//!
//! ```text
//!  63            43 42                          1   0
//! ┌────────────────┬─────────────────────────────┬───┐
//! │ shard (21 bit) │ |local| (42 bit)            │ s │  s = 1 when local < 0
//! └────────────────┴─────────────────────────────┴───┘
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Number of bits available for the magnitude of a local id.
pub const LOCAL_ID_BITS: u32 = 42;

/// Number of bits available for a shard id.
pub const SHARD_ID_BITS: u32 = 21;

/// Exclusive upper bound on `|local_id|`.
pub const MAX_LOCAL_ID: i64 = 1 << LOCAL_ID_BITS;

/// Exclusive upper bound on shard ids.
pub const MAX_SHARD_ID: u32 = 1 << SHARD_ID_BITS;

/// Edge identifiers reserve this many sections per way.
pub const SECTIONS_PER_WAY: i64 = 1_000_000;

// ============================================================================
// Base identifiers
// ============================================================================

/// Stable id of one grid cell (row-major).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a map way (a polyline that may span several shards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WayIdentifier(pub u64);

impl fmt::Display for WayIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "way/{}", self.0)
    }
}

/// Identifier of a map node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentifier(pub i64);

/// Identifier of a map relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationIdentifier(pub i64);

/// Identifier of one directed edge.
///
/// `way × 1_000_000 + section` for the forward direction; the reverse
/// direction of a two-way edge is the negated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeIdentifier(pub i64);

impl EdgeIdentifier {
    /// Forward identifier for `section` of `way`.
    ///
    /// # Panics
    ///
    /// Panics when the pair has no identifier; see [`EdgeIdentifier::try_new`].
    pub fn new(way: WayIdentifier, section: u32) -> Self {
        match Self::try_new(way, section) {
            Some(identifier) => identifier,
            None => panic!("no edge identifier for section {} of {}", section, way),
        }
    }

    /// Forward identifier for `section` of `way`, or `None` when `section`
    /// is not below `SECTIONS_PER_WAY` or the packed value overflows `i64`.
    pub fn try_new(way: WayIdentifier, section: u32) -> Option<Self> {
        let section = i64::from(section);
        if section >= SECTIONS_PER_WAY {
            return None;
        }
        i64::try_from(way.0)
            .ok()?
            .checked_mul(SECTIONS_PER_WAY)?
            .checked_add(section)
            .map(Self)
    }

    pub fn way(&self) -> WayIdentifier {
        WayIdentifier((self.0.unsigned_abs()) / SECTIONS_PER_WAY as u64)
    }

    pub fn section(&self) -> u32 {
        (self.0.unsigned_abs() % SECTIONS_PER_WAY as u64) as u32
    }

    pub fn is_forward(&self) -> bool {
        self.0 > 0
    }

    pub fn reversed(&self) -> Self {
        Self(-self.0)
    }

    /// The forward-direction identifier.
    pub fn forward(&self) -> Self {
        Self(self.0.abs())
    }
}

impl fmt::Display for EdgeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_forward() { "" } else { "-" };
        write!(f, "{}{}:{}", sign, self.way().0, self.section())
    }
}

// ============================================================================
// Scoped identifiers
// ============================================================================

/// Marker kinds for `ScopedIdentifier`.
pub mod kind {
    #[derive(Debug)]
    pub enum Edge {}
    #[derive(Debug)]
    pub enum Vertex {}
    #[derive(Debug)]
    pub enum Relation {}
    #[derive(Debug)]
    pub enum Place {}
}

/// A `(shard_id, local_id)` pair, globally unique per kind `K`.
///
/// Ordered by `(shard_id, local_id)`.
pub struct ScopedIdentifier<K> {
    shard_id: ShardId,
    local_id: i64,
    _kind: PhantomData<fn() -> K>,
}

pub type ScopedEdgeId = ScopedIdentifier<kind::Edge>;
pub type ScopedVertexId = ScopedIdentifier<kind::Vertex>;
pub type ScopedRelationId = ScopedIdentifier<kind::Relation>;
pub type ScopedPlaceId = ScopedIdentifier<kind::Place>;

impl<K> ScopedIdentifier<K> {
    /// Create a scoped identifier.
    ///
    /// # Panics
    ///
    /// Panics when `shard_id >= 2^21` or `|local_id| >= 2^42`; neither can be
    /// represented in the packed form.
    pub fn make(shard_id: ShardId, local_id: i64) -> Self {
        assert!(
            shard_id.0 < MAX_SHARD_ID,
            "shard id {} does not fit in {} bits",
            shard_id.0,
            SHARD_ID_BITS
        );
        assert!(
            local_id.unsigned_abs() < MAX_LOCAL_ID as u64,
            "local id {} does not fit in {} bits",
            local_id,
            LOCAL_ID_BITS
        );
        Self {
            shard_id,
            local_id,
            _kind: PhantomData,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn local_id(&self) -> i64 {
        self.local_id
    }

    /// Packed representation used in persisted artifacts.
    pub fn as_u64(&self) -> u64 {
        let magnitude = self.local_id.unsigned_abs();
        let sign = u64::from(self.local_id < 0);
        ((self.shard_id.0 as u64) << (LOCAL_ID_BITS + 1)) | (magnitude << 1) | sign
    }

    /// Inverse of [`as_u64`](Self::as_u64).
    pub fn from_u64(packed: u64) -> Self {
        let shard = (packed >> (LOCAL_ID_BITS + 1)) as u32;
        let magnitude = ((packed >> 1) & ((1u64 << LOCAL_ID_BITS) - 1)) as i64;
        let local = if packed & 1 == 1 { -magnitude } else { magnitude };
        Self::make(ShardId(shard), local)
    }
}

impl ScopedIdentifier<kind::Edge> {
    /// The opposite traversal direction of the same edge.
    pub fn reversed(&self) -> Self {
        Self::make(self.shard_id, -self.local_id)
    }

    pub fn is_forward(&self) -> bool {
        self.local_id > 0
    }
}

impl<K> Clone for ScopedIdentifier<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for ScopedIdentifier<K> {}

impl<K> PartialEq for ScopedIdentifier<K> {
    fn eq(&self, other: &Self) -> bool {
        self.shard_id == other.shard_id && self.local_id == other.local_id
    }
}

impl<K> Eq for ScopedIdentifier<K> {}

impl<K> Hash for ScopedIdentifier<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shard_id.hash(state);
        self.local_id.hash(state);
    }
}

impl<K> PartialOrd for ScopedIdentifier<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for ScopedIdentifier<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.shard_id, self.local_id).cmp(&(other.shard_id, other.local_id))
    }
}

impl<K> fmt::Debug for ScopedIdentifier<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedIdentifier")
            .field("shard_id", &self.shard_id.0)
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl<K> fmt::Display for ScopedIdentifier<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shard_id.0, self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_scoped_roundtrip() {
        let cases = [
            (0u32, 0i64),
            (1, 7),
            (1, -7),
            (MAX_SHARD_ID - 1, MAX_LOCAL_ID - 1),
            (MAX_SHARD_ID - 1, -(MAX_LOCAL_ID - 1)),
            (12_345, 987_654_321),
        ];
        for (shard, local) in cases {
            let id = ScopedEdgeId::make(ShardId(shard), local);
            assert_eq!(id.shard_id(), ShardId(shard));
            assert_eq!(id.local_id(), local);

            let unpacked = ScopedEdgeId::from_u64(id.as_u64());
            assert_eq!(unpacked, id);
        }
    }

    #[test]
    fn test_packed_values_are_distinct() {
        let mut seen = HashSet::new();
        for shard in 0..4u32 {
            for local in -3..=3i64 {
                let packed = ScopedVertexId::make(ShardId(shard), local).as_u64();
                assert!(seen.insert(packed), "collision for {shard}:{local}");
            }
        }
    }

    #[test]
    fn test_ordering_is_shard_then_local() {
        let mut ids = vec![
            ScopedRelationId::make(ShardId(2), 1),
            ScopedRelationId::make(ShardId(1), 9),
            ScopedRelationId::make(ShardId(1), -4),
        ];
        ids.sort();
        let pairs: Vec<_> = ids.iter().map(|i| (i.shard_id().0, i.local_id())).collect();
        assert_eq!(pairs, vec![(1, -4), (1, 9), (2, 1)]);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_local_id_overflow_panics() {
        let _ = ScopedEdgeId::make(ShardId(0), MAX_LOCAL_ID);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_shard_id_overflow_panics() {
        let _ = ScopedEdgeId::make(ShardId(MAX_SHARD_ID), 1);
    }

    #[test]
    fn test_edge_reversed() {
        let id = ScopedEdgeId::make(ShardId(3), 12);
        assert!(id.is_forward());
        let rev = id.reversed();
        assert_eq!(rev.local_id(), -12);
        assert!(!rev.is_forward());
        assert_eq!(rev.reversed(), id);
        assert_eq!(rev.to_string(), "3:-12");
    }

    #[test]
    fn test_edge_identifier_encoding() {
        let id = EdgeIdentifier::new(WayIdentifier(42), 3);
        assert_eq!(id.0, 42_000_003);
        assert_eq!(id.way(), WayIdentifier(42));
        assert_eq!(id.section(), 3);
        assert!(id.is_forward());

        let rev = id.reversed();
        assert!(!rev.is_forward());
        assert_eq!(rev.way(), WayIdentifier(42));
        assert_eq!(rev.section(), 3);
        assert_eq!(rev.forward(), id);
        assert_eq!(rev.to_string(), "-42:3");
    }

    #[test]
    fn test_edge_identifier_range() {
        let largest = WayIdentifier(i64::MAX as u64 / SECTIONS_PER_WAY as u64);
        let last = EdgeIdentifier::try_new(largest, 775_807).unwrap();
        assert_eq!(last.0, i64::MAX);
        assert_eq!(last.way(), largest);

        assert_eq!(EdgeIdentifier::try_new(largest, 775_808), None);
        assert_eq!(EdgeIdentifier::try_new(WayIdentifier(largest.0 + 1), 0), None);
        assert_eq!(EdgeIdentifier::try_new(WayIdentifier(u64::MAX), 0), None);
        assert_eq!(EdgeIdentifier::try_new(WayIdentifier(1), 1_000_000), None);
    }

    #[test]
    #[should_panic(expected = "no edge identifier")]
    fn test_edge_identifier_new_rejects_overflow() {
        EdgeIdentifier::new(WayIdentifier(u64::MAX), 0);
    }
}
