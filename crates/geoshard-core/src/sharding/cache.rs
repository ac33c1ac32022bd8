//! Memory Budget Cache
//!
//! LRU bookkeeping with byte-level memory tracking for loaded cells. The grid
//! consults it before each load and unloads the least recently used cells when
//! the budget would be exceeded.
//!
//! Thread-safe via interior mutability using parking_lot::Mutex.

use crate::identifier::ShardId;
use lru::LruCache;
use parking_lot::Mutex;

/// Constants for memory estimation
const VERTEX_BASE_SIZE: usize = 96; // Vertex + lookup map entries
const EDGE_BASE_SIZE: usize = 160; // Edge + shape + lookup map entries
const GRAPH_OVERHEAD: f64 = 1.4; // petgraph and rtree overhead factor

/// Default memory budget (2 GB)
const DEFAULT_MEMORY_BUDGET: usize = 2 * 1024 * 1024 * 1024;

/// Minimum cells to keep loaded (avoid thrashing)
const DEFAULT_MIN_CELLS: usize = 2;

/// Memory footprint of a loaded cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellMemory {
    pub estimated_bytes: usize,
}

impl CellMemory {
    /// Estimate from element counts
    pub fn new(vertex_count: usize, edge_count: usize) -> Self {
        Self::from_bytes(estimate_memory(vertex_count, edge_count))
    }

    /// Use a known byte size (from the global index)
    pub fn from_bytes(estimated_bytes: usize) -> Self {
        Self { estimated_bytes }
    }
}

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    /// Number of cache hits (cell already loaded)
    pub hits: u64,
    /// Number of cache misses (cell needed loading)
    pub misses: u64,
    /// Number of cells evicted
    pub evictions: u64,
    /// Total bytes evicted
    pub bytes_evicted: usize,
}

impl CacheMetrics {
    /// Get hit rate (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self, bytes: usize) {
        self.evictions += 1;
        self.bytes_evicted += bytes;
    }
}

/// Inner state for MemoryBudgetCache (protected by Mutex)
struct CacheState {
    /// Current estimated memory usage in bytes
    current_memory_bytes: usize,

    /// Most recently used cells are at the front
    cell_lru: LruCache<ShardId, CellMemory>,

    metrics: CacheMetrics,
}

/// Memory budget cache with LRU eviction
///
/// Tracks loaded cells and their memory footprint. It never holds graphs
/// itself: callers ask for eviction candidates and unload those cells.
pub struct MemoryBudgetCache {
    max_memory_bytes: usize,
    min_cells: usize,
    state: Mutex<CacheState>,
}

impl MemoryBudgetCache {
    /// Create a new cache with the given memory budget
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            max_memory_bytes,
            min_cells: DEFAULT_MIN_CELLS,
            state: Mutex::new(CacheState {
                current_memory_bytes: 0,
                // Eviction is driven by bytes, not entry count
                cell_lru: LruCache::unbounded(),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// Create a cache with the default memory budget (2 GB)
    pub fn with_default_budget() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET)
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_bytes
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.state.lock().current_memory_bytes
    }

    /// Get a snapshot of cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().metrics.clone()
    }

    /// Mark a cell as accessed (updates LRU order)
    ///
    /// Returns true if the cell was tracked (hit), false otherwise (miss).
    pub fn touch(&self, shard_id: ShardId) -> bool {
        let mut state = self.state.lock();
        if state.cell_lru.get(&shard_id).is_some() {
            state.metrics.record_hit();
            true
        } else {
            state.metrics.record_miss();
            false
        }
    }

    /// Record that a cell has been loaded
    pub fn record_loaded(&self, shard_id: ShardId, memory: CellMemory) {
        let mut state = self.state.lock();
        state.current_memory_bytes += memory.estimated_bytes;
        if let Some(previous) = state.cell_lru.put(shard_id, memory) {
            state.current_memory_bytes = state
                .current_memory_bytes
                .saturating_sub(previous.estimated_bytes);
        }
    }

    /// Stop tracking a cell, counting it as an eviction
    pub fn remove(&self, shard_id: ShardId) -> Option<CellMemory> {
        let mut state = self.state.lock();
        let memory = state.cell_lru.pop(&shard_id)?;
        state.current_memory_bytes = state
            .current_memory_bytes
            .saturating_sub(memory.estimated_bytes);
        state.metrics.record_eviction(memory.estimated_bytes);
        Some(memory)
    }

    /// Bytes that must be freed before loading `additional_bytes` more
    pub fn memory_needed_for(&self, additional_bytes: usize) -> usize {
        let current = self.state.lock().current_memory_bytes;
        (current + additional_bytes).saturating_sub(self.max_memory_bytes)
    }

    /// Cells to evict to free `needed_bytes`, least recently used first
    ///
    /// Respects `min_cells`; may return fewer bytes than needed.
    pub fn get_eviction_candidates_for(&self, needed_bytes: usize) -> Vec<ShardId> {
        if needed_bytes == 0 {
            return vec![];
        }

        let state = self.state.lock();
        let mut candidates = Vec::new();
        let mut bytes_freed = 0usize;
        let mut remaining = state.cell_lru.len();

        // LruCache::iter() returns MRU first, so .rev() gives LRU first
        for (shard_id, memory) in state.cell_lru.iter().rev() {
            if bytes_freed >= needed_bytes || remaining <= self.min_cells {
                break;
            }
            candidates.push(*shard_id);
            bytes_freed += memory.estimated_bytes;
            remaining -= 1;
        }

        candidates
    }
}

/// Estimate the in-memory footprint of a sub-graph
pub fn estimate_memory(vertex_count: usize, edge_count: usize) -> usize {
    let base = vertex_count * VERTEX_BASE_SIZE + edge_count * EDGE_BASE_SIZE;
    (base as f64 * GRAPH_OVERHEAD) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_estimation() {
        // (1000 * 96 + 500 * 160) * 1.4 = 246400
        assert_eq!(estimate_memory(1000, 500), 246_400);
    }

    #[test]
    fn test_cache_record_loaded() {
        let cache = MemoryBudgetCache::new(10_000_000);
        let memory = CellMemory::new(100, 50);
        let expected = memory.estimated_bytes;

        cache.record_loaded(ShardId(1), memory);

        assert_eq!(cache.current_memory_bytes(), expected);
        assert!(cache.touch(ShardId(1)));
    }

    #[test]
    fn test_record_loaded_twice_does_not_double_count() {
        let cache = MemoryBudgetCache::new(10_000_000);
        cache.record_loaded(ShardId(1), CellMemory::from_bytes(1_000));
        cache.record_loaded(ShardId(1), CellMemory::from_bytes(1_000));
        assert_eq!(cache.current_memory_bytes(), 1_000);
    }

    #[test]
    fn test_cache_touch() {
        let cache = MemoryBudgetCache::new(10_000_000);
        cache.record_loaded(ShardId(1), CellMemory::new(100, 50));

        assert!(cache.touch(ShardId(1)));
        assert!(!cache.touch(ShardId(2)));

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_remove_counts_eviction() {
        let cache = MemoryBudgetCache::new(10_000_000);
        cache.record_loaded(ShardId(1), CellMemory::from_bytes(4_096));

        assert!(cache.remove(ShardId(1)).is_some());
        assert!(cache.remove(ShardId(1)).is_none());
        assert_eq!(cache.current_memory_bytes(), 0);

        let metrics = cache.metrics();
        assert_eq!(metrics.evictions, 1);
        assert_eq!(metrics.bytes_evicted, 4_096);
    }

    #[test]
    fn test_eviction_candidates_are_lru_first() {
        let cache = MemoryBudgetCache::new(25_000);
        cache.record_loaded(ShardId(1), CellMemory::from_bytes(10_000));
        cache.record_loaded(ShardId(2), CellMemory::from_bytes(10_000));
        cache.record_loaded(ShardId(3), CellMemory::from_bytes(10_000));

        // LRU order is now 2, 3, 1
        cache.touch(ShardId(1));

        let needed = cache.memory_needed_for(0);
        assert_eq!(needed, 5_000);
        assert_eq!(cache.get_eviction_candidates_for(needed), vec![ShardId(2)]);
    }

    #[test]
    fn test_min_cells_respected() {
        let cache = MemoryBudgetCache::new(1_000);
        for id in 0..3 {
            cache.record_loaded(ShardId(id), CellMemory::from_bytes(1_000));
        }

        let candidates = cache.get_eviction_candidates_for(cache.memory_needed_for(0));
        assert_eq!(candidates.len(), 1);
    }
}
