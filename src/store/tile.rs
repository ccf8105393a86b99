//! Tile cache.
//!
//! Each hypercube owns one `TileCache`: a bounded LRU of decoded tile
//! buffers keyed by linear tile index. The capacity is driven by the
//! caller's access pattern: for a slice swept along a given axis
//! order, the cache is sized so a full traversal fetches each tile at
//! most once, truncated by a byte cap. Statistics are kept per cube
//! and reported on request.

use crate::cache::LruCache;

/// Access statistics of one tile cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub n_access: u64,
    pub n_hit: u64,
    pub n_miss: u64,
    pub n_write: u64,
}

pub(crate) struct CachedTile {
    pub bytes: Vec<u8>,
    pub dirty: bool,
}

/// Bounded cache of tile buffers for one hypercube.
pub struct TileCache {
    cache: LruCache<u64, CachedTile>,
    tile_bytes: usize,
    max_cache_bytes: usize,
    stats: CacheStats,
}

impl TileCache {
    pub fn new(tile_bytes: usize, max_cache_bytes: usize) -> Self {
        Self {
            cache: LruCache::new(1),
            tile_bytes,
            max_cache_bytes,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn set_max_bytes(&mut self, max_cache_bytes: usize) {
        self.max_cache_bytes = max_cache_bytes;
    }

    fn cap_tiles(&self, wanted: u64) -> usize {
        let byte_cap = (self.max_cache_bytes / self.tile_bytes.max(1)).max(1) as u64;
        wanted.clamp(1, byte_cap) as usize
    }

    /// Resize for an access pattern: the number of distinct tiles
    /// touched while sweeping `slice_tile_counts` (tiles touched per
    /// axis) in `axis_path` order, excluding the slowest-varying axis.
    /// That is the smallest capacity under which one full traversal
    /// visits each tile exactly once.
    ///
    /// Returns the tiles evicted by a shrink so the cube can write
    /// them back.
    pub fn resize_for_access(
        &mut self,
        slice_tile_counts: &[u64],
        axis_path: &[usize],
    ) -> Vec<(u64, Vec<u8>)> {
        let slowest = axis_path.last().copied();
        let mut wanted: u64 = 1;
        for (axis, &t) in slice_tile_counts.iter().enumerate() {
            if Some(axis) != slowest {
                wanted = wanted.saturating_mul(t.max(1));
            }
        }
        let cap = self.cap_tiles(wanted);
        tracing::trace!(cap, wanted, "tile cache resized");
        self.cache
            .set_capacity(cap)
            .into_iter()
            .filter(|(_, t)| t.dirty)
            .map(|(id, t)| (id, t.bytes))
            .collect()
    }

    /// Look up a tile, counting the access. A hit refreshes recency.
    pub(crate) fn get_mut(&mut self, tile: u64) -> Option<&mut CachedTile> {
        self.stats.n_access += 1;
        if self.cache.contains(&tile) {
            self.stats.n_hit += 1;
            self.cache.get_mut(&tile)
        } else {
            self.stats.n_miss += 1;
            None
        }
    }

    /// Insert a freshly read tile; the evicted dirty pair (if any) is
    /// returned for write-back.
    pub(crate) fn insert(&mut self, tile: u64, t: CachedTile) -> Option<(u64, Vec<u8>)> {
        match self.cache.put(tile, t) {
            Some((id, old)) if old.dirty => Some((id, old.bytes)),
            _ => None,
        }
    }

    pub(crate) fn record_write(&mut self) {
        self.stats.n_write += 1;
    }

    /// Drop every entry, returning the dirty ones for write-back.
    /// Values re-read after a clear must be identical; only the
    /// statistics may differ.
    pub fn clear(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.cache
            .drain()
            .into_iter()
            .filter(|(_, t)| t.dirty)
            .map(|(id, t)| (id, t.bytes))
            .collect()
    }

    /// Dirty entries without dropping anything (flush support).
    pub(crate) fn dirty_tiles(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.cache
            .iter_mut()
            .filter(|(_, t)| t.dirty)
            .map(|(id, t)| {
                t.dirty = false;
                (*id, t.bytes.clone())
            })
            .collect()
    }
}

/// Tiles touched along each axis by a slice `[start, start+len)` with
/// the given tile extent.
pub fn tiles_touched(start: &[u64], length: &[u64], tile_shape: &[u64]) -> Vec<u64> {
    start
        .iter()
        .zip(length)
        .zip(tile_shape)
        .map(|((&s, &l), &t)| {
            if l == 0 {
                0
            } else {
                let first = s / t;
                let last = (s + l - 1) / t;
                last - first + 1
            }
        })
        .collect()
}

impl TileCache {
    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }
}
