//! Bucket allocator and cache.
//!
//! A bucket is a fixed-size run of contiguous pages in one storage
//! manager's data file. The allocator keeps a free list and a
//! high-water mark; freed IDs are reused before fresh ones. Decoded
//! bucket images live in an LRU cache with dirty write-back on
//! eviction and flush. Free-list and high-water state persist in the
//! owning SM's header record, so the union of free and live IDs is
//! always exactly `[0, high_water)`.

use std::collections::BTreeSet;
use std::path::Path;

use crate::cache::LruCache;
use crate::io::{PagedFile, PageId};
use crate::{Result, TableError};

/// Bucket identifier within one SM file.
pub type BucketId = u32;

struct CachedBucket {
    bytes: Vec<u8>,
    dirty: bool,
}

/// Fixed-size bucket pool over a paged file.
pub struct BucketStore {
    file: PagedFile,
    bucket_size: usize,
    pages_per_bucket: u32,
    free_list: BTreeSet<BucketId>,
    high_water: BucketId,
    cache: LruCache<BucketId, CachedBucket>,
}

impl BucketStore {
    /// Create a fresh store (new SM file).
    pub fn create(
        path: &Path,
        page_size: usize,
        bucket_size: usize,
        cache_buckets: usize,
    ) -> Result<Self> {
        let file = PagedFile::create(path, page_size)?;
        Ok(Self {
            file,
            bucket_size,
            pages_per_bucket: Self::pages_per_bucket(page_size, bucket_size),
            free_list: BTreeSet::new(),
            high_water: 0,
            cache: LruCache::new(cache_buckets),
        })
    }

    /// Open an existing store with allocator state recovered from the
    /// owning SM's persisted record.
    pub fn open(
        path: &Path,
        page_size: usize,
        bucket_size: usize,
        cache_buckets: usize,
        free_list: impl IntoIterator<Item = BucketId>,
        high_water: BucketId,
        writable: bool,
    ) -> Result<Self> {
        let file = PagedFile::open(path, page_size, writable)?;
        let pages_per_bucket = Self::pages_per_bucket(page_size, bucket_size);
        if file.n_pages() < high_water * pages_per_bucket {
            return Err(TableError::Corrupt(format!(
                "{}: file holds {} pages, allocator high water needs {}",
                path.display(),
                file.n_pages(),
                high_water * pages_per_bucket
            )));
        }
        let free_list: BTreeSet<BucketId> = free_list.into_iter().collect();
        if let Some(&max_free) = free_list.iter().next_back() {
            if max_free >= high_water {
                return Err(TableError::Corrupt(format!(
                    "free bucket {max_free} at or above high water {high_water}"
                )));
            }
        }
        Ok(Self {
            file,
            bucket_size,
            pages_per_bucket,
            free_list,
            high_water,
            cache: LruCache::new(cache_buckets),
        })
    }

    fn pages_per_bucket(page_size: usize, bucket_size: usize) -> u32 {
        (bucket_size.div_ceil(page_size)) as u32
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn high_water(&self) -> BucketId {
        self.high_water
    }

    pub fn free_list(&self) -> impl Iterator<Item = BucketId> + '_ {
        self.free_list.iter().copied()
    }

    /// Number of live (allocated, not freed) buckets.
    pub fn n_live(&self) -> u32 {
        self.high_water - self.free_list.len() as u32
    }

    fn first_page(&self, id: BucketId) -> PageId {
        id * self.pages_per_bucket
    }

    fn check_live(&self, id: BucketId) -> Result<()> {
        if id >= self.high_water || self.free_list.contains(&id) {
            return Err(TableError::Corrupt(format!(
                "access to unallocated bucket {id}"
            )));
        }
        Ok(())
    }

    /// Allocate a bucket: reuse the lowest free ID, else mint a fresh
    /// one. The new image is zero-filled and cached dirty.
    pub fn allocate(&mut self) -> Result<BucketId> {
        let id = match self.free_list.iter().next().copied() {
            Some(id) => {
                self.free_list.remove(&id);
                id
            }
            None => {
                let id = self.high_water;
                self.file.allocate_pages(self.pages_per_bucket)?;
                self.high_water += 1;
                id
            }
        };
        tracing::trace!(bucket = id, "allocated bucket");
        self.install(id, vec![0u8; self.bucket_size], true)?;
        Ok(id)
    }

    /// Return a bucket to the free list, dropping any cached image.
    pub fn free(&mut self, id: BucketId) -> Result<()> {
        self.check_live(id)?;
        self.cache.remove(&id);
        self.free_list.insert(id);
        tracing::trace!(bucket = id, "freed bucket");
        Ok(())
    }

    /// Read access to a bucket image.
    pub fn get(&mut self, id: BucketId) -> Result<&[u8]> {
        self.ensure_cached(id)?;
        Ok(self
            .cache
            .get(&id)
            .map(|b| b.bytes.as_slice())
            .unwrap_or_default())
    }

    /// Write access to a bucket image; marks it dirty.
    pub fn get_mut(&mut self, id: BucketId) -> Result<&mut Vec<u8>> {
        self.ensure_cached(id)?;
        let b = self
            .cache
            .get_mut(&id)
            .ok_or_else(|| TableError::Corrupt(format!("bucket {id} lost from cache")))?;
        b.dirty = true;
        Ok(&mut b.bytes)
    }

    /// Replace a bucket image wholesale.
    pub fn put(&mut self, id: BucketId, bytes: Vec<u8>) -> Result<()> {
        self.check_live(id)?;
        debug_assert_eq!(bytes.len(), self.bucket_size);
        self.install(id, bytes, true)
    }

    fn ensure_cached(&mut self, id: BucketId) -> Result<()> {
        self.check_live(id)?;
        if self.cache.contains(&id) {
            return Ok(());
        }
        let raw = self
            .file
            .read_pages(self.first_page(id), self.pages_per_bucket)?;
        let bytes = raw[..self.bucket_size].to_vec();
        self.install(id, bytes, false)
    }

    fn install(&mut self, id: BucketId, bytes: Vec<u8>, dirty: bool) -> Result<()> {
        if let Some((evicted_id, evicted)) = self.cache.put(id, CachedBucket { bytes, dirty }) {
            self.write_back(evicted_id, evicted)?;
        }
        Ok(())
    }

    fn write_back(&mut self, id: BucketId, bucket: CachedBucket) -> Result<()> {
        if !bucket.dirty {
            return Ok(());
        }
        let mut image = bucket.bytes;
        image.resize(self.pages_per_bucket as usize * self.file.page_size(), 0);
        self.file.write_pages(self.first_page(id), &image)
    }

    /// Write all dirty cached buckets and flush the file.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<(BucketId, Vec<u8>)> = self
            .cache
            .iter_mut()
            .filter(|(_, b)| b.dirty)
            .map(|(id, b)| {
                b.dirty = false;
                (*id, b.bytes.clone())
            })
            .collect();
        for (id, bytes) in dirty {
            self.write_back(id, CachedBucket { bytes, dirty: true })?;
        }
        self.file.flush()
    }

    /// Durability barrier on the underlying file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_store(dir: &Path) -> BucketStore {
        BucketStore::create(&dir.join("t.f0"), 512, 1024, 4).unwrap()
    }

    #[test]
    fn test_allocate_and_round_trip() {
        let dir = tempdir().unwrap();
        let mut s = new_store(dir.path());

        let a = s.allocate().unwrap();
        let b = s.allocate().unwrap();
        assert_eq!((a, b), (0, 1));

        s.get_mut(a).unwrap()[0] = 0x11;
        s.get_mut(b).unwrap()[1023] = 0x22;
        s.flush().unwrap();

        let free: Vec<_> = s.free_list().collect();
        let hw = s.high_water();
        drop(s);

        let mut s = BucketStore::open(
            &dir.path().join("t.f0"),
            512,
            1024,
            4,
            free,
            hw,
            true,
        )
        .unwrap();
        assert_eq!(s.get(a).unwrap()[0], 0x11);
        assert_eq!(s.get(b).unwrap()[1023], 0x22);
    }

    #[test]
    fn test_free_list_reuse() {
        let dir = tempdir().unwrap();
        let mut s = new_store(dir.path());

        let a = s.allocate().unwrap();
        let _b = s.allocate().unwrap();
        s.free(a).unwrap();
        assert_eq!(s.n_live(), 1);

        // Freed ID comes back before a fresh one.
        let c = s.allocate().unwrap();
        assert_eq!(c, a);
        assert_eq!(s.high_water(), 2);
    }

    #[test]
    fn test_freed_access_fails() {
        let dir = tempdir().unwrap();
        let mut s = new_store(dir.path());
        let a = s.allocate().unwrap();
        s.free(a).unwrap();
        assert!(s.get(a).is_err());
    }

    #[test]
    fn test_eviction_write_back() {
        let dir = tempdir().unwrap();
        // Cache of 2 forces eviction on the third bucket.
        let mut s = BucketStore::create(&dir.path().join("t.f0"), 512, 512, 2).unwrap();
        let a = s.allocate().unwrap();
        s.get_mut(a).unwrap()[7] = 0x77;
        let _b = s.allocate().unwrap();
        let _c = s.allocate().unwrap(); // evicts a, which must be written back

        assert_eq!(s.get(a).unwrap()[7], 0x77);
    }

    #[test]
    fn test_allocator_state_disjointness() {
        let dir = tempdir().unwrap();
        let mut s = new_store(dir.path());
        for _ in 0..5 {
            s.allocate().unwrap();
        }
        s.free(1).unwrap();
        s.free(3).unwrap();

        let free: Vec<_> = s.free_list().collect();
        assert_eq!(free, vec![1, 3]);
        assert_eq!(s.high_water(), 5);
        assert_eq!(s.n_live(), 3);
    }
}
