//! Fixed-size page layer over a data file.
//!
//! Pages are the allocation unit of every storage-manager file. The
//! page size is a per-table power-of-two constant; page 0 starts at
//! byte 0 of the file. Free-page bookkeeping belongs to the owner (the
//! bucket allocator persists its free list in the SM state), so this
//! layer only tracks the high-water mark.

use std::path::Path;

use super::file::DataFile;
use crate::{Result, TableError};

/// Page identifier within one file.
pub type PageId = u32;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// A data file addressed in fixed-size pages.
pub struct PagedFile {
    file: DataFile,
    page_size: usize,
    n_pages: u32,
}

impl PagedFile {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size < 512 {
            return Err(TableError::Unsupported(format!(
                "page size {page_size} is not a power of two >= 512"
            )));
        }
        Ok(Self {
            file: DataFile::create(path)?,
            page_size,
            n_pages: 0,
        })
    }

    pub fn open(path: &Path, page_size: usize, writable: bool) -> Result<Self> {
        let file = DataFile::open(path, writable)?;
        if file.len() % page_size as u64 != 0 {
            return Err(TableError::Corrupt(format!(
                "{} length {} is not a multiple of the page size {page_size}",
                path.display(),
                file.len()
            )));
        }
        let n_pages = (file.len() / page_size as u64) as u32;
        Ok(Self { file, page_size, n_pages })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages ever allocated (the high-water mark).
    pub fn n_pages(&self) -> u32 {
        self.n_pages
    }

    pub fn is_writable(&self) -> bool {
        self.file.is_writable()
    }

    fn offset(&self, id: PageId) -> u64 {
        id as u64 * self.page_size as u64
    }

    /// Read one page. Reading an unallocated page is a corruption error.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        if id >= self.n_pages {
            return Err(TableError::Corrupt(format!(
                "page {id} past high water {}",
                self.n_pages
            )));
        }
        self.file.read_at(self.offset(id), self.page_size)
    }

    /// Read `count` contiguous pages into one buffer.
    pub fn read_pages(&self, id: PageId, count: u32) -> Result<Vec<u8>> {
        if id + count > self.n_pages {
            return Err(TableError::Corrupt(format!(
                "pages [{id}, {}) past high water {}",
                id + count,
                self.n_pages
            )));
        }
        self.file
            .read_at(self.offset(id), self.page_size * count as usize)
    }

    /// Write one page (must be exactly `page_size` bytes).
    pub fn write_page(&mut self, id: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size {
            return Err(TableError::Corrupt(format!(
                "page image of {} bytes, page size is {}",
                bytes.len(),
                self.page_size
            )));
        }
        self.write_pages(id, bytes)
    }

    /// Write one or more contiguous pages.
    pub fn write_pages(&mut self, id: PageId, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len() % self.page_size, 0);
        let end_page = id + (bytes.len() / self.page_size) as u32;
        if end_page > self.n_pages {
            self.file.extend_to(self.offset(end_page))?;
            self.n_pages = end_page;
        }
        self.file.write_at(self.offset(id), bytes)
    }

    /// Allocate `count` fresh contiguous pages, zero-filled.
    pub fn allocate_pages(&mut self, count: u32) -> Result<PageId> {
        let id = self.n_pages;
        self.file.extend_to(self.offset(id + count))?;
        self.n_pages += count;
        Ok(id)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}
