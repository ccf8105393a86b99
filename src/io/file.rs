//! Memory-mapped byte file.
//!
//! The lowest I/O layer: a growable file accessed through a read-write
//! memory map, remapped on resize. `flush` pushes mapped pages to the
//! OS; `sync` makes them durable.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::{Result, TableError};

enum Map {
    Rw(MmapMut),
    Ro(Mmap),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::Rw(m) => m,
            Map::Ro(m) => m,
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Map::Rw(m) => m.flush(),
            Map::Ro(_) => Ok(()),
        }
    }
}

/// Growable mmap-backed file.
pub struct DataFile {
    file: File,
    mmap: Option<Map>,
    len: u64,
    writable: bool,
    path: PathBuf,
}

impl DataFile {
    /// Create a new (empty) file, replacing any existing one.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        tracing::debug!(path = %path.display(), "created data file");
        Ok(Self {
            file,
            mmap: None,
            len: 0,
            writable: true,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    TableError::TableNotFound(path.display().to_string())
                }
                _ => TableError::Io(e),
            })?;
        let len = file.metadata()?.len();
        let mut df = Self {
            file,
            mmap: None,
            len,
            writable,
            path: path.to_path_buf(),
        };
        if len > 0 {
            df.remap()?;
        }
        Ok(df)
    }

    /// Re-map the file (after resize).
    fn remap(&mut self) -> Result<()> {
        self.mmap = None;
        if self.len == 0 {
            return Ok(());
        }
        let map = if self.writable {
            Map::Rw(unsafe { MmapOptions::new().map_mut(&self.file)? })
        } else {
            Map::Ro(unsafe { MmapOptions::new().map(&self.file)? })
        };
        self.mmap = Some(map);
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Grow the file to at least `new_len` bytes (zero-filled).
    pub fn extend_to(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        if !self.writable {
            return Err(TableError::ReadOnly(self.path.display().to_string()));
        }
        if let Some(m) = &self.mmap {
            m.flush()?;
        }
        self.mmap = None;
        self.file.set_len(new_len)?;
        self.len = new_len;
        self.remap()
    }

    /// Shrink the file to exactly `new_len` bytes.
    pub fn truncate_to(&mut self, new_len: u64) -> Result<()> {
        if new_len >= self.len {
            return Ok(());
        }
        if !self.writable {
            return Err(TableError::ReadOnly(self.path.display().to_string()));
        }
        if let Some(m) = &self.mmap {
            m.flush()?;
        }
        self.mmap = None;
        self.file.set_len(new_len)?;
        self.len = new_len;
        self.remap()
    }

    /// Read `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Read into a caller-provided buffer.
    pub fn read_into(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + out.len();
        let bytes = match &self.mmap {
            Some(m) => m.bytes(),
            None => &[][..],
        };
        if end > bytes.len() {
            return Err(TableError::Corrupt(format!(
                "read past end of {} ({} > {})",
                self.path.display(),
                end,
                bytes.len()
            )));
        }
        out.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    /// Write bytes at `offset`, growing the file when needed.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(TableError::ReadOnly(self.path.display().to_string()));
        }
        let end = offset + data.len() as u64;
        if end > self.len {
            // Grow geometrically so sequential appends stay cheap.
            let new_len = end.max(self.len.saturating_mul(2));
            self.extend_to(new_len)?;
        }
        match self.mmap.as_mut() {
            Some(Map::Rw(m)) => {
                m[offset as usize..end as usize].copy_from_slice(data);
                Ok(())
            }
            _ => Err(TableError::Io(std::io::Error::other("file not mapped"))),
        }
    }

    /// Push mapped writes to the OS.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(m) = &self.mmap {
            m.flush()?;
        }
        Ok(())
    }

    /// Make the file durable.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if self.writable {
            let _ = self.flush();
        }
    }
}
