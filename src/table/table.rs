//! The user-facing table handle.
//!
//! A `Table` is a cheaply clonable handle onto one open table. Handles
//! to the same path share one underlying state through the
//! process-wide table cache, so their lock coordination happens on a
//! single lock file handle. A default-constructed (null) handle fails
//! every operation with a message naming the operation.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::column_set::{ColumnBinding, ColumnSet, SmBinding};
use super::header::TableHeader;
use super::info::TableInfo;
use super::schema::{ColumnDesc, TableDesc};
use crate::data::{DataType, Endian, Shape, Slicer, Value};
use crate::io::{LockFile, LockKind};
use crate::sm::tiled::TiledSm;
use crate::store::CacheStats;
use crate::{Result, TableError};

/// How an existing table is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Old,
    /// Read-write.
    Update,
    /// Open read-write and destroy the table when the last handle
    /// closes.
    Delete,
}

/// Lock coordination mode, chosen at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// A lock is taken around each data-touching operation and
    /// released at its end.
    Auto,
    /// The caller brackets operations with explicit locks; no read
    /// lock is taken at open.
    UserNoRead,
    /// As `UserNoRead`, but a read lock is taken at open to bound the
    /// window.
    User,
    /// A write lock is held for the whole lifetime of the handle;
    /// `unlock` is a no-op.
    Permanent,
}

/// Endianness choice at creation; `Native` resolves to the host order
/// once and is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndianChoice {
    Big,
    Little,
    Native,
}

impl EndianChoice {
    fn resolve(self) -> Endian {
        match self {
            EndianChoice::Big => Endian::Big,
            EndianChoice::Little => Endian::Little,
            EndianChoice::Native => Endian::native(),
        }
    }
}

/// Options for `Table::create`.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub endian: EndianChoice,
    pub page_size: usize,
    pub lock_mode: LockMode,
    /// Fail when the directory already holds a table instead of
    /// replacing it.
    pub no_replace: bool,
    /// Auto-delete the table when the last handle closes.
    pub scratch: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            endian: EndianChoice::Native,
            page_size: crate::io::DEFAULT_PAGE_SIZE,
            lock_mode: LockMode::Auto,
            no_replace: false,
            scratch: false,
        }
    }
}

const AUTO_LOCK_WAIT: Duration = Duration::from_secs(30);

struct PlainTable {
    dir: PathBuf,
    header: TableHeader,
    column_set: ColumnSet,
    lock: LockFile,
    lock_mode: LockMode,
    info: TableInfo,
    writable: bool,
    delete_on_close: bool,
    data_changed: bool,
}

impl PlainTable {
    /// Take the operation-scoped lock in `Auto` mode; returns whether
    /// this operation must release it.
    fn op_lock(&mut self, kind: LockKind) -> Result<bool> {
        match self.lock_mode {
            LockMode::Auto if !self.lock.has_lock(kind) => {
                self.lock.lock(kind, AUTO_LOCK_WAIT)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn op_unlock(&mut self, acquired: bool) {
        if acquired {
            let _ = self.lock.unlock();
        }
    }

    fn check_writable(&self, op: &str) -> Result<()> {
        if !self.writable {
            return Err(TableError::ReadOnly(format!(
                "{op} on read-only table {}",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn flush_inner(&mut self, sync: bool) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.column_set.flush(sync)?;
        self.header.managers = self.column_set.sm_records()?;
        self.header.touch();
        self.header.write(&self.dir)?;
        self.info.write(&self.dir)?;
        self.data_changed = false;
        tracing::debug!(dir = %self.dir.display(), sync, "table flushed");
        Ok(())
    }
}

impl Drop for PlainTable {
    fn drop(&mut self) {
        if self.writable {
            let _ = self.flush_inner(false);
        }
        let _ = self.lock.unlock();
        if self.delete_on_close {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

/// Process-wide table cache: handles to one path share one state.
static TABLE_CACHE: Lazy<Mutex<ahash::AHashMap<PathBuf, Weak<RwLock<PlainTable>>>>> =
    Lazy::new(|| Mutex::new(ahash::AHashMap::new()));

fn cache_key(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

/// Handle onto an open table (or the null handle).
#[derive(Clone, Default)]
pub struct Table {
    inner: Option<Arc<RwLock<PlainTable>>>,
}

impl Table {
    /// The null handle: every operation fails, naming the operation.
    pub fn null() -> Self {
        Table { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    fn plain(&self, op: &'static str) -> Result<&Arc<RwLock<PlainTable>>> {
        self.inner.as_ref().ok_or(TableError::NullTable { op })
    }

    /// Create a new table with the given schema, manager bindings and
    /// initial row count.
    pub fn create(
        dir: &Path,
        desc: TableDesc,
        bindings: Vec<SmBinding>,
        nrow: u64,
        options: &CreateOptions,
    ) -> Result<Table> {
        if dir.exists() {
            if options.no_replace {
                return Err(TableError::Duplicate(format!(
                    "table {} already exists",
                    dir.display()
                )));
            }
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        let endian = options.endian.resolve();
        let mut header = TableHeader::new(desc, endian, options.page_size);
        header.nrow = nrow;
        let column_set = ColumnSet::create(
            dir,
            &header.desc,
            &bindings,
            nrow,
            options.page_size,
            endian,
        )?;
        let mut lock = LockFile::open(&dir.join("table.lock"))?;
        if options.lock_mode == LockMode::Permanent {
            lock.lock(LockKind::Write, AUTO_LOCK_WAIT)?;
        }
        let mut plain = PlainTable {
            dir: dir.to_path_buf(),
            header,
            column_set,
            lock,
            lock_mode: options.lock_mode,
            info: TableInfo::default(),
            writable: true,
            delete_on_close: options.scratch,
            data_changed: false,
        };
        plain.flush_inner(false)?;
        tracing::debug!(dir = %dir.display(), nrow, "table created");
        let arc = Arc::new(RwLock::new(plain));
        TABLE_CACHE
            .lock()
            .insert(cache_key(dir), Arc::downgrade(&arc));
        Ok(Table { inner: Some(arc) })
    }

    /// Open an existing table. Handles to one path share state through
    /// the process table cache.
    pub fn open(dir: &Path, mode: OpenMode, lock_mode: LockMode) -> Result<Table> {
        let key = cache_key(dir);
        let mut cache = TABLE_CACHE.lock();
        if let Some(existing) = cache.get(&key).and_then(Weak::upgrade) {
            if mode == OpenMode::Delete {
                existing.write().delete_on_close = true;
            }
            return Ok(Table { inner: Some(existing) });
        }
        let writable = mode != OpenMode::Old;
        let header = TableHeader::read(dir)?;
        let column_set = ColumnSet::open(dir, &header, writable)?;
        let info = TableInfo::read(dir)?;
        let mut lock = LockFile::open(&dir.join("table.lock"))?;
        match lock_mode {
            LockMode::Permanent => lock.lock(
                if writable { LockKind::Write } else { LockKind::Read },
                AUTO_LOCK_WAIT,
            )?,
            LockMode::User => lock.lock(LockKind::Read, AUTO_LOCK_WAIT)?,
            LockMode::Auto | LockMode::UserNoRead => {}
        }
        let plain = PlainTable {
            dir: dir.to_path_buf(),
            header,
            column_set,
            lock,
            lock_mode,
            info,
            writable,
            delete_on_close: mode == OpenMode::Delete,
            data_changed: false,
        };
        tracing::debug!(dir = %dir.display(), ?mode, "table opened");
        let arc = Arc::new(RwLock::new(plain));
        cache.insert(key, Arc::downgrade(&arc));
        Ok(Table { inner: Some(arc) })
    }

    /// Whether `dir` holds a readable table.
    pub fn is_readable(dir: &Path) -> bool {
        TableHeader::exists(dir)
    }

    // --- reflection -----------------------------------------------------

    pub fn row_count(&self) -> Result<u64> {
        Ok(self.plain("row_count")?.read().header.nrow)
    }

    pub fn is_writable(&self) -> Result<bool> {
        Ok(self.plain("is_writable")?.read().writable)
    }

    /// Whether this handle wrote since the last flush or resync.
    pub fn has_data_changed(&self) -> Result<bool> {
        Ok(self.plain("has_data_changed")?.read().data_changed)
    }

    pub fn table_desc(&self) -> Result<TableDesc> {
        Ok(self.plain("table_desc")?.read().header.desc.clone())
    }

    pub fn endianness(&self) -> Result<Endian> {
        Ok(self.plain("endianness")?.read().header.endian)
    }

    /// Per-manager reflection record.
    pub fn data_manager_info(&self) -> Result<serde_json::Value> {
        Ok(self.plain("data_manager_info")?.read().column_set.data_manager_info())
    }

    /// Schema annotated with the managers actually serving each
    /// column (not the ones originally requested).
    pub fn actual_table_desc(&self) -> Result<serde_json::Value> {
        let t = self.plain("actual_table_desc")?.read();
        let mut columns = Vec::new();
        for c in &t.header.desc.columns {
            let (sm_idx, _) = t.column_set.resolve(&c.name)?;
            let names = t.column_set.manager_names();
            let info = t.column_set.data_manager_info();
            let sm_type = info[sm_idx]["type"].clone();
            columns.push(serde_json::json!({
                "name": c.name,
                "dtype": c.dtype,
                "kind": c.kind,
                "data_manager_name": names[sm_idx],
                "data_manager_type": sm_type,
            }));
        }
        Ok(serde_json::json!({ "columns": columns }))
    }

    // --- locking --------------------------------------------------------

    /// Acquire a table lock. A zero `max_wait` is non-blocking.
    pub fn lock(&self, kind: LockKind, max_wait: Duration) -> Result<()> {
        let mut t = self.plain("lock")?.write();
        if t.lock_mode == LockMode::Permanent {
            return Ok(());
        }
        t.lock.lock(kind, max_wait)
    }

    pub fn unlock(&self) -> Result<()> {
        let mut t = self.plain("unlock")?.write();
        if t.lock_mode == LockMode::Permanent {
            return Ok(());
        }
        t.lock.unlock()
    }

    pub fn has_lock(&self, kind: LockKind) -> Result<bool> {
        Ok(self.plain("has_lock")?.read().lock.has_lock(kind))
    }

    // --- keyword records ------------------------------------------------

    pub fn keywords(&self) -> Result<super::schema::KeywordRecord> {
        Ok(self.plain("keywords")?.read().header.desc.keywords.clone())
    }

    pub fn set_keyword(&self, name: &str, value: serde_json::Value) -> Result<()> {
        let mut t = self.plain("set_keyword")?.write();
        t.check_writable("set_keyword")?;
        t.header.desc.keywords.set(name, value);
        t.data_changed = true;
        Ok(())
    }

    pub fn column_keywords(&self, column: &str) -> Result<super::schema::KeywordRecord> {
        let t = self.plain("column_keywords")?.read();
        let desc = t
            .header
            .desc
            .column(column)
            .ok_or_else(|| TableError::ColumnNotFound(column.to_string()))?;
        Ok(desc.keywords.clone())
    }

    pub fn set_column_keyword(
        &self,
        column: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut t = self.plain("set_column_keyword")?.write();
        t.check_writable("set_column_keyword")?;
        t.header
            .desc
            .column_mut(column)
            .ok_or_else(|| TableError::ColumnNotFound(column.to_string()))?
            .keywords
            .set(name, value);
        t.data_changed = true;
        Ok(())
    }

    // --- table info -----------------------------------------------------

    pub fn info(&self) -> Result<TableInfo> {
        Ok(self.plain("info")?.read().info.clone())
    }

    pub fn set_info(&self, info: TableInfo) -> Result<()> {
        let mut t = self.plain("set_info")?.write();
        t.check_writable("set_info")?;
        t.info = info;
        t.data_changed = true;
        Ok(())
    }

    // --- row population -------------------------------------------------

    /// Append `n` rows. The `initialize` flag matches the external
    /// surface; cells read as type defaults either way because every
    /// manager zero-initializes fresh rows.
    pub fn add_row(&self, n: u64, initialize: bool) -> Result<()> {
        let _ = initialize;
        let mut t = self.plain("add_row")?.write();
        t.check_writable("add_row")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = t.column_set.add_rows(n);
        if result.is_ok() {
            t.header.nrow += n;
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    /// Remove the given rows. Row numbers refer to the state before
    /// the call; they are removed highest-first so survivors keep
    /// their meaning.
    pub fn remove_row(&self, rows: &[u64]) -> Result<()> {
        let mut t = self.plain("remove_row")?.write();
        t.check_writable("remove_row")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            let mut sorted: Vec<u64> = rows.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            for &row in sorted.iter().rev() {
                crate::check_row(row, t.header.nrow)?;
                t.column_set.remove_row(row)?;
                t.header.nrow -= 1;
            }
            t.data_changed = true;
            Ok(())
        })();
        t.op_unlock(acquired);
        result
    }

    // --- column population ----------------------------------------------

    pub fn add_column(&self, desc: ColumnDesc, binding: ColumnBinding) -> Result<()> {
        let mut t = self.plain("add_column")?.write();
        t.check_writable("add_column")?;
        if t.header.desc.column(&desc.name).is_some() {
            return Err(TableError::Duplicate(format!("column {}", desc.name)));
        }
        let acquired = t.op_lock(LockKind::Write)?;
        let nrow = t.header.nrow;
        let result = t.column_set.add_column(&desc, binding, nrow);
        if result.is_ok() {
            t.header.desc.columns.push(desc);
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    pub fn remove_column(&self, name: &str) -> Result<()> {
        let mut t = self.plain("remove_column")?.write();
        t.check_writable("remove_column")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = t.column_set.remove_column(name);
        if result.is_ok() {
            t.header.desc.remove_column(name)?;
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    pub fn rename_column(&self, old: &str, new: &str) -> Result<()> {
        let mut t = self.plain("rename_column")?.write();
        t.check_writable("rename_column")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = t.column_set.rename_column(old, new);
        if result.is_ok() {
            t.header.desc.rename_column(old, new)?;
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    // --- scalar cells ---------------------------------------------------

    pub fn get_cell(&self, column: &str, row: u64) -> Result<Value> {
        let mut t = self.plain("get_cell")?.write();
        let acquired = t.op_lock(LockKind::Read)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).get_scalar(local, row)
        })();
        t.op_unlock(acquired);
        result
    }

    /// Scalar read with widening promotion: an integer cell may be
    /// read as any wider numeric type, a real as complex with zero
    /// imaginary part. Narrowing fails with a type mismatch.
    pub fn get_cell_as(&self, column: &str, row: u64, target: DataType) -> Result<Value> {
        self.get_cell(column, row)?.promote_to(target)
    }

    pub fn put_cell(&self, column: &str, row: u64, value: &Value) -> Result<()> {
        let mut t = self.plain("put_cell")?.write();
        t.check_writable("put_cell")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).put_scalar(local, row, value)
        })();
        if result.is_ok() {
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    /// A contiguous run of scalar cells.
    pub fn get_column_range(&self, column: &str, start: u64, n: u64) -> Result<Vec<Value>> {
        let mut t = self.plain("get_column_range")?.write();
        let acquired = t.op_lock(LockKind::Read)?;
        let result = (|| {
            let (sm, local) = t.column_set.resolve(column)?;
            let mut out = Vec::with_capacity(n as usize);
            for row in start..start + n {
                crate::check_row(row, t.header.nrow)?;
                out.push(t.column_set.sm_mut(sm).get_scalar(local, row)?);
            }
            Ok(out)
        })();
        t.op_unlock(acquired);
        result
    }

    pub fn put_column_range(&self, column: &str, start: u64, values: &[Value]) -> Result<()> {
        let mut t = self.plain("put_column_range")?.write();
        t.check_writable("put_column_range")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            let (sm, local) = t.column_set.resolve(column)?;
            for (i, v) in values.iter().enumerate() {
                let row = start + i as u64;
                crate::check_row(row, t.header.nrow)?;
                t.column_set.sm_mut(sm).put_scalar(local, row, v)?;
            }
            Ok(())
        })();
        if result.is_ok() {
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    /// Scalar cells at arbitrary row numbers.
    pub fn get_column_cells(&self, column: &str, rows: &[u64]) -> Result<Vec<Value>> {
        let mut t = self.plain("get_column_cells")?.write();
        let acquired = t.op_lock(LockKind::Read)?;
        let result = (|| {
            let (sm, local) = t.column_set.resolve(column)?;
            rows.iter()
                .map(|&row| {
                    crate::check_row(row, t.header.nrow)?;
                    t.column_set.sm_mut(sm).get_scalar(local, row)
                })
                .collect()
        })();
        t.op_unlock(acquired);
        result
    }

    pub fn put_column_cells(&self, column: &str, rows: &[u64], values: &[Value]) -> Result<()> {
        if rows.len() != values.len() {
            return Err(TableError::ShapeMismatch(format!(
                "{} rows but {} values",
                rows.len(),
                values.len()
            )));
        }
        let mut t = self.plain("put_column_cells")?.write();
        t.check_writable("put_column_cells")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            let (sm, local) = t.column_set.resolve(column)?;
            for (&row, v) in rows.iter().zip(values) {
                crate::check_row(row, t.header.nrow)?;
                t.column_set.sm_mut(sm).put_scalar(local, row, v)?;
            }
            Ok(())
        })();
        if result.is_ok() {
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    // --- array cells ----------------------------------------------------

    pub fn cell_shape(&self, column: &str, row: u64) -> Result<Shape> {
        let mut t = self.plain("cell_shape")?.write();
        let acquired = t.op_lock(LockKind::Read)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).cell_shape(local, row)
        })();
        t.op_unlock(acquired);
        result
    }

    /// Define the cell shape (and optionally the tile shape) of one
    /// row before its first write. Only layouts with per-row shapes
    /// support this.
    pub fn set_cell_shape(
        &self,
        column: &str,
        row: u64,
        cell: &Shape,
        tile: Option<&Shape>,
    ) -> Result<()> {
        let mut t = self.plain("set_cell_shape")?.write();
        t.check_writable("set_cell_shape")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).set_cell_shape(local, row, cell, tile)
        })();
        if result.is_ok() {
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    pub fn get_array_cell(&self, column: &str, row: u64) -> Result<(Shape, Vec<Value>)> {
        let mut t = self.plain("get_array_cell")?.write();
        let acquired = t.op_lock(LockKind::Read)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).get_array(local, row)
        })();
        t.op_unlock(acquired);
        result
    }

    pub fn put_array_cell(
        &self,
        column: &str,
        row: u64,
        shape: &Shape,
        data: &[Value],
    ) -> Result<()> {
        let mut t = self.plain("put_array_cell")?.write();
        t.check_writable("put_array_cell")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).put_array(local, row, shape, data)
        })();
        if result.is_ok() {
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    pub fn get_slice(&self, column: &str, row: u64, slicer: &Slicer) -> Result<Vec<Value>> {
        let mut t = self.plain("get_slice")?.write();
        let acquired = t.op_lock(LockKind::Read)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).get_slice(local, row, slicer)
        })();
        t.op_unlock(acquired);
        result
    }

    pub fn put_slice(
        &self,
        column: &str,
        row: u64,
        slicer: &Slicer,
        data: &[Value],
    ) -> Result<()> {
        let mut t = self.plain("put_slice")?.write();
        t.check_writable("put_slice")?;
        let acquired = t.op_lock(LockKind::Write)?;
        let result = (|| {
            crate::check_row(row, t.header.nrow)?;
            let (sm, local) = t.column_set.resolve(column)?;
            t.column_set.sm_mut(sm).put_slice(local, row, slicer, data)
        })();
        if result.is_ok() {
            t.data_changed = true;
        }
        t.op_unlock(acquired);
        result
    }

    // --- tiled accessor -------------------------------------------------

    fn with_tiled<R>(
        &self,
        op: &'static str,
        column: &str,
        f: impl FnOnce(&mut TiledSm) -> Result<R>,
    ) -> Result<R> {
        let mut t = self.plain(op)?.write();
        let (sm, _) = t.column_set.resolve(column)?;
        let sm = t.column_set.sm_mut(sm);
        let tiled = sm
            .as_any_mut()
            .downcast_mut::<TiledSm>()
            .ok_or_else(|| TableError::Unsupported(format!(
                "{op}: column {column} is not tiled"
            )))?;
        f(tiled)
    }

    /// Number of hypercube slots behind a tiled column.
    pub fn hypercube_count(&self, column: &str) -> Result<usize> {
        self.with_tiled("hypercube_count", column, |sm| Ok(sm.nhypercubes()))
    }

    /// Attach a coordinate value to the hypercube holding `row`.
    pub fn set_coordinate(
        &self,
        column: &str,
        row: u64,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.with_tiled("set_coordinate", column, |sm| {
            sm.set_coordinate(row, name, value)
        })
    }

    /// Coordinate record of the hypercube holding `row`.
    pub fn coordinates(
        &self,
        column: &str,
        row: u64,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.with_tiled("coordinates", column, |sm| sm.coordinates(row))
    }

    pub fn tile_cache_stats(&self, column: &str, row: u64) -> Result<CacheStats> {
        self.with_tiled("tile_cache_stats", column, |sm| sm.cache_stats(row))
    }

    /// Size the tile cache of `row`'s hypercube for slice sweeps along
    /// `axis_path`.
    pub fn set_tile_access_pattern(
        &self,
        column: &str,
        row: u64,
        slicer: &Slicer,
        axis_path: &[usize],
    ) -> Result<()> {
        self.with_tiled("set_tile_access_pattern", column, |sm| {
            sm.set_access_pattern(row, slicer, axis_path)
        })
    }

    pub fn clear_tile_caches(&self, column: &str) -> Result<()> {
        self.with_tiled("clear_tile_caches", column, |sm| sm.clear_caches())
    }

    pub fn set_tile_cache_max_bytes(&self, column: &str, max_bytes: usize) -> Result<()> {
        self.with_tiled("set_tile_cache_max_bytes", column, |sm| {
            sm.set_cache_max_bytes(max_bytes);
            Ok(())
        })
    }

    // --- persistence ----------------------------------------------------

    /// Write buffered data and the header; `sync` adds a durability
    /// barrier. `recursive` matches the external surface; sub-tables
    /// reachable from keywords are separate tables flushed by their own
    /// handles.
    pub fn flush(&self, sync: bool, recursive: bool) -> Result<()> {
        let _ = recursive;
        let mut t = self.plain("flush")?.write();
        t.flush_inner(sync)
    }

    /// Re-read the on-disk state, making writes flushed by other
    /// processes visible to this handle.
    pub fn resync(&self) -> Result<()> {
        let mut t = self.plain("resync")?.write();
        if t.writable {
            t.flush_inner(false)?;
        }
        let header = TableHeader::read(&t.dir)?;
        let column_set = ColumnSet::open(&t.dir, &header, t.writable)?;
        t.header = header;
        t.column_set = column_set;
        t.info = TableInfo::read(&t.dir)?;
        t.data_changed = false;
        Ok(())
    }

    /// Upgrade a read-only handle to read-write.
    pub fn reopen_rw(&self) -> Result<()> {
        let mut t = self.plain("reopen_rw")?.write();
        if t.writable {
            return Ok(());
        }
        let header = TableHeader::read(&t.dir)?;
        let column_set = ColumnSet::open(&t.dir, &header, true)?;
        t.header = header;
        t.column_set = column_set;
        t.writable = true;
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // The last handle drops the PlainTable, whose Drop flushes and
        // cleans up; stale cache entries are pruned lazily here.
        if let Some(arc) = self.inner.take() {
            let dir = arc.read().dir.clone();
            drop(arc);
            let mut cache = TABLE_CACHE.lock();
            if let Some(weak) = cache.get(&cache_key(&dir)) {
                if weak.upgrade().is_none() {
                    cache.remove(&cache_key(&dir));
                }
            }
        }
    }
}
