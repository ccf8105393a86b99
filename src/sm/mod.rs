//! Storage managers.
//!
//! A storage manager (SM) owns the on-disk layout of one or more
//! columns. The table routes column operations to the owning SM
//! through the `StorageManager` trait; capability queries are separate
//! from dispatch, so "not supported" is an error return, never a
//! missing method.

pub mod incremental;
pub mod standard;
pub mod tiled;

use std::path::{Path, PathBuf};

use crate::data::{Endian, Shape, Slicer, Value};
use crate::table::schema::ColumnDesc;
use crate::{Result, TableError};

pub use incremental::IncrementalSm;
pub use standard::StandardSm;
pub use tiled::{TiledSm, TilePolicy};

/// Storage manager type tag, persisted in the table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmType {
    Standard,
    Incremental,
    TiledCell,
    TiledColumn,
    TiledShape,
}

impl SmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmType::Standard => "standard",
            SmType::Incremental => "incremental",
            SmType::TiledCell => "tiled-cell",
            SmType::TiledColumn => "tiled-column",
            SmType::TiledShape => "tiled-shape",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(SmType::Standard),
            "incremental" => Ok(SmType::Incremental),
            "tiled-cell" => Ok(SmType::TiledCell),
            "tiled-column" => Ok(SmType::TiledColumn),
            "tiled-shape" => Ok(SmType::TiledShape),
            _ => Err(TableError::Corrupt(format!("unknown storage manager type '{s}'"))),
        }
    }
}

impl std::fmt::Display for SmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an SM needs to create or reopen its files.
///
/// `seq` is the SM's stable position in the table's layout record; the
/// SM derives its file names from it (`table.f<seq>` and variants).
pub struct SmContext<'a> {
    pub dir: &'a Path,
    pub seq: u32,
    pub page_size: usize,
    pub endian: Endian,
    pub writable: bool,
    pub nrow: u64,
    pub columns: Vec<ColumnDesc>,
}

impl SmContext<'_> {
    pub fn data_path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("table.f{}{suffix}", self.seq))
    }
}

/// Common interface of every storage manager.
///
/// Columns are addressed by their SM-local index, assigned in the
/// order the columns were bound. Scalar operations on array SMs (and
/// the reverse) fail with `TypeMismatch`; operations an SM cannot
/// perform fail with `Unsupported`.
pub trait StorageManager: Send + Sync {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);
    fn sm_type(&self) -> SmType;
    fn seq(&self) -> u32;
    fn nrow(&self) -> u64;

    /// Concrete-type escape hatch for manager-specific accessor APIs
    /// (hypercube inspection, cache controls).
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Names of resident columns, in local order.
    fn column_names(&self) -> Vec<String>;

    fn n_columns(&self) -> usize {
        self.column_names().len()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names().iter().position(|c| c == name)
    }

    /// Capability: can columns be added after creation?
    fn supports_add_column(&self) -> bool {
        false
    }

    /// Whether this SM can store a column of the given description.
    fn accepts(&self, desc: &ColumnDesc) -> bool;

    // --- row population -------------------------------------------------

    fn add_rows(&mut self, n: u64) -> Result<()>;

    /// Rewind of a just-completed `add_rows`, used when a multi-SM
    /// add-row fails part way and completed SMs must be rolled back.
    fn undo_add_rows(&mut self, n: u64) -> Result<()>;

    fn remove_row(&mut self, row: u64) -> Result<()>;

    /// Preflight for atomic multi-SM row removal: the coordinator
    /// refuses the whole operation when any SM cannot perform it.
    fn can_remove_row(&self, row: u64) -> bool {
        let _ = row;
        true
    }

    // --- column population ----------------------------------------------

    fn add_column(&mut self, desc: &ColumnDesc) -> Result<()> {
        let _ = desc;
        Err(TableError::Unsupported(format!(
            "storage manager {} ({}) cannot add columns",
            self.name(),
            self.sm_type()
        )))
    }

    fn remove_column(&mut self, col: usize) -> Result<()>;

    fn rename_column(&mut self, col: usize, new_name: &str) -> Result<()>;

    // --- scalar cells ---------------------------------------------------

    fn get_scalar(&mut self, col: usize, row: u64) -> Result<Value> {
        let _ = (col, row);
        Err(TableError::TypeMismatch(format!(
            "scalar access on array storage manager {}",
            self.name()
        )))
    }

    fn put_scalar(&mut self, col: usize, row: u64, v: &Value) -> Result<()> {
        let _ = (col, row, v);
        Err(TableError::TypeMismatch(format!(
            "scalar access on array storage manager {}",
            self.name()
        )))
    }

    // --- array cells ----------------------------------------------------

    /// Shape of the cell at `row`, if defined.
    fn cell_shape(&mut self, col: usize, row: u64) -> Result<Shape> {
        let _ = (col, row);
        Err(TableError::TypeMismatch(format!(
            "array access on scalar storage manager {}",
            self.name()
        )))
    }

    /// Define the cell (and optionally tile) shape before the first
    /// write. Only meaningful for shape-per-row layouts.
    fn set_cell_shape(
        &mut self,
        col: usize,
        row: u64,
        cell: &Shape,
        tile: Option<&Shape>,
    ) -> Result<()> {
        let _ = (col, row, cell, tile);
        Err(TableError::Unsupported(format!(
            "set_cell_shape on storage manager {}",
            self.name()
        )))
    }

    fn get_array(&mut self, col: usize, row: u64) -> Result<(Shape, Vec<Value>)> {
        let _ = (col, row);
        Err(TableError::TypeMismatch(format!(
            "array access on scalar storage manager {}",
            self.name()
        )))
    }

    fn put_array(&mut self, col: usize, row: u64, shape: &Shape, data: &[Value]) -> Result<()> {
        let _ = (col, row, shape, data);
        Err(TableError::TypeMismatch(format!(
            "array access on scalar storage manager {}",
            self.name()
        )))
    }

    /// Strided sub-array read. The default materializes the whole cell
    /// and slices in memory; tiled layouts override with tile-addressed
    /// reads.
    fn get_slice(&mut self, col: usize, row: u64, slicer: &Slicer) -> Result<Vec<Value>> {
        let (shape, cell) = self.get_array(col, row)?;
        slicer.validate(&shape)?;
        let mut out = Vec::with_capacity(slicer.result_shape().product() as usize);
        slicer.for_each(|pos, _| {
            out.push(cell[shape.linear(pos) as usize].clone());
            Ok(())
        })?;
        Ok(out)
    }

    fn put_slice(&mut self, col: usize, row: u64, slicer: &Slicer, data: &[Value]) -> Result<()> {
        let (shape, mut cell) = self.get_array(col, row)?;
        slicer.validate(&shape)?;
        if data.len() as u64 != slicer.result_shape().product() {
            return Err(TableError::ShapeMismatch(format!(
                "slice data holds {} elements, slicer selects {}",
                data.len(),
                slicer.result_shape().product()
            )));
        }
        slicer.for_each(|pos, out_idx| {
            cell[shape.linear(pos) as usize] = data[out_idx as usize].clone();
            Ok(())
        })?;
        self.put_array(col, row, &shape, &cell)
    }

    // --- persistence ----------------------------------------------------

    /// Write buffered state to the SM's files; `sync` adds a durability
    /// barrier.
    fn flush(&mut self, sync: bool) -> Result<()>;

    /// SM-specific persisted state, stored in the table header's layout
    /// record and handed back through `SmContext` on reopen.
    fn state(&self) -> Result<serde_json::Value>;

    /// Creation-equivalent spec for reflection (`data_manager_info`).
    fn spec_record(&self) -> serde_json::Value;
}

/// Table-scoped registry of SM constructors, built at table open and
/// dropped at close.
pub struct SmRegistry;

impl SmRegistry {
    pub fn new() -> Self {
        SmRegistry
    }

    /// Instantiate a fresh SM of the given type.
    pub fn create(
        &self,
        sm_type: SmType,
        name: &str,
        ctx: &SmContext<'_>,
        spec: &serde_json::Value,
    ) -> Result<Box<dyn StorageManager>> {
        Ok(match sm_type {
            SmType::Standard => Box::new(StandardSm::create(name, ctx, spec)?),
            SmType::Incremental => Box::new(IncrementalSm::create(name, ctx, spec)?),
            SmType::TiledCell => Box::new(TiledSm::create(name, TilePolicy::Cell, ctx, spec)?),
            SmType::TiledColumn => {
                Box::new(TiledSm::create(name, TilePolicy::Column, ctx, spec)?)
            }
            SmType::TiledShape => Box::new(TiledSm::create(name, TilePolicy::Shape, ctx, spec)?),
        })
    }

    /// Reopen an SM from its persisted state.
    pub fn open(
        &self,
        sm_type: SmType,
        name: &str,
        ctx: &SmContext<'_>,
        state: &serde_json::Value,
    ) -> Result<Box<dyn StorageManager>> {
        Ok(match sm_type {
            SmType::Standard => Box::new(StandardSm::open(name, ctx, state)?),
            SmType::Incremental => Box::new(IncrementalSm::open(name, ctx, state)?),
            SmType::TiledCell => Box::new(TiledSm::open(name, TilePolicy::Cell, ctx, state)?),
            SmType::TiledColumn => Box::new(TiledSm::open(name, TilePolicy::Column, ctx, state)?),
            SmType::TiledShape => Box::new(TiledSm::open(name, TilePolicy::Shape, ctx, state)?),
        })
    }
}

impl Default for SmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
