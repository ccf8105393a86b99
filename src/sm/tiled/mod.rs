//! Tiled storage manager.
//!
//! Multi-dimensional array columns are stored as hypercubes split into
//! fixed-shape tiles (see `cube`). Three layout policies share the
//! implementation:
//!
//! - `Cell`: every row owns a hypercube; shapes vary freely per row
//!   and must be set before the first write.
//! - `Column`: one hypercube for the whole column, the row number
//!   being the cube's last axis; every row shares the cell shape.
//! - `Shape`: hypercubes are keyed by `(cell shape, tile shape)`; a
//!   row joins the first cube with its shape, a new shape opens a new
//!   cube.

pub mod chooser;
pub mod cube;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{SmContext, SmType, StorageManager};
use crate::data::{Codec, DataType, Endian, Shape, Slicer, Value};
use crate::store::CacheStats;
use crate::table::schema::{ColumnDesc, ColumnKind};
use crate::{check_row, Result, TableError};

pub use chooser::{make_tile_shape, make_tile_shape_weighted};
use cube::Hypercube;

const DEFAULT_MAX_TILE_ELEMENTS: u64 = 4096;
const DEFAULT_MAX_CACHE_BYTES: usize = 16 << 20;

/// Hypercube layout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilePolicy {
    Cell,
    Column,
    Shape,
}

/// Persisted description of one hypercube. Shapes are stored without
/// the row axis; layouts with a row axis append `nrow_span` on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CubeRec {
    id: u32,
    cell: Vec<u64>,
    tile: Vec<u64>,
    nrow_span: u64,
    #[serde(default)]
    coords: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TsmState {
    version: u32,
    nrow: u64,
    next_cube_id: u32,
    max_cache_bytes: usize,
    cubes: Vec<Option<CubeRec>>,
    /// Per row: `(cube slot, position on the row axis)`.
    row_map: Vec<Option<(usize, u64)>>,
}

/// Tiled storage manager. The column set is fixed at creation; all
/// resident data columns share every hypercube.
pub struct TiledSm {
    name: String,
    seq: u32,
    policy: TilePolicy,
    endian: Endian,
    dir: PathBuf,
    writable: bool,
    columns: Vec<ColumnDesc>,
    nrow: u64,
    next_cube_id: u32,
    max_cache_bytes: usize,
    cubes: Vec<Option<CubeRec>>,
    open_cubes: Vec<Option<Hypercube>>,
    row_map: Vec<Option<(usize, u64)>>,
}

impl TiledSm {
    /// Spec options: `{"tile_shape": [...], "max_cache_bytes": N}`.
    /// The `Column` policy derives its cell shape from the bound
    /// columns, which must all be fixed-shape arrays of one shape.
    pub fn create(
        name: &str,
        policy: TilePolicy,
        ctx: &SmContext<'_>,
        spec: &serde_json::Value,
    ) -> Result<Self> {
        for desc in &ctx.columns {
            if !accepts_desc(policy, desc) {
                return Err(TableError::Unsupported(format!(
                    "tiled manager cannot store column {}",
                    desc.name
                )));
            }
        }
        let max_cache_bytes = spec
            .get("max_cache_bytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CACHE_BYTES);
        let mut sm = Self {
            name: name.to_string(),
            seq: ctx.seq,
            policy,
            endian: ctx.endian,
            dir: ctx.dir.to_path_buf(),
            writable: ctx.writable,
            columns: ctx.columns.clone(),
            nrow: 0,
            next_cube_id: 0,
            max_cache_bytes,
            cubes: Vec::new(),
            open_cubes: Vec::new(),
            row_map: Vec::new(),
        };
        if policy == TilePolicy::Column {
            let cell = sm.fixed_cell_shape()?;
            let tile = match spec.get("tile_shape") {
                Some(v) => {
                    let dims: Vec<u64> = serde_json::from_value(v.clone())
                        .map_err(|e| TableError::Corrupt(format!("bad tile shape: {e}")))?;
                    Shape::new(dims)
                }
                None => make_tile_shape(&cell, 0.5, DEFAULT_MAX_TILE_ELEMENTS),
            };
            if tile.ndim() != cell.ndim() {
                return Err(TableError::ShapeMismatch(format!(
                    "tile shape {tile} does not match cell shape {cell}"
                )));
            }
            sm.new_cube(cell.dims().to_vec(), tile.dims().to_vec(), 0)?;
        }
        if ctx.nrow > 0 {
            sm.add_rows(ctx.nrow)?;
        }
        Ok(sm)
    }

    pub fn open(
        name: &str,
        policy: TilePolicy,
        ctx: &SmContext<'_>,
        state: &serde_json::Value,
    ) -> Result<Self> {
        let st: TsmState = serde_json::from_value(state.clone())
            .map_err(|e| TableError::Corrupt(format!("bad tiled SM state: {e}")))?;
        if st.version > 1 {
            return Err(TableError::VersionMismatch { expected: 1, actual: st.version });
        }
        let n_slots = st.cubes.len();
        Ok(Self {
            name: name.to_string(),
            seq: ctx.seq,
            policy,
            endian: ctx.endian,
            dir: ctx.dir.to_path_buf(),
            writable: ctx.writable,
            columns: ctx.columns.clone(),
            nrow: st.nrow,
            next_cube_id: st.next_cube_id,
            max_cache_bytes: st.max_cache_bytes,
            cubes: st.cubes,
            open_cubes: (0..n_slots).map(|_| None).collect(),
            row_map: st.row_map,
        })
    }

    /// Shared cell shape of the `Column` policy, taken from the bound
    /// column descriptions.
    fn fixed_cell_shape(&self) -> Result<Shape> {
        let mut shape: Option<Shape> = None;
        for desc in &self.columns {
            match (&desc.kind, &shape) {
                (ColumnKind::ArrayFixed(s), None) => shape = Some(s.clone()),
                (ColumnKind::ArrayFixed(s), Some(prev)) if s == prev => {}
                _ => {
                    return Err(TableError::ShapeMismatch(format!(
                        "column {} does not share the manager's fixed cell shape",
                        desc.name
                    )))
                }
            }
        }
        shape.ok_or_else(|| {
            TableError::Unsupported("tiled-column manager bound without columns".into())
        })
    }

    fn dtypes(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.dtype).collect()
    }

    fn has_row_axis(&self) -> bool {
        self.policy != TilePolicy::Cell
    }

    fn cube_file(&self, id: u32) -> PathBuf {
        self.dir.join(format!("table.f{}c{id}", self.seq))
    }

    /// Full cube/tile shapes of a slot, row axis included.
    fn slot_shapes(&self, slot: usize) -> Result<(Shape, Shape)> {
        let rec = self.cubes[slot]
            .as_ref()
            .ok_or_else(|| TableError::Corrupt(format!("dead hypercube slot {slot}")))?;
        let (mut cell, mut tile) = (rec.cell.clone(), rec.tile.clone());
        if self.has_row_axis() {
            cell.push(rec.nrow_span);
            tile.push(1);
        }
        Ok((Shape::new(cell), Shape::new(tile)))
    }

    /// Allocate a new cube slot with its backing file.
    fn new_cube(&mut self, cell: Vec<u64>, tile: Vec<u64>, nrow_span: u64) -> Result<usize> {
        let id = self.next_cube_id;
        self.next_cube_id += 1;
        let rec = CubeRec {
            id,
            cell,
            tile,
            nrow_span,
            coords: serde_json::Map::new(),
        };
        self.cubes.push(Some(rec));
        self.open_cubes.push(None);
        let slot = self.cubes.len() - 1;
        let (cube_shape, tile_shape) = self.slot_shapes(slot)?;
        let cube = Hypercube::create(
            &self.cube_file(id),
            cube_shape,
            tile_shape,
            &self.dtypes(),
            self.max_cache_bytes,
        )?;
        self.open_cubes[slot] = Some(cube);
        tracing::debug!(manager = %self.name, slot, "created hypercube");
        Ok(slot)
    }

    fn open_cube(&mut self, slot: usize) -> Result<&mut Hypercube> {
        if self.open_cubes[slot].is_none() {
            let (cube_shape, tile_shape) = self.slot_shapes(slot)?;
            let id = self.cubes[slot].as_ref().expect("live slot").id;
            let cube = Hypercube::open(
                &self.cube_file(id),
                cube_shape,
                tile_shape,
                &self.dtypes(),
                self.max_cache_bytes,
                self.writable,
            )?;
            self.open_cubes[slot] = Some(cube);
        }
        Ok(self.open_cubes[slot].as_mut().expect("just opened"))
    }

    /// Cube slot and row-axis position of `row`.
    fn locate_row(&self, row: u64) -> Result<(usize, u64)> {
        check_row(row, self.nrow)?;
        self.row_map[row as usize].ok_or_else(|| {
            TableError::ShapeMismatch(format!(
                "row {row} of manager {} has no cell shape yet",
                self.name
            ))
        })
    }

    /// Cell shape of `row` (row axis stripped).
    fn row_cell_shape(&self, row: u64) -> Result<Shape> {
        let (slot, _) = self.locate_row(row)?;
        let rec = self.cubes[slot].as_ref().expect("live slot");
        Ok(Shape::new(rec.cell.clone()))
    }

    /// Map a cell coordinate to a cube coordinate.
    fn cube_pos(&self, cell_pos: &[u64], row_pos: u64) -> Vec<u64> {
        let mut pos = cell_pos.to_vec();
        if self.has_row_axis() {
            pos.push(row_pos);
        }
        pos
    }

    // --- accessor API ---------------------------------------------------

    /// Number of hypercube slots. For the per-cell layout this counts
    /// reserved slots and may exceed the row count.
    pub fn nhypercubes(&self) -> usize {
        match self.policy {
            TilePolicy::Cell => self.cubes.len().max(self.nrow as usize),
            _ => self.cubes.len(),
        }
    }

    /// Cache statistics of the cube holding `row`.
    pub fn cache_stats(&mut self, row: u64) -> Result<CacheStats> {
        let (slot, _) = self.locate_row(row)?;
        Ok(self.open_cube(slot)?.stats())
    }

    /// Drop every cube's cached tiles; values re-read afterwards are
    /// identical.
    pub fn clear_caches(&mut self) -> Result<()> {
        for slot in 0..self.open_cubes.len() {
            if self.open_cubes[slot].is_some() {
                self.open_cubes[slot].as_mut().expect("open").clear_cache()?;
            }
        }
        Ok(())
    }

    pub fn set_cache_max_bytes(&mut self, max_bytes: usize) {
        self.max_cache_bytes = max_bytes;
        for cube in self.open_cubes.iter_mut().flatten() {
            cube.set_cache_max_bytes(max_bytes);
        }
    }

    /// Size the cache of `row`'s cube for repeated slice reads swept
    /// along `axis_path` (fastest-varying cell axis first).
    pub fn set_access_pattern(
        &mut self,
        row: u64,
        slicer: &Slicer,
        axis_path: &[usize],
    ) -> Result<()> {
        let (slot, row_pos) = self.locate_row(row)?;
        let has_row_axis = self.has_row_axis();
        let mut start = slicer.start.clone();
        let mut length = slicer.length.clone();
        let mut path = axis_path.to_vec();
        if has_row_axis {
            start.push(row_pos);
            length.push(1);
            path.push(start.len() - 1);
        }
        let cube = self.open_cube(slot)?;
        cube.prepare_access(&start, &length, &path)
    }

    /// Attach a coordinate-value record entry to the cube holding
    /// `row`.
    pub fn set_coordinate(
        &mut self,
        row: u64,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let (slot, _) = self.locate_row(row)?;
        let rec = self.cubes[slot].as_mut().expect("live slot");
        rec.coords.insert(name.to_string(), value);
        Ok(())
    }

    /// Coordinate-value record of the cube holding `row`.
    pub fn coordinates(&self, row: u64) -> Result<serde_json::Map<String, serde_json::Value>> {
        let (slot, _) = self.locate_row(row)?;
        Ok(self.cubes[slot].as_ref().expect("live slot").coords.clone())
    }

    fn drop_cube(&mut self, slot: usize) -> Result<()> {
        if let Some(rec) = self.cubes[slot].take() {
            self.open_cubes[slot] = None;
            let path = self.cube_file(rec.id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn accepts_desc(policy: TilePolicy, desc: &ColumnDesc) -> bool {
    let elem_ok = Codec::for_type(desc.dtype).fixed_size.is_some();
    match policy {
        TilePolicy::Column => elem_ok && matches!(desc.kind, ColumnKind::ArrayFixed(_)),
        TilePolicy::Cell | TilePolicy::Shape => {
            elem_ok && !matches!(desc.kind, ColumnKind::Scalar)
        }
    }
}

impl StorageManager for TiledSm {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn sm_type(&self) -> SmType {
        match self.policy {
            TilePolicy::Cell => SmType::TiledCell,
            TilePolicy::Column => SmType::TiledColumn,
            TilePolicy::Shape => SmType::TiledShape,
        }
    }

    fn seq(&self) -> u32 {
        self.seq
    }

    fn nrow(&self) -> u64 {
        self.nrow
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn accepts(&self, desc: &ColumnDesc) -> bool {
        accepts_desc(self.policy, desc)
    }

    fn add_rows(&mut self, n: u64) -> Result<()> {
        match self.policy {
            TilePolicy::Column => {
                let span = self.nrow + n;
                let rec = self.cubes[0].as_mut().expect("column cube");
                rec.nrow_span = span;
                if let Some(cube) = self.open_cubes[0].as_mut() {
                    cube.resize_last_axis(span)?;
                }
                for r in self.nrow..span {
                    self.row_map.push(Some((0, r)));
                }
            }
            TilePolicy::Cell | TilePolicy::Shape => {
                for _ in 0..n {
                    self.row_map.push(None);
                }
            }
        }
        self.nrow += n;
        Ok(())
    }

    fn undo_add_rows(&mut self, n: u64) -> Result<()> {
        let new_nrow = self.nrow - n;
        match self.policy {
            TilePolicy::Column => {
                let rec = self.cubes[0].as_mut().expect("column cube");
                rec.nrow_span = new_nrow;
                if let Some(cube) = self.open_cubes[0].as_mut() {
                    cube.resize_last_axis(new_nrow)?;
                }
            }
            TilePolicy::Cell | TilePolicy::Shape => {}
        }
        self.row_map.truncate(new_nrow as usize);
        self.nrow = new_nrow;
        Ok(())
    }

    fn can_remove_row(&self, row: u64) -> bool {
        if row >= self.nrow {
            return false;
        }
        match self.policy {
            TilePolicy::Cell => true,
            TilePolicy::Column => row == self.nrow - 1,
            TilePolicy::Shape => match self.row_map[row as usize] {
                None => true,
                Some((slot, pos)) => self.cubes[slot]
                    .as_ref()
                    .map(|rec| pos == rec.nrow_span - 1)
                    .unwrap_or(false),
            },
        }
    }

    fn remove_row(&mut self, row: u64) -> Result<()> {
        check_row(row, self.nrow)?;
        match self.policy {
            TilePolicy::Cell => {
                if let Some((slot, _)) = self.row_map[row as usize] {
                    self.drop_cube(slot)?;
                }
                self.row_map.remove(row as usize);
            }
            TilePolicy::Column => {
                // The row axis packs rows densely; only the last row
                // can go without relocating every later cell.
                if row != self.nrow - 1 {
                    return Err(TableError::Unsupported(format!(
                        "manager {} can only remove the last row",
                        self.name
                    )));
                }
                let span = self.nrow - 1;
                let rec = self.cubes[0].as_mut().expect("column cube");
                rec.nrow_span = span;
                if let Some(cube) = self.open_cubes[0].as_mut() {
                    cube.resize_last_axis(span)?;
                }
                self.row_map.pop();
            }
            TilePolicy::Shape => {
                match self.row_map[row as usize] {
                    None => {
                        self.row_map.remove(row as usize);
                    }
                    Some((slot, pos)) => {
                        let span = self.cubes[slot].as_ref().expect("live slot").nrow_span;
                        if pos != span - 1 {
                            return Err(TableError::Unsupported(format!(
                                "manager {} can only remove a cube's last row",
                                self.name
                            )));
                        }
                        if span == 1 {
                            self.drop_cube(slot)?;
                        } else {
                            let rec = self.cubes[slot].as_mut().expect("live slot");
                            rec.nrow_span = span - 1;
                            if let Some(cube) = self.open_cubes[slot].as_mut() {
                                cube.resize_last_axis(span - 1)?;
                            }
                        }
                        self.row_map.remove(row as usize);
                    }
                }
            }
        }
        self.nrow -= 1;
        Ok(())
    }

    fn remove_column(&mut self, col: usize) -> Result<()> {
        if self.columns.len() == 1 && col == 0 {
            // Sole tenant: the coordinator destroys the manager next;
            // release every cube file now.
            for slot in 0..self.cubes.len() {
                self.drop_cube(slot)?;
            }
            self.columns.clear();
            return Ok(());
        }
        // Dropping one of several columns would relocate every tile
        // group in every cube file.
        Err(TableError::Unsupported(format!(
            "storage manager {} cannot remove single columns",
            self.name
        )))
    }

    fn rename_column(&mut self, col: usize, new_name: &str) -> Result<()> {
        self.columns
            .get_mut(col)
            .ok_or_else(|| TableError::ColumnNotFound(format!("column index {col}")))?
            .name = new_name.to_string();
        Ok(())
    }

    fn cell_shape(&mut self, col: usize, row: u64) -> Result<Shape> {
        if col >= self.columns.len() {
            return Err(TableError::ColumnNotFound(format!("column index {col}")));
        }
        self.row_cell_shape(row)
    }

    fn set_cell_shape(
        &mut self,
        col: usize,
        row: u64,
        cell: &Shape,
        tile: Option<&Shape>,
    ) -> Result<()> {
        if col >= self.columns.len() {
            return Err(TableError::ColumnNotFound(format!("column index {col}")));
        }
        check_row(row, self.nrow)?;
        let tile = match tile {
            Some(t) => t.clone(),
            None => make_tile_shape(cell, 0.5, DEFAULT_MAX_TILE_ELEMENTS),
        };
        if tile.ndim() != cell.ndim() {
            return Err(TableError::ShapeMismatch(format!(
                "tile shape {tile} does not match cell shape {cell}"
            )));
        }
        match self.policy {
            TilePolicy::Column => Err(TableError::Unsupported(format!(
                "manager {} has a fixed cell shape",
                self.name
            ))),
            TilePolicy::Cell => {
                if let Some((slot, _)) = self.row_map[row as usize] {
                    let rec = self.cubes[slot].as_ref().expect("live slot");
                    if rec.cell == cell.dims() && rec.tile == tile.dims() {
                        return Ok(());
                    }
                    // Reshape replaces the row's cube outright.
                    self.drop_cube(slot)?;
                }
                let slot = self.new_cube(cell.dims().to_vec(), tile.dims().to_vec(), 1)?;
                self.row_map[row as usize] = Some((slot, 0));
                Ok(())
            }
            TilePolicy::Shape => {
                if let Some((slot, _)) = self.row_map[row as usize] {
                    let rec = self.cubes[slot].as_ref().expect("live slot");
                    if rec.cell == cell.dims() && rec.tile == tile.dims() {
                        return Ok(());
                    }
                    return Err(TableError::Unsupported(format!(
                        "row {row} of manager {} already has a shape",
                        self.name
                    )));
                }
                // Join the first cube with a matching shape key.
                let found = self.cubes.iter().position(|c| {
                    c.as_ref()
                        .map(|rec| rec.cell == cell.dims() && rec.tile == tile.dims())
                        .unwrap_or(false)
                });
                let (slot, pos) = match found {
                    Some(slot) => {
                        let rec = self.cubes[slot].as_mut().expect("live slot");
                        let pos = rec.nrow_span;
                        rec.nrow_span += 1;
                        if let Some(cube) = self.open_cubes[slot].as_mut() {
                            cube.resize_last_axis(pos + 1)?;
                        }
                        (slot, pos)
                    }
                    None => {
                        let slot =
                            self.new_cube(cell.dims().to_vec(), tile.dims().to_vec(), 1)?;
                        (slot, 0)
                    }
                };
                self.row_map[row as usize] = Some((slot, pos));
                Ok(())
            }
        }
    }

    fn get_array(&mut self, col: usize, row: u64) -> Result<(Shape, Vec<Value>)> {
        let shape = self.cell_shape(col, row)?;
        let data = self.get_slice(col, row, &Slicer::full(&shape))?;
        Ok((shape, data))
    }

    fn put_array(&mut self, col: usize, row: u64, shape: &Shape, data: &[Value]) -> Result<()> {
        let cell = self.cell_shape(col, row)?;
        if *shape != cell {
            return Err(TableError::ShapeMismatch(format!(
                "cell of row {row} has shape {cell}, got {shape}"
            )));
        }
        self.put_slice(col, row, &Slicer::full(&cell), data)
    }

    fn get_slice(&mut self, col: usize, row: u64, slicer: &Slicer) -> Result<Vec<Value>> {
        let dtype = self
            .columns
            .get(col)
            .ok_or_else(|| TableError::ColumnNotFound(format!("column index {col}")))?
            .dtype;
        let cell = self.row_cell_shape(row)?;
        slicer.validate(&cell)?;
        let (slot, row_pos) = self.locate_row(row)?;
        let endian = self.endian;
        let has_row_axis = self.has_row_axis();
        {
            // Size the cache so one sweep of this slice misses each
            // tile at most once.
            let mut start = slicer.start.clone();
            let mut length = slicer.length.clone();
            let mut path: Vec<usize> = (0..slicer.ndim()).collect();
            if has_row_axis {
                start.push(row_pos);
                length.push(1);
                path.push(start.len() - 1);
            }
            let cube = self.open_cube(slot)?;
            cube.prepare_access(&start, &length, &path)?;
        }
        let mut out = Vec::with_capacity(slicer.result_shape().product() as usize);
        let mut cube_pos = self.cube_pos(&vec![0; cell.ndim()], row_pos);
        let cube = self.open_cubes[slot].as_mut().expect("opened above");
        slicer.for_each(|pos, _| {
            cube_pos[..pos.len()].copy_from_slice(pos);
            out.push(cube.get_elem(col, dtype, endian, &cube_pos)?);
            Ok(())
        })?;
        Ok(out)
    }

    fn put_slice(&mut self, col: usize, row: u64, slicer: &Slicer, data: &[Value]) -> Result<()> {
        if col >= self.columns.len() {
            return Err(TableError::ColumnNotFound(format!("column index {col}")));
        }
        let cell = self.row_cell_shape(row)?;
        slicer.validate(&cell)?;
        if data.len() as u64 != slicer.result_shape().product() {
            return Err(TableError::ShapeMismatch(format!(
                "slice data holds {} elements, slicer selects {}",
                data.len(),
                slicer.result_shape().product()
            )));
        }
        let (slot, row_pos) = self.locate_row(row)?;
        let endian = self.endian;
        let has_row_axis = self.has_row_axis();
        let mut cube_pos = self.cube_pos(&vec![0; cell.ndim()], row_pos);
        let cube = self.open_cube(slot)?;
        {
            let mut start = slicer.start.clone();
            let mut length = slicer.length.clone();
            let mut path: Vec<usize> = (0..slicer.ndim()).collect();
            if has_row_axis {
                start.push(row_pos);
                length.push(1);
                path.push(start.len() - 1);
            }
            cube.prepare_access(&start, &length, &path)?;
        }
        slicer.for_each(|pos, out_idx| {
            cube_pos[..pos.len()].copy_from_slice(pos);
            cube.put_elem(col, endian, &cube_pos, &data[out_idx as usize])
        })?;
        Ok(())
    }

    fn flush(&mut self, sync: bool) -> Result<()> {
        for cube in self.open_cubes.iter_mut().flatten() {
            cube.flush(sync)?;
        }
        Ok(())
    }

    fn state(&self) -> Result<serde_json::Value> {
        let st = TsmState {
            version: 1,
            nrow: self.nrow,
            next_cube_id: self.next_cube_id,
            max_cache_bytes: self.max_cache_bytes,
            cubes: self.cubes.clone(),
            row_map: self.row_map.clone(),
        };
        serde_json::to_value(st).map_err(|e| TableError::Corrupt(e.to_string()))
    }

    fn spec_record(&self) -> serde_json::Value {
        let tile = self
            .cubes
            .iter()
            .flatten()
            .next()
            .map(|rec| rec.tile.clone());
        serde_json::json!({
            "max_cache_bytes": self.max_cache_bytes,
            "tile_shape": tile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_ctx<'a>(
        dir: &'a std::path::Path,
        columns: Vec<ColumnDesc>,
        nrow: u64,
    ) -> SmContext<'a> {
        SmContext {
            dir,
            seq: 1,
            page_size: 512,
            endian: Endian::Little,
            writable: true,
            nrow,
            columns,
        }
    }

    fn array_col(name: &str, shape: Vec<u64>) -> ColumnDesc {
        ColumnDesc::array_fixed(name, DataType::I32, Shape::new(shape))
    }

    #[test]
    fn test_column_policy_slice_pattern() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![array_col("data", vec![15, 21])], 10);
        let spec = serde_json::json!({"tile_shape": [4, 5]});
        let mut sm = TiledSm::create("TSM", TilePolicy::Column, &ctx, &spec).unwrap();
        assert_eq!(sm.nhypercubes(), 1);

        // Row i holds sequentially increasing values from 1000*i.
        let shape = Shape::new(vec![15, 21]);
        for row in 0..10u64 {
            let data: Vec<Value> = (0..shape.product())
                .map(|k| Value::I32((1000 * row + k) as i32))
                .collect();
            sm.put_array(0, row, &shape, &data).unwrap();
        }
        // Slice (start=(2,3), length=(10,15)): element (c, f) of the
        // result equals 1000*i + (c+2) + (f+3)*15.
        let slicer = Slicer::new(vec![2, 3], vec![10, 15]);
        for row in 0..10u64 {
            let out = sm.get_slice(0, row, &slicer).unwrap();
            assert_eq!(out.len(), 150);
            let mut k = 0;
            for f in 0..15u64 {
                for c in 0..10u64 {
                    let expected = (1000 * row + (c + 2) + (f + 3) * 15) as i32;
                    assert_eq!(out[k], Value::I32(expected), "row {row} c {c} f {f}");
                    k += 1;
                }
            }
        }
    }

    #[test]
    fn test_column_policy_persistence() {
        let dir = tempdir().unwrap();
        let cols = vec![array_col("data", vec![6, 4])];
        let shape = Shape::new(vec![6, 4]);
        let state;
        {
            let ctx = make_ctx(dir.path(), cols.clone(), 3);
            let spec = serde_json::json!({"tile_shape": [3, 2]});
            let mut sm = TiledSm::create("TSM", TilePolicy::Column, &ctx, &spec).unwrap();
            for row in 0..3u64 {
                let data: Vec<Value> =
                    (0..24).map(|k| Value::I32((row * 100 + k) as i32)).collect();
                sm.put_array(0, row, &shape, &data).unwrap();
            }
            sm.flush(false).unwrap();
            state = sm.state().unwrap();
        }
        let ctx = make_ctx(dir.path(), cols, 3);
        let mut sm = TiledSm::open("TSM", TilePolicy::Column, &ctx, &state).unwrap();
        for row in 0..3u64 {
            let (s, data) = sm.get_array(0, row).unwrap();
            assert_eq!(s, shape);
            for (k, v) in data.iter().enumerate() {
                assert_eq!(*v, Value::I32((row * 100 + k as u64) as i32));
            }
        }
    }

    #[test]
    fn test_slice_matches_whole_cell_reference() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![array_col("data", vec![9, 7])], 2);
        let mut sm =
            TiledSm::create("TSM", TilePolicy::Column, &ctx, &serde_json::json!({"tile_shape": [4, 3]}))
                .unwrap();
        let shape = Shape::new(vec![9, 7]);
        let data: Vec<Value> = (0..63).map(|k| Value::I32(k * 3 + 1)).collect();
        sm.put_array(0, 1, &shape, &data).unwrap();

        // Strided slicer checked against slicing the whole cell in
        // memory.
        let slicer = Slicer::with_stride(vec![1, 2], vec![4, 3], vec![2, 1]);
        let direct = sm.get_slice(0, 1, &slicer).unwrap();
        let (_, whole) = sm.get_array(0, 1).unwrap();
        let mut reference = Vec::new();
        slicer
            .for_each(|pos, _| {
                reference.push(whole[shape.linear(pos) as usize].clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(direct, reference);
    }

    #[test]
    fn test_out_of_cell_slice_fails() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![array_col("data", vec![5, 5])], 1);
        let mut sm =
            TiledSm::create("TSM", TilePolicy::Column, &ctx, &serde_json::json!({})).unwrap();
        let slicer = Slicer::new(vec![3, 0], vec![3, 5]);
        assert!(matches!(
            sm.get_slice(0, 0, &slicer),
            Err(TableError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_cell_policy_per_row_shapes() {
        let dir = tempdir().unwrap();
        let desc = ColumnDesc::array_var("data", DataType::F32);
        let ctx = make_ctx(dir.path(), vec![desc], 3);
        let mut sm = TiledSm::create("TSM", TilePolicy::Cell, &ctx, &serde_json::json!({})).unwrap();

        // Shapes must be set before the first write.
        assert!(sm.put_array(0, 0, &Shape::new(vec![2, 2]), &vec![Value::F32(0.0); 4]).is_err());

        sm.set_cell_shape(0, 0, &Shape::new(vec![2, 2]), None).unwrap();
        sm.set_cell_shape(0, 1, &Shape::new(vec![3, 5]), Some(&Shape::new(vec![2, 2]))).unwrap();
        sm.set_cell_shape(0, 2, &Shape::new(vec![4]), None).unwrap();
        assert!(sm.nhypercubes() >= 3);

        for row in 0..3u64 {
            let shape = sm.cell_shape(0, row).unwrap();
            let data: Vec<Value> = (0..shape.product())
                .map(|k| Value::F32(row as f32 * 10.0 + k as f32))
                .collect();
            sm.put_array(0, row, &shape, &data).unwrap();
        }
        assert_eq!(sm.cell_shape(0, 1).unwrap(), Shape::new(vec![3, 5]));
        for row in 0..3u64 {
            let (shape, data) = sm.get_array(0, row).unwrap();
            for (k, v) in data.iter().enumerate() {
                assert_eq!(*v, Value::F32(row as f32 * 10.0 + k as f32));
            }
            assert_eq!(data.len() as u64, shape.product());
        }
    }

    #[test]
    fn test_shape_policy_groups_by_shape() {
        let dir = tempdir().unwrap();
        let desc = ColumnDesc::array_var("data", DataType::I32);
        let ctx = make_ctx(dir.path(), vec![desc], 6);
        let mut sm =
            TiledSm::create("TSM", TilePolicy::Shape, &ctx, &serde_json::json!({})).unwrap();

        // Rows 0, 2, 4 share one shape; rows 1, 3 another; row 5 stays
        // shapeless.
        for row in [0u64, 2, 4] {
            sm.set_cell_shape(0, row, &Shape::new(vec![3, 3]), None).unwrap();
        }
        for row in [1u64, 3] {
            sm.set_cell_shape(0, row, &Shape::new(vec![2, 6]), None).unwrap();
        }
        assert_eq!(sm.nhypercubes(), 2);

        for row in 0..5u64 {
            let shape = sm.cell_shape(0, row).unwrap();
            let data: Vec<Value> = (0..shape.product())
                .map(|k| Value::I32((row * 100 + k) as i32))
                .collect();
            sm.put_array(0, row, &shape, &data).unwrap();
        }
        for row in 0..5u64 {
            let (_, data) = sm.get_array(0, row).unwrap();
            for (k, v) in data.iter().enumerate() {
                assert_eq!(*v, Value::I32((row * 100 + k as u64) as i32));
            }
        }
        assert!(sm.cell_shape(0, 5).is_err());
    }

    #[test]
    fn test_coordinates_round_trip() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![array_col("data", vec![4, 4])], 2);
        let mut sm =
            TiledSm::create("TSM", TilePolicy::Column, &ctx, &serde_json::json!({})).unwrap();
        sm.set_coordinate(0, "freq", serde_json::json!([1.0, 1.5, 2.0, 2.5])).unwrap();
        let coords = sm.coordinates(1).unwrap();
        assert_eq!(coords["freq"], serde_json::json!([1.0, 1.5, 2.0, 2.5]));
    }

    #[test]
    fn test_cache_stats_and_clear() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![array_col("data", vec![8, 8])], 1);
        let spec = serde_json::json!({"tile_shape": [2, 2]});
        let mut sm = TiledSm::create("TSM", TilePolicy::Column, &ctx, &spec).unwrap();
        let shape = Shape::new(vec![8, 8]);
        let data: Vec<Value> = (0..64).map(Value::I32).collect();
        sm.put_array(0, 0, &shape, &data).unwrap();
        let stats = sm.cache_stats(0).unwrap();
        assert!(stats.n_write > 0);

        let before = sm.get_array(0, 0).unwrap();
        sm.clear_caches().unwrap();
        let after = sm.get_array(0, 0).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_add_column_refused() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![array_col("data", vec![4, 4])], 1);
        let mut sm =
            TiledSm::create("TSM", TilePolicy::Column, &ctx, &serde_json::json!({})).unwrap();
        assert!(!sm.supports_add_column());
        assert!(matches!(
            sm.add_column(&array_col("more", vec![4, 4])),
            Err(TableError::Unsupported(_))
        ));
    }
}
