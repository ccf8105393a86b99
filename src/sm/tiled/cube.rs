//! Hypercube storage.
//!
//! A hypercube is a dense multidimensional grid of cells partitioned
//! into fixed-shape tiles. Tiles are the unit of I/O: the cube file
//! holds one tile group per linear tile index, each group carrying one
//! tile per resident data column. Tiles never written read back as
//! zeros. All tile traffic goes through the cube's tile cache.

use std::path::{Path, PathBuf};

use crate::data::{Codec, DataType, Endian, Shape};
use crate::io::DataFile;
use crate::store::tile::{tiles_touched, CachedTile};
use crate::store::{CacheStats, TileCache};
use crate::{Result, TableError};

/// One open hypercube and its tile cache.
pub struct Hypercube {
    /// Full cube shape, including the row axis for layouts that have
    /// one.
    cube_shape: Shape,
    tile_shape: Shape,
    elem_sizes: Vec<usize>,
    file: DataFile,
    cache: TileCache,
    path: PathBuf,
}

impl Hypercube {
    pub fn create(
        path: &Path,
        cube_shape: Shape,
        tile_shape: Shape,
        dtypes: &[DataType],
        max_cache_bytes: usize,
    ) -> Result<Self> {
        let elem_sizes = elem_sizes(dtypes)?;
        check_shapes(&cube_shape, &tile_shape)?;
        let file = DataFile::create(path)?;
        let tile_bytes = tile_group_bytes(&tile_shape, &elem_sizes);
        Ok(Self {
            cube_shape,
            tile_shape,
            elem_sizes,
            file,
            cache: TileCache::new(tile_bytes, max_cache_bytes),
            path: path.to_path_buf(),
        })
    }

    pub fn open(
        path: &Path,
        cube_shape: Shape,
        tile_shape: Shape,
        dtypes: &[DataType],
        max_cache_bytes: usize,
        writable: bool,
    ) -> Result<Self> {
        let elem_sizes = elem_sizes(dtypes)?;
        check_shapes(&cube_shape, &tile_shape)?;
        let file = DataFile::open(path, writable)?;
        let tile_bytes = tile_group_bytes(&tile_shape, &elem_sizes);
        Ok(Self {
            cube_shape,
            tile_shape,
            elem_sizes,
            file,
            cache: TileCache::new(tile_bytes, max_cache_bytes),
            path: path.to_path_buf(),
        })
    }

    pub fn cube_shape(&self) -> &Shape {
        &self.cube_shape
    }

    pub fn tile_shape(&self) -> &Shape {
        &self.tile_shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn set_cache_max_bytes(&mut self, max_bytes: usize) {
        self.cache.set_max_bytes(max_bytes);
    }

    fn n_cols(&self) -> usize {
        self.elem_sizes.len()
    }

    /// Tile counts per axis.
    fn tile_grid(&self) -> Vec<u64> {
        self.cube_shape
            .dims()
            .iter()
            .zip(self.tile_shape.dims())
            .map(|(&c, &t)| c.div_ceil(t))
            .collect()
    }

    fn tile_elems(&self) -> u64 {
        self.tile_shape.product()
    }

    /// Linear tile index of the tile containing `pos`, plus the linear
    /// element offset inside that tile.
    fn tile_of(&self, pos: &[u64]) -> (u64, u64) {
        let grid = self.tile_grid();
        let mut tile_linear = 0u64;
        let mut tile_stride = 1u64;
        let mut in_tile = 0u64;
        let mut in_stride = 1u64;
        for i in 0..pos.len() {
            let t = pos[i] / self.tile_shape.dims()[i];
            let o = pos[i] % self.tile_shape.dims()[i];
            tile_linear += t * tile_stride;
            tile_stride *= grid[i];
            in_tile += o * in_stride;
            in_stride *= self.tile_shape.dims()[i];
        }
        (tile_linear, in_tile)
    }

    /// Byte offset of one column's tile within the cube file.
    fn tile_file_offset(&self, col: usize, tile_linear: u64) -> u64 {
        let group = tile_group_bytes(&self.tile_shape, &self.elem_sizes) as u64;
        let prefix: u64 = self.elem_sizes[..col]
            .iter()
            .map(|&s| s as u64 * self.tile_elems())
            .sum();
        tile_linear * group + prefix
    }

    fn col_tile_bytes(&self, col: usize) -> usize {
        self.tile_elems() as usize * self.elem_sizes[col]
    }

    fn cache_key(&self, col: usize, tile_linear: u64) -> u64 {
        tile_linear * self.n_cols() as u64 + col as u64
    }

    /// Make a tile resident in the cache, reading it (or zero-filling
    /// past the end of the file) on a miss.
    fn load_tile(&mut self, col: usize, tile_linear: u64) -> Result<()> {
        let key = self.cache_key(col, tile_linear);
        if self.cache.get_mut(key).is_some() {
            return Ok(());
        }
        let len = self.col_tile_bytes(col);
        let offset = self.tile_file_offset(col, tile_linear);
        let mut bytes = vec![0u8; len];
        if offset < self.file.len() {
            let avail = ((self.file.len() - offset) as usize).min(len);
            self.file.read_into(offset, &mut bytes[..avail])?;
        }
        if let Some((old_key, old_bytes)) = self.cache.insert(
            key,
            CachedTile { bytes, dirty: false },
        ) {
            self.write_tile(old_key, &old_bytes)?;
        }
        Ok(())
    }

    fn write_tile(&mut self, key: u64, bytes: &[u8]) -> Result<()> {
        let col = (key % self.n_cols() as u64) as usize;
        let tile_linear = key / self.n_cols() as u64;
        let offset = self.tile_file_offset(col, tile_linear);
        self.file.write_at(offset, bytes)
    }

    /// Read the element at a cube coordinate.
    pub fn get_elem(
        &mut self,
        col: usize,
        dtype: DataType,
        endian: Endian,
        pos: &[u64],
    ) -> Result<crate::data::Value> {
        if !self.cube_shape.contains(pos) {
            return Err(TableError::ShapeMismatch(format!(
                "coordinate outside hypercube {}",
                self.cube_shape
            )));
        }
        let (tile_linear, in_tile) = self.tile_of(pos);
        self.load_tile(col, tile_linear)?;
        let esz = self.elem_sizes[col];
        let key = self.cache_key(col, tile_linear);
        let tile = self
            .cache
            .get_mut(key)
            .ok_or_else(|| TableError::Corrupt("tile lost from cache".into()))?;
        let start = in_tile as usize * esz;
        let (v, _) = Codec::for_type(dtype).decode(&tile.bytes[start..start + esz], endian)?;
        Ok(v)
    }

    /// Write the element at a cube coordinate.
    pub fn put_elem(
        &mut self,
        col: usize,
        endian: Endian,
        pos: &[u64],
        v: &crate::data::Value,
    ) -> Result<()> {
        if !self.file.is_writable() {
            return Err(TableError::ReadOnly(self.path.display().to_string()));
        }
        if !self.cube_shape.contains(pos) {
            return Err(TableError::ShapeMismatch(format!(
                "coordinate outside hypercube {}",
                self.cube_shape
            )));
        }
        let (tile_linear, in_tile) = self.tile_of(pos);
        self.load_tile(col, tile_linear)?;
        let esz = self.elem_sizes[col];
        let mut encoded = Vec::with_capacity(esz);
        Codec::for_type(v.data_type()).encode(v, endian, &mut encoded)?;
        if encoded.len() != esz {
            return Err(TableError::TypeMismatch(format!(
                "element of {} bytes in a column of {esz}-byte cells",
                encoded.len()
            )));
        }
        let key = self.cache_key(col, tile_linear);
        let tile = self
            .cache
            .get_mut(key)
            .ok_or_else(|| TableError::Corrupt("tile lost from cache".into()))?;
        let start = in_tile as usize * esz;
        tile.bytes[start..start + esz].copy_from_slice(&encoded);
        tile.dirty = true;
        self.cache.record_write();
        Ok(())
    }

    /// Size the cache for a sweep of `(start, length)` along
    /// `axis_path` (fastest-varying axis first).
    pub fn prepare_access(&mut self, start: &[u64], length: &[u64], axis_path: &[usize]) -> Result<()> {
        let counts = tiles_touched(start, length, self.tile_shape.dims());
        let evicted = self.cache.resize_for_access(&counts, axis_path);
        for (key, bytes) in evicted {
            self.write_tile(key, &bytes)?;
        }
        Ok(())
    }

    /// Grow or shrink the last (row) axis. Cached tiles are dropped
    /// first: tile bounds change, so no stale buffer may survive.
    pub fn resize_last_axis(&mut self, new_extent: u64) -> Result<()> {
        self.flush(false)?;
        for (key, bytes) in self.cache.clear() {
            self.write_tile(key, &bytes)?;
        }
        let mut dims = self.cube_shape.dims().to_vec();
        let last = dims.len() - 1;
        let old_extent = dims[last];
        dims[last] = new_extent;
        self.cube_shape = Shape::new(dims);
        if new_extent < old_extent {
            let group = tile_group_bytes(&self.tile_shape, &self.elem_sizes) as u64;
            let n_tiles: u64 = self.tile_grid().iter().product();
            self.file.truncate_to((n_tiles * group).min(self.file.len()))?;
        }
        Ok(())
    }

    /// Drop every cached tile (writing dirty ones back). Reads after a
    /// clear return identical values; only the statistics differ.
    pub fn clear_cache(&mut self) -> Result<()> {
        for (key, bytes) in self.cache.clear() {
            self.write_tile(key, &bytes)?;
        }
        self.cache.reset_stats();
        Ok(())
    }

    pub fn flush(&mut self, sync: bool) -> Result<()> {
        for (key, bytes) in self.cache.dirty_tiles() {
            self.write_tile(key, &bytes)?;
        }
        self.file.flush()?;
        if sync {
            self.file.sync()?;
        }
        Ok(())
    }
}

fn elem_sizes(dtypes: &[DataType]) -> Result<Vec<usize>> {
    dtypes
        .iter()
        .map(|&t| {
            Codec::for_type(t).fixed_size.ok_or_else(|| {
                TableError::Unsupported(format!(
                    "tiled storage requires fixed-size elements, got {t:?}"
                ))
            })
        })
        .collect()
}

fn check_shapes(cube: &Shape, tile: &Shape) -> Result<()> {
    if cube.ndim() != tile.ndim() {
        return Err(TableError::ShapeMismatch(format!(
            "tile shape {tile} does not match cube shape {cube}"
        )));
    }
    for i in 0..cube.ndim() {
        if tile.dims()[i] == 0 || tile.dims()[i] > cube.dims()[i].max(1) {
            return Err(TableError::ShapeMismatch(format!(
                "tile extent {} outside [1, {}] on axis {i}",
                tile.dims()[i],
                cube.dims()[i]
            )));
        }
    }
    Ok(())
}

fn tile_group_bytes(tile_shape: &Shape, elem_sizes: &[usize]) -> usize {
    let elems = tile_shape.product() as usize;
    elem_sizes.iter().map(|&s| s * elems).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use tempfile::tempdir;

    fn new_cube(dir: &Path, cube: Vec<u64>, tile: Vec<u64>) -> Hypercube {
        Hypercube::create(
            &dir.join("t.f0c0"),
            Shape::new(cube),
            Shape::new(tile),
            &[DataType::I32],
            1 << 20,
        )
        .unwrap()
    }

    #[test]
    fn test_elem_round_trip_across_tiles() {
        let dir = tempdir().unwrap();
        let mut cube = new_cube(dir.path(), vec![10, 8], vec![4, 3]);
        let e = Endian::Little;
        for y in 0..8u64 {
            for x in 0..10u64 {
                cube.put_elem(0, e, &[x, y], &Value::I32((x + y * 10) as i32)).unwrap();
            }
        }
        for y in 0..8u64 {
            for x in 0..10u64 {
                assert_eq!(
                    cube.get_elem(0, DataType::I32, e, &[x, y]).unwrap(),
                    Value::I32((x + y * 10) as i32)
                );
            }
        }
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let e = Endian::Big;
        {
            let mut cube = new_cube(dir.path(), vec![6, 6], vec![2, 2]);
            cube.put_elem(0, e, &[5, 5], &Value::I32(99)).unwrap();
            cube.flush(false).unwrap();
        }
        let mut cube = Hypercube::open(
            &dir.path().join("t.f0c0"),
            Shape::new(vec![6, 6]),
            Shape::new(vec![2, 2]),
            &[DataType::I32],
            1 << 20,
            false,
        )
        .unwrap();
        assert_eq!(cube.get_elem(0, DataType::I32, e, &[5, 5]).unwrap(), Value::I32(99));
        // Unwritten cells read as zero.
        assert_eq!(cube.get_elem(0, DataType::I32, e, &[0, 0]).unwrap(), Value::I32(0));
    }

    #[test]
    fn test_out_of_cube_access_is_fatal() {
        let dir = tempdir().unwrap();
        let mut cube = new_cube(dir.path(), vec![4, 4], vec![2, 2]);
        let e = Endian::Little;
        assert!(matches!(
            cube.get_elem(0, DataType::I32, e, &[4, 0]),
            Err(TableError::ShapeMismatch(_))
        ));
        assert!(matches!(
            cube.put_elem(0, e, &[0, 4], &Value::I32(1)),
            Err(TableError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_values_survive_cache_clear() {
        let dir = tempdir().unwrap();
        let mut cube = new_cube(dir.path(), vec![8, 8], vec![2, 2]);
        let e = Endian::Little;
        for x in 0..8u64 {
            cube.put_elem(0, e, &[x, 3], &Value::I32(x as i32 * 7)).unwrap();
        }
        cube.clear_cache().unwrap();
        assert_eq!(cube.stats(), CacheStats::default());
        for x in 0..8u64 {
            assert_eq!(
                cube.get_elem(0, DataType::I32, e, &[x, 3]).unwrap(),
                Value::I32(x as i32 * 7)
            );
        }
    }

    #[test]
    fn test_resize_last_axis_preserves_existing() {
        let dir = tempdir().unwrap();
        let mut cube = new_cube(dir.path(), vec![4, 2], vec![2, 1]);
        let e = Endian::Little;
        cube.put_elem(0, e, &[1, 1], &Value::I32(41)).unwrap();
        cube.resize_last_axis(5).unwrap();
        assert_eq!(cube.cube_shape().dims(), &[4, 5]);
        assert_eq!(cube.get_elem(0, DataType::I32, e, &[1, 1]).unwrap(), Value::I32(41));
        cube.put_elem(0, e, &[0, 4], &Value::I32(7)).unwrap();
        assert_eq!(cube.get_elem(0, DataType::I32, e, &[0, 4]).unwrap(), Value::I32(7));
    }

    #[test]
    fn test_two_columns_share_tile_groups() {
        let dir = tempdir().unwrap();
        let mut cube = Hypercube::create(
            &dir.path().join("t.f0c0"),
            Shape::new(vec![4, 4]),
            Shape::new(vec![2, 2]),
            &[DataType::I32, DataType::F64],
            1 << 20,
        )
        .unwrap();
        let e = Endian::Little;
        cube.put_elem(0, e, &[3, 3], &Value::I32(5)).unwrap();
        cube.put_elem(1, e, &[3, 3], &Value::F64(2.5)).unwrap();
        assert_eq!(cube.get_elem(0, DataType::I32, e, &[3, 3]).unwrap(), Value::I32(5));
        assert_eq!(cube.get_elem(1, DataType::F64, e, &[3, 3]).unwrap(), Value::F64(2.5));
    }
}
