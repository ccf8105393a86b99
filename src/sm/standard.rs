//! Standard storage manager.
//!
//! Row-major packing: every resident column contributes a fixed-width
//! slot to a per-row stride, and `rows_per_bucket` whole rows pack
//! into each fixed-size bucket, so a cell's bucket and offset follow
//! from the row number alone. Variable-width cells get a 12-byte slot:
//! short values are inlined, longer ones move to an indirect store (a
//! second bucket pool) and the slot keeps the record pointer. Indirect
//! records are 1:1 with oversize cells; there is no reference
//! counting.

use serde::{Deserialize, Serialize};

use super::{SmContext, SmType, StorageManager};
use crate::data::{Codec, DataType, Endian, Shape, Value};
use crate::store::{BucketId, BucketStore};
use crate::table::schema::{ColumnDesc, ColumnKind};
use crate::{check_row, Result, TableError};

/// Slot width of a variable-length cell: tag, inline length, reserved,
/// 8-byte payload (inline bytes, or bucket + total length when
/// indirect).
const VAR_SLOT: usize = 12;
/// Longest value stored inline.
const INLINE_MAX: usize = 8;

const TAG_INLINE: u8 = 0;
const TAG_INDIRECT: u8 = 1;

/// End-of-chain marker in the indirect store.
const CHAIN_END: u32 = u32::MAX;
/// Per-bucket header in the indirect store: next (u32) + nbytes (u16).
const CHAIN_HEADER: usize = 6;

const DEFAULT_BUCKET_SIZE: usize = 32 * 1024;
const CACHE_BUCKETS: usize = 16;
const IND_CACHE_BUCKETS: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct SsmState {
    version: u32,
    bucket_size: usize,
    nrow: u64,
    free: Vec<BucketId>,
    high_water: BucketId,
    ind_free: Vec<BucketId>,
    ind_high_water: BucketId,
    n_indirect: u64,
}

struct SsmColumn {
    desc: ColumnDesc,
    offset: usize,
    width: usize,
    variable: bool,
}

/// Bucketed row-major storage manager. The default choice for columns
/// without a more specific access pattern.
pub struct StandardSm {
    name: String,
    seq: u32,
    endian: Endian,
    bucket_size: usize,
    columns: Vec<SsmColumn>,
    stride: usize,
    rows_per_bucket: u64,
    nrow: u64,
    store: BucketStore,
    indirect: BucketStore,
    n_indirect: u64,
}

fn slot_width(desc: &ColumnDesc) -> Result<(usize, bool)> {
    let elem = Codec::for_type(desc.dtype);
    match &desc.kind {
        ColumnKind::Scalar => match elem.fixed_size {
            Some(n) => Ok((n, false)),
            None if desc.dtype == DataType::Str => Ok((VAR_SLOT, true)),
            None => Err(TableError::Unsupported(format!(
                "column {} has unstorable type {:?}",
                desc.name, desc.dtype
            ))),
        },
        ColumnKind::ArrayFixed(shape) => match elem.fixed_size {
            Some(n) => Ok((shape.product() as usize * n, false)),
            None if desc.dtype == DataType::Str => Ok((VAR_SLOT, true)),
            None => Err(TableError::Unsupported(format!(
                "column {} has unstorable element type {:?}",
                desc.name, desc.dtype
            ))),
        },
        ColumnKind::ArrayVar => {
            if desc.dtype == DataType::Other {
                return Err(TableError::Unsupported(format!(
                    "column {} has unstorable element type Other",
                    desc.name
                )));
            }
            Ok((VAR_SLOT, true))
        }
    }
}

fn build_layout(descs: &[ColumnDesc], bucket_size: usize) -> Result<(Vec<SsmColumn>, usize, u64)> {
    let mut columns = Vec::with_capacity(descs.len());
    let mut offset = 0usize;
    for desc in descs {
        let (width, variable) = slot_width(desc)?;
        columns.push(SsmColumn { desc: desc.clone(), offset, width, variable });
        offset += width;
    }
    let stride = offset.max(1);
    let rows_per_bucket = (bucket_size / stride) as u64;
    if rows_per_bucket == 0 {
        return Err(TableError::Unsupported(format!(
            "row stride {stride} exceeds the bucket size {bucket_size}"
        )));
    }
    Ok((columns, stride, rows_per_bucket))
}

impl StandardSm {
    /// Spec options: `{"bucket_size": N}`.
    pub fn create(name: &str, ctx: &SmContext<'_>, spec: &serde_json::Value) -> Result<Self> {
        let bucket_size = spec
            .get("bucket_size")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_BUCKET_SIZE);
        let (columns, stride, rows_per_bucket) = build_layout(&ctx.columns, bucket_size)?;
        let store =
            BucketStore::create(&ctx.data_path(""), ctx.page_size, bucket_size, CACHE_BUCKETS)?;
        let indirect = BucketStore::create(
            &ctx.data_path("i"),
            ctx.page_size,
            bucket_size,
            IND_CACHE_BUCKETS,
        )?;
        let mut sm = Self {
            name: name.to_string(),
            seq: ctx.seq,
            endian: ctx.endian,
            bucket_size,
            columns,
            stride,
            rows_per_bucket,
            nrow: 0,
            store,
            indirect,
            n_indirect: 0,
        };
        if ctx.nrow > 0 {
            sm.add_rows(ctx.nrow)?;
        }
        Ok(sm)
    }

    pub fn open(name: &str, ctx: &SmContext<'_>, state: &serde_json::Value) -> Result<Self> {
        let st: SsmState = serde_json::from_value(state.clone())
            .map_err(|e| TableError::Corrupt(format!("bad standard SM state: {e}")))?;
        if st.version > 1 {
            return Err(TableError::VersionMismatch { expected: 1, actual: st.version });
        }
        let (columns, stride, rows_per_bucket) = build_layout(&ctx.columns, st.bucket_size)?;
        let store = BucketStore::open(
            &ctx.data_path(""),
            ctx.page_size,
            st.bucket_size,
            CACHE_BUCKETS,
            st.free.iter().copied(),
            st.high_water,
            ctx.writable,
        )?;
        let indirect = BucketStore::open(
            &ctx.data_path("i"),
            ctx.page_size,
            st.bucket_size,
            IND_CACHE_BUCKETS,
            st.ind_free.iter().copied(),
            st.ind_high_water,
            ctx.writable,
        )?;
        Ok(Self {
            name: name.to_string(),
            seq: ctx.seq,
            endian: ctx.endian,
            bucket_size: st.bucket_size,
            columns,
            stride,
            rows_per_bucket,
            nrow: st.nrow,
            store,
            indirect,
            n_indirect: st.n_indirect,
        })
    }

    fn col(&self, col: usize) -> Result<&SsmColumn> {
        self.columns.get(col).ok_or_else(|| {
            TableError::ColumnNotFound(format!("column index {col} in manager {}", self.name))
        })
    }

    /// Bucket and byte offset of a cell. One bucket, one offset; the
    /// location is a pure function of the bucket index.
    pub fn cell_locate(&self, col: usize, row: u64) -> Result<(BucketId, usize)> {
        let c = self.col(col)?;
        check_row(row, self.nrow)?;
        let bucket = (row / self.rows_per_bucket) as BucketId;
        let offset = (row % self.rows_per_bucket) as usize * self.stride + c.offset;
        Ok((bucket, offset))
    }

    /// Number of live indirect records (oversize variable cells).
    pub fn n_indirect_records(&self) -> u64 {
        self.n_indirect
    }

    fn n_buckets_for(&self, nrow: u64) -> u64 {
        nrow.div_ceil(self.rows_per_bucket)
    }

    // --- indirect store -------------------------------------------------

    fn chain_capacity(&self) -> usize {
        self.bucket_size - CHAIN_HEADER
    }

    fn write_indirect(&mut self, bytes: &[u8]) -> Result<(u32, u32)> {
        let cap = self.chain_capacity();
        let n_chunks = bytes.len().div_ceil(cap).max(1);
        let mut ids = Vec::with_capacity(n_chunks);
        for _ in 0..n_chunks {
            ids.push(self.indirect.allocate()?);
        }
        for (i, chunk) in bytes.chunks(cap).enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(CHAIN_END);
            let image = self.indirect.get_mut(ids[i])?;
            let endian = self.endian;
            endian.write_u32(&mut image[0..4], next);
            endian.write_u16(&mut image[4..6], chunk.len() as u16);
            image[CHAIN_HEADER..CHAIN_HEADER + chunk.len()].copy_from_slice(chunk);
        }
        if bytes.is_empty() {
            // Degenerate oversize record; still one chunk.
            let image = self.indirect.get_mut(ids[0])?;
            let endian = self.endian;
            endian.write_u32(&mut image[0..4], CHAIN_END);
            endian.write_u16(&mut image[4..6], 0);
        }
        self.n_indirect += 1;
        Ok((ids[0], bytes.len() as u32))
    }

    fn read_indirect(&mut self, first: u32, total_len: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len as usize);
        let mut id = first;
        while id != CHAIN_END {
            id = self.read_chain_bucket(&mut out, id)?;
            if out.len() > total_len as usize {
                return Err(TableError::Corrupt(format!(
                    "indirect record {first} longer than its recorded length"
                )));
            }
        }
        if out.len() != total_len as usize {
            return Err(TableError::Corrupt(format!(
                "indirect record {first} holds {} bytes, expected {total_len}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Append one chain bucket's payload to `out`; returns the next ID.
    fn read_chain_bucket(&mut self, out: &mut Vec<u8>, id: u32) -> Result<u32> {
        let endian = self.endian;
        let image = self.indirect.get(id)?;
        let next = endian.read_u32(&image[0..4]);
        let nbytes = endian.read_u16(&image[4..6]) as usize;
        if CHAIN_HEADER + nbytes > image.len() {
            return Err(TableError::Corrupt(format!("indirect bucket {id} overflows")));
        }
        out.extend_from_slice(&image[CHAIN_HEADER..CHAIN_HEADER + nbytes]);
        Ok(next)
    }

    fn free_indirect(&mut self, first: u32) -> Result<()> {
        let endian = self.endian;
        let mut id = first;
        while id != CHAIN_END {
            let next = {
                let image = self.indirect.get(id)?;
                endian.read_u32(&image[0..4])
            };
            self.indirect.free(id)?;
            id = next;
        }
        self.n_indirect -= 1;
        Ok(())
    }

    // --- slot access ----------------------------------------------------

    fn read_slot(&mut self, col: usize, row: u64) -> Result<Vec<u8>> {
        let (bucket, offset) = self.cell_locate(col, row)?;
        let width = self.columns[col].width;
        let image = self.store.get(bucket)?;
        Ok(image[offset..offset + width].to_vec())
    }

    fn write_slot(&mut self, col: usize, row: u64, bytes: &[u8]) -> Result<()> {
        let (bucket, offset) = self.cell_locate(col, row)?;
        debug_assert_eq!(bytes.len(), self.columns[col].width);
        let image = self.store.get_mut(bucket)?;
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Raw encoded bytes of a variable cell, inline or indirect.
    fn read_var_cell(&mut self, col: usize, row: u64) -> Result<Vec<u8>> {
        let slot = self.read_slot(col, row)?;
        match slot[0] {
            TAG_INLINE => {
                let len = slot[1] as usize;
                if len > INLINE_MAX {
                    return Err(TableError::Corrupt(format!(
                        "inline cell of {len} bytes in column {}",
                        self.columns[col].desc.name
                    )));
                }
                Ok(slot[4..4 + len].to_vec())
            }
            TAG_INDIRECT => {
                let first = self.endian.read_u32(&slot[4..8]);
                let total = self.endian.read_u32(&slot[8..12]);
                self.read_indirect(first, total)
            }
            t => Err(TableError::Corrupt(format!("unknown variable-cell tag {t}"))),
        }
    }

    /// Store encoded bytes for a variable cell, inlining when short.
    /// Any previous indirect record of the cell is freed first.
    fn write_var_cell(&mut self, col: usize, row: u64, bytes: &[u8]) -> Result<()> {
        let old = self.read_slot(col, row)?;
        if old[0] == TAG_INDIRECT {
            let first = self.endian.read_u32(&old[4..8]);
            self.free_indirect(first)?;
        }
        let mut slot = vec![0u8; VAR_SLOT];
        if bytes.len() <= INLINE_MAX {
            slot[0] = TAG_INLINE;
            slot[1] = bytes.len() as u8;
            slot[4..4 + bytes.len()].copy_from_slice(bytes);
        } else {
            let (first, total) = self.write_indirect(bytes)?;
            slot[0] = TAG_INDIRECT;
            let endian = self.endian;
            endian.write_u32(&mut slot[4..8], first);
            endian.write_u32(&mut slot[8..12], total);
        }
        self.write_slot(col, row, &slot)
    }

    fn encode_var_value(&self, col: &SsmColumn, v: &Value) -> Result<Vec<u8>> {
        match (&col.desc.kind, v) {
            (ColumnKind::Scalar, Value::Str(s)) => Ok(s.as_bytes().to_vec()),
            _ => Err(TableError::TypeMismatch(format!(
                "cannot store {:?} in variable column {}",
                v.data_type(),
                col.desc.name
            ))),
        }
    }

    fn encode_var_array(&self, shape: &Shape, data: &[Value], dtype: DataType) -> Result<Vec<u8>> {
        let codec = Codec::for_type(dtype);
        let mut out = Vec::new();
        out.push(shape.ndim() as u8);
        for &d in shape.dims() {
            self.endian.put_u32(&mut out, d as u32);
        }
        for v in data {
            codec.encode(v, self.endian, &mut out)?;
        }
        Ok(out)
    }

    fn decode_var_array(&self, bytes: &[u8], dtype: DataType) -> Result<(Shape, Vec<Value>)> {
        if bytes.is_empty() {
            // Never-written cell: empty 0-dimensional array.
            return Ok((Shape::new(vec![0]), Vec::new()));
        }
        let ndim = bytes[0] as usize;
        let mut pos = 1;
        let mut dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            if pos + 4 > bytes.len() {
                return Err(TableError::Corrupt("truncated array cell header".into()));
            }
            dims.push(self.endian.read_u32(&bytes[pos..pos + 4]) as u64);
            pos += 4;
        }
        let shape = Shape::new(dims);
        let codec = Codec::for_type(dtype);
        let mut data = Vec::with_capacity(shape.product() as usize);
        for _ in 0..shape.product() {
            let (v, used) = codec.decode(&bytes[pos..], self.endian)?;
            data.push(v);
            pos += used;
        }
        Ok((shape, data))
    }

    /// Drop the trailing `n` rows (freeing their indirect records) and
    /// release buckets whose payload is gone.
    fn truncate_rows(&mut self, n: u64) -> Result<()> {
        let new_nrow = self.nrow - n;
        for row in new_nrow..self.nrow {
            for col in 0..self.columns.len() {
                if self.columns[col].variable {
                    let slot = self.read_slot(col, row)?;
                    if slot[0] == TAG_INDIRECT {
                        let first = self.endian.read_u32(&slot[4..8]);
                        self.free_indirect(first)?;
                        self.write_slot(col, row, &vec![0u8; VAR_SLOT])?;
                    }
                }
            }
        }
        let keep = self.n_buckets_for(new_nrow);
        for b in (keep..self.n_buckets_for(self.nrow)).rev() {
            self.store.free(b as BucketId)?;
        }
        self.nrow = new_nrow;
        Ok(())
    }
}

impl StorageManager for StandardSm {
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
        SmType::Standard
    }

    fn seq(&self) -> u32 {
        self.seq
    }

    fn nrow(&self) -> u64 {
        self.nrow
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.desc.name.clone()).collect()
    }

    fn supports_add_column(&self) -> bool {
        true
    }

    fn accepts(&self, desc: &ColumnDesc) -> bool {
        slot_width(desc).is_ok()
    }

    fn add_rows(&mut self, n: u64) -> Result<()> {
        let new_nrow = self.nrow + n;
        let have = self.n_buckets_for(self.nrow);
        let need = self.n_buckets_for(new_nrow);
        for _ in have..need {
            self.store.allocate()?;
        }
        self.nrow = new_nrow;
        Ok(())
    }

    fn undo_add_rows(&mut self, n: u64) -> Result<()> {
        self.truncate_rows(n)
    }

    fn remove_row(&mut self, row: u64) -> Result<()> {
        check_row(row, self.nrow)?;
        // Free indirect records owned by the removed row before its
        // slots are overwritten.
        for col in 0..self.columns.len() {
            if self.columns[col].variable {
                let slot = self.read_slot(col, row)?;
                if slot[0] == TAG_INDIRECT {
                    let first = self.endian.read_u32(&slot[4..8]);
                    self.free_indirect(first)?;
                }
            }
        }
        // Cascade shift: each later row moves one slot earlier, crossing
        // bucket boundaries where needed.
        let k = self.rows_per_bucket;
        let stride = self.stride;
        let last_bucket = ((self.nrow - 1) / k) as BucketId;
        let first_bucket = (row / k) as BucketId;
        for b in first_bucket..=last_bucket {
            let start_row = if b == first_bucket { row % k } else { 0 } as usize;
            let rows_here = if b == last_bucket {
                ((self.nrow - 1) % k + 1) as usize
            } else {
                k as usize
            };
            {
                let image = self.store.get_mut(b)?;
                // Shift rows within the bucket.
                image.copy_within(
                    (start_row + 1) * stride..rows_here * stride,
                    start_row * stride,
                );
            }
            // Pull the first row of the next bucket into the freed tail
            // slot.
            if b < last_bucket {
                let head: Vec<u8> = {
                    let next = self.store.get(b + 1)?;
                    next[..stride].to_vec()
                };
                let image = self.store.get_mut(b)?;
                image[(rows_here - 1) * stride..rows_here * stride].copy_from_slice(&head);
            } else {
                // Clear the vacated trailing slot.
                let image = self.store.get_mut(b)?;
                for byte in &mut image[(rows_here - 1) * stride..rows_here * stride] {
                    *byte = 0;
                }
            }
        }
        self.nrow -= 1;
        // A trailing bucket whose whole payload migrated out is
        // released.
        let keep = self.n_buckets_for(self.nrow);
        if keep <= last_bucket as u64 {
            self.store.free(last_bucket)?;
        }
        Ok(())
    }

    fn add_column(&mut self, desc: &ColumnDesc) -> Result<()> {
        let (width, _variable) = slot_width(desc)?;
        // Capture every surviving row's raw slots under the old layout.
        // An SM with no columns yet has no payload to carry over.
        let old_stride = self.stride;
        let old_payload = if self.columns.is_empty() { 0 } else { old_stride };
        let mut rows: Vec<Vec<u8>> = Vec::with_capacity(self.nrow as usize);
        for row in 0..self.nrow {
            let bucket = (row / self.rows_per_bucket) as BucketId;
            let offset = (row % self.rows_per_bucket) as usize * old_stride;
            let image = self.store.get(bucket)?;
            let mut slots = image[offset..offset + old_payload].to_vec();
            slots.extend(std::iter::repeat(0).take(width));
            rows.push(slots);
        }
        // Install the new layout and rewrite the buckets.
        let mut descs: Vec<ColumnDesc> = self.columns.iter().map(|c| c.desc.clone()).collect();
        descs.push(desc.clone());
        let (columns, stride, rows_per_bucket) = build_layout(&descs, self.bucket_size)?;
        let old_buckets = self.n_buckets_for(self.nrow);
        self.columns = columns;
        self.stride = stride;
        self.rows_per_bucket = rows_per_bucket;
        let new_buckets = self.n_buckets_for(self.nrow);
        for _ in old_buckets..new_buckets {
            self.store.allocate()?;
        }
        for b in (new_buckets..old_buckets).rev() {
            self.store.free(b as BucketId)?;
        }
        for (row, slots) in rows.iter().enumerate() {
            let bucket = (row as u64 / rows_per_bucket) as BucketId;
            let offset = (row as u64 % rows_per_bucket) as usize * stride;
            let image = self.store.get_mut(bucket)?;
            image[offset..offset + stride].copy_from_slice(slots);
        }
        tracing::debug!(manager = %self.name, column = %desc.name, "added column");
        Ok(())
    }

    fn remove_column(&mut self, col: usize) -> Result<()> {
        let removed = self.col(col)?;
        let rm_offset = removed.offset;
        let rm_width = removed.width;
        let rm_variable = removed.variable;
        // Free the column's indirect records first.
        if rm_variable {
            for row in 0..self.nrow {
                let slot = self.read_slot(col, row)?;
                if slot[0] == TAG_INDIRECT {
                    let first = self.endian.read_u32(&slot[4..8]);
                    self.free_indirect(first)?;
                }
            }
        }
        let old_stride = self.stride;
        let mut rows: Vec<Vec<u8>> = Vec::with_capacity(self.nrow as usize);
        for row in 0..self.nrow {
            let bucket = (row / self.rows_per_bucket) as BucketId;
            let offset = (row % self.rows_per_bucket) as usize * old_stride;
            let image = self.store.get(bucket)?;
            let mut slots = Vec::with_capacity(old_stride - rm_width);
            slots.extend_from_slice(&image[offset..offset + rm_offset]);
            slots.extend_from_slice(&image[offset + rm_offset + rm_width..offset + old_stride]);
            rows.push(slots);
        }
        let mut descs: Vec<ColumnDesc> = self.columns.iter().map(|c| c.desc.clone()).collect();
        descs.remove(col);
        let old_buckets = self.n_buckets_for(self.nrow);
        if descs.is_empty() {
            // Sole tenant removed; the coordinator destroys this SM.
            for b in (0..old_buckets).rev() {
                self.store.free(b as BucketId)?;
            }
            self.columns.clear();
            self.stride = 1;
            self.rows_per_bucket = (self.bucket_size) as u64;
            return Ok(());
        }
        let (columns, stride, rows_per_bucket) = build_layout(&descs, self.bucket_size)?;
        self.columns = columns;
        self.stride = stride;
        self.rows_per_bucket = rows_per_bucket;
        let new_buckets = self.n_buckets_for(self.nrow);
        for _ in old_buckets..new_buckets {
            self.store.allocate()?;
        }
        for b in (new_buckets..old_buckets).rev() {
            self.store.free(b as BucketId)?;
        }
        for (row, slots) in rows.iter().enumerate() {
            let bucket = (row as u64 / rows_per_bucket) as BucketId;
            let offset = (row as u64 % rows_per_bucket) as usize * stride;
            let image = self.store.get_mut(bucket)?;
            image[offset..offset + stride].copy_from_slice(slots);
        }
        Ok(())
    }

    fn rename_column(&mut self, col: usize, new_name: &str) -> Result<()> {
        self.columns
            .get_mut(col)
            .ok_or_else(|| TableError::ColumnNotFound(format!("column index {col}")))?
            .desc
            .name = new_name.to_string();
        Ok(())
    }

    fn get_scalar(&mut self, col: usize, row: u64) -> Result<Value> {
        let c = self.col(col)?;
        if !matches!(c.desc.kind, ColumnKind::Scalar) {
            return Err(TableError::TypeMismatch(format!(
                "scalar get on array column {}",
                c.desc.name
            )));
        }
        let dtype = c.desc.dtype;
        if c.variable {
            let bytes = self.read_var_cell(col, row)?;
            let s = std::str::from_utf8(&bytes)
                .map_err(|_| TableError::Corrupt("string cell is not valid UTF-8".into()))?;
            Ok(Value::Str(s.to_string()))
        } else {
            let slot = self.read_slot(col, row)?;
            let (v, _) = Codec::for_type(dtype).decode(&slot, self.endian)?;
            Ok(v)
        }
    }

    fn put_scalar(&mut self, col: usize, row: u64, v: &Value) -> Result<()> {
        let c = self.col(col)?;
        if !matches!(c.desc.kind, ColumnKind::Scalar) {
            return Err(TableError::TypeMismatch(format!(
                "scalar put on array column {}",
                c.desc.name
            )));
        }
        let dtype = c.desc.dtype;
        if v.data_type() != dtype {
            return Err(TableError::TypeMismatch(format!(
                "cannot store {:?} in {:?} column {}",
                v.data_type(),
                dtype,
                c.desc.name
            )));
        }
        if c.variable {
            let bytes = self.encode_var_value(c, v)?;
            self.write_var_cell(col, row, &bytes)
        } else {
            let mut slot = Vec::with_capacity(c.width);
            Codec::for_type(dtype).encode(v, self.endian, &mut slot)?;
            self.write_slot(col, row, &slot)
        }
    }

    fn cell_shape(&mut self, col: usize, row: u64) -> Result<Shape> {
        let c = self.col(col)?;
        let dtype = c.desc.dtype;
        let kind = c.desc.kind.clone();
        let name = c.desc.name.clone();
        match kind {
            ColumnKind::ArrayFixed(shape) => {
                check_row(row, self.nrow)?;
                Ok(shape)
            }
            ColumnKind::ArrayVar => {
                let bytes = self.read_var_cell(col, row)?;
                Ok(self.decode_var_array(&bytes, dtype)?.0)
            }
            ColumnKind::Scalar => Err(TableError::TypeMismatch(format!(
                "array access on scalar column {name}"
            ))),
        }
    }

    fn get_array(&mut self, col: usize, row: u64) -> Result<(Shape, Vec<Value>)> {
        let c = self.col(col)?;
        let dtype = c.desc.dtype;
        let variable = c.variable;
        let kind = c.desc.kind.clone();
        let name = c.desc.name.clone();
        match kind {
            ColumnKind::ArrayFixed(shape) if !variable => {
                let slot = self.read_slot(col, row)?;
                let codec = Codec::for_type(dtype);
                let mut data = Vec::with_capacity(shape.product() as usize);
                let mut pos = 0;
                for _ in 0..shape.product() {
                    let (v, used) = codec.decode(&slot[pos..], self.endian)?;
                    data.push(v);
                    pos += used;
                }
                Ok((shape, data))
            }
            ColumnKind::ArrayFixed(_) | ColumnKind::ArrayVar => {
                let bytes = self.read_var_cell(col, row)?;
                self.decode_var_array(&bytes, dtype)
            }
            ColumnKind::Scalar => Err(TableError::TypeMismatch(format!(
                "array access on scalar column {name}"
            ))),
        }
    }

    fn put_array(&mut self, col: usize, row: u64, shape: &Shape, data: &[Value]) -> Result<()> {
        let c = self.col(col)?;
        let dtype = c.desc.dtype;
        let variable = c.variable;
        let width = c.width;
        let kind = c.desc.kind.clone();
        let name = c.desc.name.clone();
        if data.len() as u64 != shape.product() {
            return Err(TableError::ShapeMismatch(format!(
                "array data holds {} elements, shape {shape} needs {}",
                data.len(),
                shape.product()
            )));
        }
        match kind {
            ColumnKind::ArrayFixed(fixed) => {
                if &fixed != shape {
                    return Err(TableError::ShapeMismatch(format!(
                        "column {name} has fixed shape {fixed}, got {shape}"
                    )));
                }
                if variable {
                    let bytes = self.encode_var_array(shape, data, dtype)?;
                    self.write_var_cell(col, row, &bytes)
                } else {
                    let codec = Codec::for_type(dtype);
                    let mut slot = Vec::with_capacity(width);
                    for v in data {
                        codec.encode(v, self.endian, &mut slot)?;
                    }
                    self.write_slot(col, row, &slot)
                }
            }
            ColumnKind::ArrayVar => {
                let bytes = self.encode_var_array(shape, data, dtype)?;
                self.write_var_cell(col, row, &bytes)
            }
            ColumnKind::Scalar => Err(TableError::TypeMismatch(format!(
                "array put on scalar column {name}"
            ))),
        }
    }

    fn flush(&mut self, sync: bool) -> Result<()> {
        self.store.flush()?;
        self.indirect.flush()?;
        if sync {
            self.store.sync()?;
            self.indirect.sync()?;
        }
        Ok(())
    }

    fn state(&self) -> Result<serde_json::Value> {
        let st = SsmState {
            version: 1,
            bucket_size: self.bucket_size,
            nrow: self.nrow,
            free: self.store.free_list().collect(),
            high_water: self.store.high_water(),
            ind_free: self.indirect.free_list().collect(),
            ind_high_water: self.indirect.high_water(),
            n_indirect: self.n_indirect,
        };
        serde_json::to_value(st).map_err(|e| TableError::Corrupt(e.to_string()))
    }

    fn spec_record(&self) -> serde_json::Value {
        serde_json::json!({ "bucket_size": self.bucket_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::schema::ColumnDesc;
    use tempfile::tempdir;

    fn scalar(name: &str, dtype: DataType) -> ColumnDesc {
        ColumnDesc::scalar(name, dtype)
    }

    fn make_ctx<'a>(dir: &'a std::path::Path, columns: Vec<ColumnDesc>, nrow: u64) -> SmContext<'a> {
        SmContext {
            dir,
            seq: 0,
            page_size: 512,
            endian: Endian::Little,
            writable: true,
            nrow,
            columns,
        }
    }

    #[test]
    fn test_fixed_scalar_round_trip() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I32), scalar("b", DataType::F64)], 10);
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 4096})).unwrap();

        for row in 0..10u64 {
            sm.put_scalar(0, row, &Value::I32(row as i32 * 100)).unwrap();
            sm.put_scalar(1, row, &Value::F64(row as f64 * 2.5)).unwrap();
        }
        for row in 0..10u64 {
            assert_eq!(sm.get_scalar(0, row).unwrap(), Value::I32(row as i32 * 100));
            assert_eq!(sm.get_scalar(1, row).unwrap(), Value::F64(row as f64 * 2.5));
        }
    }

    #[test]
    fn test_reopen_round_trip() {
        let dir = tempdir().unwrap();
        let state;
        {
            let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I64)], 5);
            let mut sm =
                StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 1024})).unwrap();
            for row in 0..5u64 {
                sm.put_scalar(0, row, &Value::I64(row as i64 * 7)).unwrap();
            }
            sm.flush(false).unwrap();
            state = sm.state().unwrap();
        }
        let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I64)], 5);
        let mut sm = StandardSm::open("SSM", &ctx, &state).unwrap();
        assert_eq!(sm.nrow(), 5);
        for row in 0..5u64 {
            assert_eq!(sm.get_scalar(0, row).unwrap(), Value::I64(row as i64 * 7));
        }
    }

    #[test]
    fn test_string_inline_and_indirect() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("s", DataType::Str)], 3);
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 1024})).unwrap();

        // Short string: inlined, no indirect record.
        sm.put_scalar(0, 0, &Value::Str("short".into())).unwrap();
        assert_eq!(sm.n_indirect_records(), 0);

        // Long string: one indirect record.
        let long = "x".repeat(100);
        sm.put_scalar(0, 1, &Value::Str(long.clone())).unwrap();
        assert_eq!(sm.n_indirect_records(), 1);

        assert_eq!(sm.get_scalar(0, 0).unwrap(), Value::Str("short".into()));
        assert_eq!(sm.get_scalar(0, 1).unwrap(), Value::Str(long));

        // Shrinking back frees the record.
        sm.put_scalar(0, 1, &Value::Str("tiny".into())).unwrap();
        assert_eq!(sm.n_indirect_records(), 0);
        assert_eq!(sm.get_scalar(0, 1).unwrap(), Value::Str("tiny".into()));
    }

    #[test]
    fn test_very_long_string_chains() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("s", DataType::Str)], 1);
        // Bucket of 512: a 2000-byte string needs a multi-bucket chain.
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 512})).unwrap();
        let long = "abcdefgh".repeat(250);
        sm.put_scalar(0, 0, &Value::Str(long.clone())).unwrap();
        assert_eq!(sm.n_indirect_records(), 1);
        assert_eq!(sm.get_scalar(0, 0).unwrap(), Value::Str(long));
    }

    #[test]
    fn test_cell_locate_recoverability() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I32)], 100);
        // 4 bytes per row, 64 bytes per bucket: 16 rows per bucket.
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 64})).unwrap();

        let (bucket, offset) = sm.cell_locate(0, 50).unwrap();
        assert_eq!(bucket, 3);
        assert_eq!(offset, 2 * 4);

        sm.put_scalar(0, 50, &Value::I32(1234)).unwrap();
        assert_eq!(sm.get_scalar(0, 50).unwrap(), Value::I32(1234));
    }

    #[test]
    fn test_remove_row_shifts_and_releases() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I32)], 8);
        // 4 rows per bucket.
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 16})).unwrap();
        for row in 0..8u64 {
            sm.put_scalar(0, row, &Value::I32(row as i32)).unwrap();
        }
        sm.remove_row(2).unwrap();
        assert_eq!(sm.nrow(), 7);
        let expect = [0, 1, 3, 4, 5, 6, 7];
        for (row, want) in expect.iter().enumerate() {
            assert_eq!(sm.get_scalar(0, row as u64).unwrap(), Value::I32(*want));
        }
        // Removing down to 4 rows releases the second bucket.
        for _ in 0..3 {
            sm.remove_row(0).unwrap();
        }
        assert_eq!(sm.nrow(), 4);
        assert_eq!(sm.store.n_live(), 1);
    }

    #[test]
    fn test_add_column_rewrites_buckets() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I32)], 6);
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 16})).unwrap();
        for row in 0..6u64 {
            sm.put_scalar(0, row, &Value::I32(10 + row as i32)).unwrap();
        }
        sm.add_column(&scalar("b", DataType::I16)).unwrap();
        assert_eq!(sm.n_columns(), 2);
        for row in 0..6u64 {
            assert_eq!(sm.get_scalar(0, row).unwrap(), Value::I32(10 + row as i32));
            // Fresh column reads as zero.
            assert_eq!(sm.get_scalar(1, row).unwrap(), Value::I16(0));
        }
        sm.put_scalar(1, 3, &Value::I16(-5)).unwrap();
        assert_eq!(sm.get_scalar(1, 3).unwrap(), Value::I16(-5));
    }

    #[test]
    fn test_fixed_array_round_trip() {
        let dir = tempdir().unwrap();
        let desc = ColumnDesc::array_fixed("arr", DataType::F32, Shape::new(vec![2, 3]));
        let ctx = make_ctx(dir.path(), vec![desc], 2);
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 256})).unwrap();

        let shape = Shape::new(vec![2, 3]);
        let data: Vec<Value> = (0..6).map(|i| Value::F32(i as f32 + 0.5)).collect();
        sm.put_array(0, 1, &shape, &data).unwrap();
        let (back_shape, back) = sm.get_array(0, 1).unwrap();
        assert_eq!(back_shape, shape);
        assert_eq!(back, data);

        // Wrong shape is refused.
        assert!(sm
            .put_array(0, 0, &Shape::new(vec![3, 2]), &data)
            .is_err());
    }

    #[test]
    fn test_row_out_of_range() {
        let dir = tempdir().unwrap();
        let ctx = make_ctx(dir.path(), vec![scalar("a", DataType::I32)], 3);
        let mut sm =
            StandardSm::create("SSM", &ctx, &serde_json::json!({"bucket_size": 256})).unwrap();
        assert!(matches!(
            sm.get_scalar(0, 3),
            Err(TableError::RowOutOfRange { row: 3, nrow: 3 })
        ));
    }
}
