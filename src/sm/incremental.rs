//! Incremental storage manager.
//!
//! Columns that mostly stay constant across consecutive rows are
//! stored as run-length intervals: per column, a sorted sequence of
//! `(start_row, value)` entries where the value at row `r` is the
//! entry with the greatest start at or below `r`. All resident columns
//! share one bucket sequence; each bucket covers a contiguous row
//! range and always carries, for every column, an entry at its first
//! row (a run spanning a bucket boundary repeats its value there).
//!
//! Invariants, per column and bucket, after every mutation:
//! - entry starts are strictly increasing;
//! - no two adjacent entries encode the same value;
//! - the serialized bucket fits its byte budget.
//!
//! A put that breaks the byte budget splits the bucket: a cheap
//! append split when writing at the tail of the last bucket, otherwise
//! a general split at the entry boundary that best balances the two
//! halves.

use serde::{Deserialize, Serialize};

use super::{SmContext, SmType, StorageManager};
use crate::data::{Codec, DataType, Endian, Value};
use crate::store::{BucketId, BucketStore};
use crate::table::schema::{ColumnDesc, ColumnKind};
use crate::{check_row, Result, TableError};

const DEFAULT_BUCKET_SIZE: usize = 32 * 1024;
const CACHE_BUCKETS: usize = 16;

// Serialized bucket: [u16 ncols] then per column [u16 nentries] and
// entries [u32 rel_row][u32 len][bytes].
const BUCKET_HEADER: usize = 2;
const COLUMN_HEADER: usize = 2;
const ENTRY_HEADER: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct IsmState {
    version: u32,
    bucket_size: usize,
    nrow: u64,
    free: Vec<BucketId>,
    high_water: BucketId,
    /// Ordered `(start_row, bucket)` pairs; the first start is 0.
    index: Vec<(u64, BucketId)>,
}

/// One interval entry, start stored relative to its bucket.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    rel: u64,
    bytes: Vec<u8>,
}

/// Decoded bucket: one entry list per resident column.
#[derive(Debug, Clone)]
struct DecodedBucket {
    cols: Vec<Vec<Entry>>,
}

impl DecodedBucket {
    fn serialized_size(&self) -> usize {
        BUCKET_HEADER
            + self
                .cols
                .iter()
                .map(|c| {
                    COLUMN_HEADER
                        + c.iter().map(|e| ENTRY_HEADER + e.bytes.len()).sum::<usize>()
                })
                .sum::<usize>()
    }
}

/// Run-length interval storage manager for slowly-varying scalar
/// columns. The column set is fixed at creation.
pub struct IncrementalSm {
    name: String,
    seq: u32,
    endian: Endian,
    bucket_size: usize,
    columns: Vec<ColumnDesc>,
    nrow: u64,
    store: BucketStore,
    index: Vec<(u64, BucketId)>,
}

impl IncrementalSm {
    /// Spec options: `{"bucket_size": N}`.
    pub fn create(name: &str, ctx: &SmContext<'_>, spec: &serde_json::Value) -> Result<Self> {
        let bucket_size = spec
            .get("bucket_size")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_BUCKET_SIZE);
        for desc in &ctx.columns {
            if !accepts_desc(desc) {
                return Err(TableError::Unsupported(format!(
                    "incremental manager cannot store column {}",
                    desc.name
                )));
            }
        }
        let mut store =
            BucketStore::create(&ctx.data_path(""), ctx.page_size, bucket_size, CACHE_BUCKETS)?;
        // The first bucket carries one default-valued entry per column
        // and covers the whole initial row range.
        let first = store.allocate()?;
        let mut sm = Self {
            name: name.to_string(),
            seq: ctx.seq,
            endian: ctx.endian,
            bucket_size,
            columns: ctx.columns.clone(),
            nrow: ctx.nrow,
            store,
            index: vec![(0, first)],
        };
        let mut cols = Vec::with_capacity(sm.columns.len());
        for desc in &sm.columns {
            let default = Value::default_for(desc.dtype)?;
            let mut bytes = Vec::new();
            Codec::for_type(desc.dtype).encode(&default, sm.endian, &mut bytes)?;
            cols.push(vec![Entry { rel: 0, bytes }]);
        }
        let decoded = DecodedBucket { cols };
        if decoded.serialized_size() > bucket_size {
            return Err(TableError::Unsupported(format!(
                "bucket size {bucket_size} cannot hold one entry per column"
            )));
        }
        sm.write_decoded(first, &decoded)?;
        Ok(sm)
    }

    pub fn open(name: &str, ctx: &SmContext<'_>, state: &serde_json::Value) -> Result<Self> {
        let st: IsmState = serde_json::from_value(state.clone())
            .map_err(|e| TableError::Corrupt(format!("bad incremental SM state: {e}")))?;
        if st.version > 1 {
            return Err(TableError::VersionMismatch { expected: 1, actual: st.version });
        }
        if st.index.is_empty() || st.index[0].0 != 0 {
            return Err(TableError::Corrupt(
                "incremental SM index does not start at row 0".into(),
            ));
        }
        let store = BucketStore::open(
            &ctx.data_path(""),
            ctx.page_size,
            st.bucket_size,
            CACHE_BUCKETS,
            st.free.iter().copied(),
            st.high_water,
            ctx.writable,
        )?;
        Ok(Self {
            name: name.to_string(),
            seq: ctx.seq,
            endian: ctx.endian,
            bucket_size: st.bucket_size,
            columns: ctx.columns.clone(),
            nrow: st.nrow,
            store,
            index: st.index,
        })
    }

    fn col_desc(&self, col: usize) -> Result<&ColumnDesc> {
        self.columns.get(col).ok_or_else(|| {
            TableError::ColumnNotFound(format!("column index {col} in manager {}", self.name))
        })
    }

    /// Index position of the bucket covering `row`.
    fn locate(&self, row: u64) -> usize {
        // Last index entry with start <= row.
        self.index.partition_point(|&(start, _)| start <= row) - 1
    }

    /// Covered row range `[start, end)` of the bucket at `pos`.
    fn coverage(&self, pos: usize) -> (u64, u64) {
        let start = self.index[pos].0;
        let end = self
            .index
            .get(pos + 1)
            .map(|&(s, _)| s)
            .unwrap_or(self.nrow.max(start));
        (start, end)
    }

    fn decode_bucket(&mut self, id: BucketId) -> Result<DecodedBucket> {
        let endian = self.endian;
        let n_cols = self.columns.len();
        let image = self.store.get(id)?;
        let mut pos = 0usize;
        let read_u16 = |buf: &[u8], pos: &mut usize| -> Result<u16> {
            if *pos + 2 > buf.len() {
                return Err(TableError::Corrupt("truncated interval bucket".into()));
            }
            let v = endian.read_u16(&buf[*pos..*pos + 2]);
            *pos += 2;
            Ok(v)
        };
        let read_u32 = |buf: &[u8], pos: &mut usize| -> Result<u32> {
            if *pos + 4 > buf.len() {
                return Err(TableError::Corrupt("truncated interval bucket".into()));
            }
            let v = endian.read_u32(&buf[*pos..*pos + 4]);
            *pos += 4;
            Ok(v)
        };
        let ncols_disk = read_u16(image, &mut pos)? as usize;
        if ncols_disk != n_cols {
            return Err(TableError::Corrupt(format!(
                "interval bucket {id} holds {ncols_disk} columns, manager has {n_cols}"
            )));
        }
        let mut cols = Vec::with_capacity(n_cols);
        for _ in 0..n_cols {
            let n_entries = read_u16(image, &mut pos)? as usize;
            let mut entries = Vec::with_capacity(n_entries);
            for _ in 0..n_entries {
                let rel = read_u32(image, &mut pos)? as u64;
                let len = read_u32(image, &mut pos)? as usize;
                if pos + len > image.len() {
                    return Err(TableError::Corrupt("truncated interval entry".into()));
                }
                entries.push(Entry { rel, bytes: image[pos..pos + len].to_vec() });
                pos += len;
            }
            cols.push(entries);
        }
        Ok(DecodedBucket { cols })
    }

    fn write_decoded(&mut self, id: BucketId, bucket: &DecodedBucket) -> Result<()> {
        let endian = self.endian;
        let mut image = Vec::with_capacity(self.bucket_size);
        endian.put_u16(&mut image, bucket.cols.len() as u16);
        for entries in &bucket.cols {
            endian.put_u16(&mut image, entries.len() as u16);
            for e in entries {
                endian.put_u32(&mut image, e.rel as u32);
                endian.put_u32(&mut image, e.bytes.len() as u32);
                image.extend_from_slice(&e.bytes);
            }
        }
        if image.len() > self.bucket_size {
            return Err(TableError::Corrupt(format!(
                "interval bucket image of {} bytes exceeds bucket size {}",
                image.len(),
                self.bucket_size
            )));
        }
        image.resize(self.bucket_size, 0);
        self.store.put(id, image)
    }

    /// Entry index of the interval active at `rel` (greatest start at
    /// or below it).
    fn active_entry(entries: &[Entry], rel: u64) -> usize {
        entries.partition_point(|e| e.rel <= rel) - 1
    }

    /// Remove any entry equal to its predecessor (the shift-left
    /// merge; removes two entries at once when a put bridged both
    /// neighbors).
    fn collapse_equal_neighbors(entries: &mut Vec<Entry>) {
        let mut i = 1;
        while i < entries.len() {
            if entries[i].bytes == entries[i - 1].bytes {
                entries.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Write the bucket back, splitting as long as it overflows its
    /// byte budget. `tail_hint` marks a put at the tail of the last
    /// bucket, which takes the cheap append-split path.
    fn store_with_splits(
        &mut self,
        pos: usize,
        bucket: DecodedBucket,
        tail_hint: Option<u64>,
    ) -> Result<()> {
        let mut work = vec![(pos, bucket, tail_hint)];
        while let Some((pos, bucket, hint)) = work.pop() {
            if bucket.serialized_size() <= self.bucket_size {
                let id = self.index[pos].1;
                self.write_decoded(id, &bucket)?;
                continue;
            }
            let (start, end) = self.coverage(pos);
            let extent = end - start;
            let split_rel = self.choose_split(&bucket, extent, hint)?;
            let (left, right) = split_at(&bucket, split_rel);
            let new_id = self.store.allocate()?;
            self.index.insert(pos + 1, (start + split_rel, new_id));
            tracing::debug!(
                manager = %self.name,
                at = start + split_rel,
                "interval bucket split"
            );
            // The right half is processed first: splitting it inserts
            // index entries above `pos + 1`, leaving the queued left
            // half's position untouched.
            work.push((pos, left, None));
            work.push((pos + 1, right, None));
        }
        Ok(())
    }

    /// Split row (relative) for an overflowing bucket.
    fn choose_split(
        &self,
        bucket: &DecodedBucket,
        extent: u64,
        tail_hint: Option<u64>,
    ) -> Result<u64> {
        // Append split: sequential writes at the tail migrate only the
        // overflow suffix into the fresh bucket. A put at row `rel`
        // leaves at most the resumed-run entry at `rel + 1` behind it.
        if let Some(rel) = tail_hint {
            if rel > 0 && rel < extent {
                let is_tail = bucket
                    .cols
                    .iter()
                    .flat_map(|c| c.iter())
                    .all(|e| e.rel <= rel + 1);
                if is_tail {
                    return Ok(rel);
                }
            }
        }
        // General split: candidates are entry boundaries; pick the one
        // that best balances the serialized halves.
        let mut candidates: Vec<u64> = bucket
            .cols
            .iter()
            .flat_map(|c| c.iter().map(|e| e.rel))
            .filter(|&r| r > 0 && r < extent)
            .collect();
        candidates.sort_unstable();
        candidates.dedup();
        if candidates.is_empty() {
            return Err(TableError::Unsupported(format!(
                "a value is too large for the bucket size {}",
                self.bucket_size
            )));
        }
        let mut best = (usize::MAX, candidates[0]);
        for &m in &candidates {
            let (left, right) = split_at(bucket, m);
            let worst = left.serialized_size().max(right.serialized_size());
            if worst < best.0 {
                best = (worst, m);
            }
        }
        Ok(best.1)
    }

    /// Pull iterator over one column's run-length intervals, in row
    /// order. Buckets are decoded one at a time as the scan advances;
    /// bucket-boundary repeats of a running value are coalesced into
    /// one yielded interval.
    pub fn scan_intervals(&mut self, col: usize) -> Result<IntervalScan<'_>> {
        self.col_desc(col)?;
        Ok(IntervalScan {
            sm: self,
            col,
            bucket_pos: 0,
            entry: 0,
            current: None,
            done: false,
        })
    }

    /// Apply `op` to the decoded bucket covering `row` and store the
    /// result, splitting on overflow.
    fn mutate_bucket(
        &mut self,
        row: u64,
        op: impl FnOnce(&mut DecodedBucket, u64, u64) -> Result<Option<u64>>,
    ) -> Result<()> {
        let pos = self.locate(row);
        let (start, end) = self.coverage(pos);
        let id = self.index[pos].1;
        let mut bucket = self.decode_bucket(id)?;
        let tail_hint = op(&mut bucket, row - start, end - start)?;
        let is_last = pos + 1 == self.index.len();
        self.store_with_splits(pos, bucket, if is_last { tail_hint } else { None })
    }
}

fn accepts_desc(desc: &ColumnDesc) -> bool {
    matches!(desc.kind, ColumnKind::Scalar) && desc.dtype != DataType::Other
}

/// Pull iterator yielding `(start_row, length, value)` runs of one
/// column. Each bucket is decoded when the scan reaches it and dropped
/// when the scan moves past it.
pub struct IntervalScan<'a> {
    sm: &'a mut IncrementalSm,
    col: usize,
    bucket_pos: usize,
    entry: usize,
    /// Run being accumulated across bucket boundaries.
    current: Option<(u64, u64, Vec<u8>)>,
    done: bool,
}

impl IntervalScan<'_> {
    fn emit(&self, bytes: &[u8]) -> Result<Value> {
        let dtype = self.sm.columns[self.col].dtype;
        let (v, _) = Codec::for_type(dtype).decode(bytes, self.sm.endian)?;
        Ok(v)
    }
}

impl Iterator for IntervalScan<'_> {
    type Item = Result<(u64, u64, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.bucket_pos >= self.sm.index.len() {
                // Flush the final run.
                self.done = true;
                let (start, len, bytes) = self.current.take()?;
                if len == 0 {
                    return None;
                }
                return Some(self.emit(&bytes).map(|v| (start, len, v)));
            }
            let (bstart, bend) = self.sm.coverage(self.bucket_pos);
            let id = self.sm.index[self.bucket_pos].1;
            let bucket = match self.sm.decode_bucket(id) {
                Ok(b) => b,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let entries = &bucket.cols[self.col];
            while self.entry < entries.len() {
                let e = &entries[self.entry];
                let abs = bstart + e.rel;
                let next = entries
                    .get(self.entry + 1)
                    .map(|n| bstart + n.rel)
                    .unwrap_or(bend);
                self.entry += 1;
                match &mut self.current {
                    Some((_, len, bytes)) if *bytes == e.bytes => {
                        // Boundary repeat: the run continues.
                        *len += next - abs;
                    }
                    Some(_) => {
                        let (start, len, bytes) =
                            self.current.replace((abs, next - abs, e.bytes.clone()))?;
                        if len > 0 {
                            return Some(self.emit(&bytes).map(|v| (start, len, v)));
                        }
                    }
                    None => {
                        self.current = Some((abs, next - abs, e.bytes.clone()));
                    }
                }
            }
            self.bucket_pos += 1;
            self.entry = 0;
        }
    }
}

/// Split a decoded bucket at relative row `m`: entries below stay
/// left; entries at or above move right, rebased; every right column
/// re-anchors at relative row 0 with the value active at the split.
fn split_at(bucket: &DecodedBucket, m: u64) -> (DecodedBucket, DecodedBucket) {
    let mut left = Vec::with_capacity(bucket.cols.len());
    let mut right = Vec::with_capacity(bucket.cols.len());
    for entries in &bucket.cols {
        let cut = entries.partition_point(|e| e.rel < m);
        let mut l: Vec<Entry> = entries[..cut].to_vec();
        let mut r: Vec<Entry> = entries[cut..]
            .iter()
            .map(|e| Entry { rel: e.rel - m, bytes: e.bytes.clone() })
            .collect();
        if r.first().map(|e| e.rel != 0).unwrap_or(true) {
            // The run active at the split continues into the right
            // bucket; repeat its value at the boundary.
            let boundary = l
                .last()
                .expect("left half holds the active run")
                .bytes
                .clone();
            r.insert(0, Entry { rel: 0, bytes: boundary });
        }
        if l.is_empty() {
            // Cannot happen for m > 0 (every column has an entry at
            // rel 0), but keep the left side structurally sound.
            l.push(r[0].clone());
        }
        left.push(l);
        right.push(r);
    }
    (DecodedBucket { cols: left }, DecodedBucket { cols: right })
}

impl StorageManager for IncrementalSm {
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
        SmType::Incremental
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
        accepts_desc(desc)
    }

    fn add_rows(&mut self, n: u64) -> Result<()> {
        // The last interval of every column covers the new rows; only
        // the row count moves.
        self.nrow += n;
        Ok(())
    }

    fn undo_add_rows(&mut self, n: u64) -> Result<()> {
        self.nrow -= n;
        Ok(())
    }

    fn remove_row(&mut self, row: u64) -> Result<()> {
        check_row(row, self.nrow)?;
        let pos = self.locate(row);
        let (start, end) = self.coverage(pos);
        let rel = row - start;
        let new_extent = end - start - 1;
        let id = self.index[pos].1;
        let mut bucket = self.decode_bucket(id)?;
        for entries in &mut bucket.cols {
            // Entries after the removed row shift one row earlier.
            for e in entries.iter_mut() {
                if e.rel > rel {
                    e.rel -= 1;
                }
            }
            // The interval that covered the removed row collapses if a
            // successor now lands on its start.
            let mut i = 0;
            while i + 1 < entries.len() {
                if entries[i].rel == entries[i + 1].rel {
                    entries.remove(i);
                } else {
                    i += 1;
                }
            }
            // A trailing single-row interval at the removed last row of
            // the bucket covers nothing now.
            while entries.len() > 1 && entries.last().map(|e| e.rel >= new_extent).unwrap_or(false)
            {
                entries.pop();
            }
            Self::collapse_equal_neighbors(entries);
        }
        // Renumber every later bucket.
        for entry in &mut self.index[pos + 1..] {
            entry.0 -= 1;
        }
        self.nrow -= 1;
        if new_extent == 0 && self.index.len() > 1 {
            // The bucket covered exactly the removed row; its successor
            // (already renumbered) takes over the range.
            self.index.remove(pos);
            self.store.free(id)?;
            return Ok(());
        }
        self.write_decoded(id, &bucket)
    }

    fn remove_column(&mut self, col: usize) -> Result<()> {
        self.col_desc(col)?;
        let ids: Vec<BucketId> = self.index.iter().map(|&(_, id)| id).collect();
        for id in ids {
            let mut bucket = self.decode_bucket(id)?;
            bucket.cols.remove(col);
            self.write_decoded(id, &bucket)?;
        }
        self.columns.remove(col);
        Ok(())
    }

    fn rename_column(&mut self, col: usize, new_name: &str) -> Result<()> {
        self.columns
            .get_mut(col)
            .ok_or_else(|| TableError::ColumnNotFound(format!("column index {col}")))?
            .name = new_name.to_string();
        Ok(())
    }

    fn get_scalar(&mut self, col: usize, row: u64) -> Result<Value> {
        let desc = self.col_desc(col)?;
        let dtype = desc.dtype;
        check_row(row, self.nrow)?;
        let pos = self.locate(row);
        let (start, _) = self.coverage(pos);
        let id = self.index[pos].1;
        let bucket = self.decode_bucket(id)?;
        let entries = &bucket.cols[col];
        let e = &entries[Self::active_entry(entries, row - start)];
        let (v, _) = Codec::for_type(dtype).decode(&e.bytes, self.endian)?;
        Ok(v)
    }

    fn put_scalar(&mut self, col: usize, row: u64, v: &Value) -> Result<()> {
        let desc = self.col_desc(col)?;
        let dtype = desc.dtype;
        if v.data_type() != dtype {
            return Err(TableError::TypeMismatch(format!(
                "cannot store {:?} in {:?} column {}",
                v.data_type(),
                dtype,
                desc.name
            )));
        }
        check_row(row, self.nrow)?;
        let mut encoded = Vec::new();
        Codec::for_type(dtype).encode(v, self.endian, &mut encoded)?;
        self.mutate_bucket(row, |bucket, rel, extent| {
            let entries = &mut bucket.cols[col];
            let p = Self::active_entry(entries, rel);
            if entries[p].bytes == encoded {
                return Ok(None);
            }
            let next_rel = entries.get(p + 1).map(|e| e.rel).unwrap_or(extent);
            let active = entries[p].clone();
            // Replace the active interval with up to three: the head
            // keeping the old value, the put row, and the tail
            // resuming the old value.
            let mut replacement = Vec::with_capacity(3);
            if rel > active.rel {
                replacement.push(active.clone());
            }
            replacement.push(Entry { rel, bytes: encoded.clone() });
            if rel + 1 < next_rel {
                replacement.push(Entry { rel: rel + 1, bytes: active.bytes });
            }
            entries.splice(p..p + 1, replacement);
            Self::collapse_equal_neighbors(entries);
            Ok(Some(rel))
        })
    }

    fn flush(&mut self, sync: bool) -> Result<()> {
        self.store.flush()?;
        if sync {
            self.store.sync()?;
        }
        Ok(())
    }

    fn state(&self) -> Result<serde_json::Value> {
        let st = IsmState {
            version: 1,
            bucket_size: self.bucket_size,
            nrow: self.nrow,
            free: self.store.free_list().collect(),
            high_water: self.store.high_water(),
            index: self.index.clone(),
        };
        serde_json::to_value(st).map_err(|e| TableError::Corrupt(e.to_string()))
    }

    fn spec_record(&self) -> serde_json::Value {
        serde_json::json!({ "bucket_size": self.bucket_size })
    }
}
