//! Column-set coordinator.
//!
//! Owns the storage-manager instances of one table and the
//! column-name to `(manager, local index)` map. Routes column
//! operations to the owning manager, assigns unique manager names, and
//! propagates row population changes to every manager atomically: a
//! mid-sequence failure rewinds the managers that already completed.

use ahash::AHashMap;
use std::path::{Path, PathBuf};

use super::header::{SmRecord, TableHeader};
use super::schema::{ColumnDesc, TableDesc};
use crate::data::Endian;
use crate::sm::{SmContext, SmRegistry, SmType, StorageManager};
use crate::{Result, TableError};

/// How a new column picks its storage manager.
#[derive(Debug, Clone)]
pub enum ColumnBinding {
    /// Any manager that accepts the column; a fresh standard manager
    /// when none does.
    Auto,
    /// The named manager, which must accept the column.
    ToManager(String),
    /// Any manager of the given type; a fresh one when none accepts.
    ToType(SmType, serde_json::Value),
    /// A new manager instance; fails on a duplicate name.
    NewManager {
        sm_type: SmType,
        name: String,
        spec: serde_json::Value,
    },
}

/// Storage-manager binding used at table creation.
#[derive(Debug, Clone)]
pub struct SmBinding {
    pub name: String,
    pub sm_type: SmType,
    pub spec: serde_json::Value,
    pub columns: Vec<String>,
}

impl SmBinding {
    pub fn new(name: &str, sm_type: SmType, spec: serde_json::Value, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            sm_type,
            spec,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

pub struct ColumnSet {
    dir: PathBuf,
    page_size: usize,
    endian: Endian,
    writable: bool,
    registry: SmRegistry,
    sms: Vec<Box<dyn StorageManager>>,
    next_seq: u32,
    col_map: AHashMap<String, (usize, usize)>,
}

impl ColumnSet {
    /// Build the managers of a new table. Columns not named by any
    /// binding land in one default standard manager.
    pub fn create(
        dir: &Path,
        desc: &TableDesc,
        bindings: &[SmBinding],
        nrow: u64,
        page_size: usize,
        endian: Endian,
    ) -> Result<Self> {
        let mut set = Self {
            dir: dir.to_path_buf(),
            page_size,
            endian,
            writable: true,
            registry: SmRegistry::new(),
            sms: Vec::new(),
            next_seq: 0,
            col_map: AHashMap::new(),
        };
        let mut bound: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut all = bindings.to_vec();
        // Leftover columns fall into one default standard manager.
        let leftover: Vec<String> = desc
            .columns
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| !bindings.iter().any(|b| b.columns.contains(name)))
            .collect();
        if !leftover.is_empty() {
            let mut name = "SSM".to_string();
            let mut n = 0;
            while all.iter().any(|b| b.name == name) {
                n += 1;
                name = format!("SSM_{n}");
            }
            all.push(SmBinding {
                name,
                sm_type: SmType::Standard,
                spec: serde_json::json!({}),
                columns: leftover,
            });
        }
        for binding in &all {
            if all
                .iter()
                .filter(|b| b.name == binding.name)
                .count()
                > 1
            {
                return Err(TableError::Duplicate(format!(
                    "storage manager {}",
                    binding.name
                )));
            }
            let columns: Vec<ColumnDesc> = binding
                .columns
                .iter()
                .map(|name| {
                    desc.column(name)
                        .cloned()
                        .ok_or_else(|| TableError::ColumnNotFound(name.clone()))
                })
                .collect::<Result<_>>()?;
            for name in &binding.columns {
                if !bound.insert(name.clone()) {
                    return Err(TableError::Duplicate(format!("column binding {name}")));
                }
            }
            let seq = set.next_seq;
            set.next_seq += 1;
            let ctx = SmContext {
                dir: &set.dir,
                seq,
                page_size,
                endian,
                writable: true,
                nrow,
                columns,
            };
            let sm = set
                .registry
                .create(binding.sm_type, &binding.name, &ctx, &binding.spec)?;
            set.sms.push(sm);
        }
        set.reindex();
        Ok(set)
    }

    /// Reopen the managers of an existing table from its header.
    pub fn open(dir: &Path, header: &TableHeader, writable: bool) -> Result<Self> {
        let mut set = Self {
            dir: dir.to_path_buf(),
            page_size: header.page_size,
            endian: header.endian,
            writable,
            registry: SmRegistry::new(),
            sms: Vec::new(),
            next_seq: 0,
            col_map: AHashMap::new(),
        };
        for rec in &header.managers {
            let sm_type = SmType::parse(&rec.sm_type)?;
            let columns: Vec<ColumnDesc> = rec
                .columns
                .iter()
                .map(|name| {
                    header
                        .desc
                        .column(name)
                        .cloned()
                        .ok_or_else(|| TableError::Corrupt(format!(
                            "manager {} references unknown column {name}",
                            rec.name
                        )))
                })
                .collect::<Result<_>>()?;
            let ctx = SmContext {
                dir: &set.dir,
                seq: rec.seq,
                page_size: header.page_size,
                endian: header.endian,
                writable,
                nrow: header.nrow,
                columns,
            };
            let sm = set.registry.open(sm_type, &rec.name, &ctx, &rec.state)?;
            set.sms.push(sm);
            set.next_seq = set.next_seq.max(rec.seq + 1);
        }
        set.reindex();
        Ok(set)
    }

    fn reindex(&mut self) {
        self.col_map.clear();
        for (sm_idx, sm) in self.sms.iter().enumerate() {
            for (local, name) in sm.column_names().into_iter().enumerate() {
                self.col_map.insert(name, (sm_idx, local));
            }
        }
    }

    /// Resolve a column name to its manager and local index.
    pub fn resolve(&self, name: &str) -> Result<(usize, usize)> {
        self.col_map
            .get(name)
            .copied()
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))
    }

    pub fn sm_mut(&mut self, idx: usize) -> &mut dyn StorageManager {
        self.sms[idx].as_mut()
    }

    pub fn sm_by_name_mut(&mut self, name: &str) -> Result<&mut (dyn StorageManager + '_)> {
        match self.sms.iter_mut().position(|s| s.name() == name) {
            Some(idx) => Ok(self.sms[idx].as_mut()),
            None => Err(TableError::ManagerNotFound(name.to_string())),
        }
    }

    pub fn n_managers(&self) -> usize {
        self.sms.len()
    }

    pub fn manager_names(&self) -> Vec<String> {
        self.sms.iter().map(|s| s.name().to_string()).collect()
    }

    /// Smallest free name: `base`, else `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        if !self.sms.iter().any(|s| s.name() == base) {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.sms.iter().any(|s| s.name() == candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Add rows to every manager; a failure rewinds the managers that
    /// already extended.
    pub fn add_rows(&mut self, n: u64) -> Result<()> {
        for i in 0..self.sms.len() {
            if let Err(e) = self.sms[i].add_rows(n) {
                for sm in &mut self.sms[..i] {
                    sm.undo_add_rows(n)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove one row from every manager. Refused up front when any
    /// manager cannot do it, keeping the operation atomic.
    pub fn remove_row(&mut self, row: u64) -> Result<()> {
        for sm in &self.sms {
            if !sm.can_remove_row(row) {
                return Err(TableError::Unsupported(format!(
                    "storage manager {} cannot remove row {row}",
                    sm.name()
                )));
            }
        }
        for sm in &mut self.sms {
            sm.remove_row(row)?;
        }
        self.reindex();
        Ok(())
    }

    /// Add a column, routed per `binding`. `nrow` is the current table
    /// row count a fresh manager must be brought up to.
    pub fn add_column(
        &mut self,
        desc: &ColumnDesc,
        binding: ColumnBinding,
        nrow: u64,
    ) -> Result<()> {
        if self.col_map.contains_key(&desc.name) {
            return Err(TableError::Duplicate(format!("column {}", desc.name)));
        }
        match binding {
            ColumnBinding::Auto => {
                if let Some(sm) = self
                    .sms
                    .iter_mut()
                    .find(|s| s.supports_add_column() && s.accepts(desc))
                {
                    sm.add_column(desc)?;
                } else {
                    let name = self.unique_name("SSM");
                    self.new_manager(SmType::Standard, &name, serde_json::json!({}), desc, nrow)?;
                }
            }
            ColumnBinding::ToManager(name) => {
                let sm = self.sm_by_name_mut(&name)?;
                if !sm.accepts(desc) {
                    return Err(TableError::Unsupported(format!(
                        "storage manager {name} does not accept column {}",
                        desc.name
                    )));
                }
                sm.add_column(desc)?;
            }
            ColumnBinding::ToType(sm_type, spec) => {
                if let Some(sm) = self
                    .sms
                    .iter_mut()
                    .find(|s| s.sm_type() == sm_type && s.supports_add_column() && s.accepts(desc))
                {
                    sm.add_column(desc)?;
                } else {
                    let name = self.unique_name(sm_type.as_str());
                    self.new_manager(sm_type, &name, spec, desc, nrow)?;
                }
            }
            ColumnBinding::NewManager { sm_type, name, spec } => {
                if self.sms.iter().any(|s| s.name() == name) {
                    return Err(TableError::Duplicate(format!("storage manager {name}")));
                }
                self.new_manager(sm_type, &name, spec, desc, nrow)?;
            }
        }
        self.reindex();
        Ok(())
    }

    fn new_manager(
        &mut self,
        sm_type: SmType,
        name: &str,
        spec: serde_json::Value,
        desc: &ColumnDesc,
        nrow: u64,
    ) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let ctx = SmContext {
            dir: &self.dir,
            seq,
            page_size: self.page_size,
            endian: self.endian,
            writable: self.writable,
            nrow,
            columns: vec![desc.clone()],
        };
        let sm = self.registry.create(sm_type, name, &ctx, &spec)?;
        self.sms.push(sm);
        tracing::debug!(manager = name, %sm_type, "created storage manager");
        Ok(())
    }

    /// Remove a column; a manager left without columns is destroyed
    /// along with its files.
    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        let (sm_idx, local) = self.resolve(name)?;
        self.sms[sm_idx].remove_column(local)?;
        if self.sms[sm_idx].n_columns() == 0 {
            let sm = self.sms.remove(sm_idx);
            let seq = sm.seq();
            let sm_name = sm.name().to_string();
            drop(sm);
            self.delete_manager_files(seq)?;
            tracing::debug!(manager = %sm_name, "destroyed empty storage manager");
        }
        self.reindex();
        Ok(())
    }

    /// Delete `table.f<seq>` and its suffixed companions.
    fn delete_manager_files(&self, seq: u32) -> Result<()> {
        let stem = format!("table.f{seq}");
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let matches = name
                .strip_prefix(&stem)
                .map(|rest| rest.is_empty() || !rest.starts_with(|c: char| c.is_ascii_digit()))
                .unwrap_or(false);
            if matches {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<()> {
        if self.col_map.contains_key(new) {
            return Err(TableError::Duplicate(format!("column {new}")));
        }
        let (sm_idx, local) = self.resolve(old)?;
        self.sms[sm_idx].rename_column(local, new)?;
        self.reindex();
        Ok(())
    }

    pub fn flush(&mut self, sync: bool) -> Result<()> {
        for sm in &mut self.sms {
            sm.flush(sync)?;
        }
        Ok(())
    }

    /// Layout records for the header (name, type, columns, spec,
    /// state).
    pub fn sm_records(&self) -> Result<Vec<SmRecord>> {
        self.sms
            .iter()
            .map(|sm| {
                Ok(SmRecord {
                    name: sm.name().to_string(),
                    sm_type: sm.sm_type().as_str().to_string(),
                    seq: sm.seq(),
                    columns: sm.column_names(),
                    spec: sm.spec_record(),
                    state: sm.state()?,
                })
            })
            .collect()
    }

    /// Reflection record: each manager with its type, columns and
    /// creation spec.
    pub fn data_manager_info(&self) -> serde_json::Value {
        let records: Vec<serde_json::Value> = self
            .sms
            .iter()
            .map(|sm| {
                serde_json::json!({
                    "name": sm.name(),
                    "type": sm.sm_type().as_str(),
                    "columns": sm.column_names(),
                    "spec": sm.spec_record(),
                })
            })
            .collect();
        serde_json::Value::Array(records)
    }
}
