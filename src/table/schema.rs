//! Table and column descriptions.

use serde::{Deserialize, Serialize};

use crate::data::{DataType, Shape};
use crate::{Result, TableError};

/// Free-form keyword record attached to a table or a column. Values
/// are JSON, which keeps nested records and arrays trivially
/// serializable inside the header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordRecord(serde_json::Map<String, serde_json::Value>);

impl KeywordRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Result<&serde_json::Value> {
        self.0
            .get(name)
            .ok_or_else(|| TableError::KeywordNotFound(name.to_string()))
    }

    pub fn set(&mut self, name: &str, value: serde_json::Value) {
        self.0.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Result<serde_json::Value> {
        self.0
            .remove(name)
            .ok_or_else(|| TableError::KeywordNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Cell kind of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// One scalar per row.
    Scalar,
    /// A dense array of the same shape in every row.
    ArrayFixed(Shape),
    /// A dense array whose shape may differ per row.
    ArrayVar,
}

/// Description of one column: name, element type, cell kind, and its
/// keyword record. The binding to a storage manager lives in the
/// table's layout record, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub dtype: DataType,
    pub kind: ColumnKind,
    /// Advisory upper bound on the encoded cell length.
    pub max_length: Option<u32>,
    #[serde(default)]
    pub keywords: KeywordRecord,
}

impl ColumnDesc {
    pub fn scalar(name: &str, dtype: DataType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            kind: ColumnKind::Scalar,
            max_length: None,
            keywords: KeywordRecord::new(),
        }
    }

    pub fn array_fixed(name: &str, dtype: DataType, shape: Shape) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            kind: ColumnKind::ArrayFixed(shape),
            max_length: None,
            keywords: KeywordRecord::new(),
        }
    }

    pub fn array_var(name: &str, dtype: DataType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            kind: ColumnKind::ArrayVar,
            max_length: None,
            keywords: KeywordRecord::new(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ColumnKind::Scalar)
    }
}

/// Ordered schema of a table plus the table-level keyword record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDesc {
    pub columns: Vec<ColumnDesc>,
    #[serde(default)]
    pub keywords: KeywordRecord,
}

impl TableDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(&mut self, desc: ColumnDesc) -> Result<()> {
        if self.column(&desc.name).is_some() {
            return Err(TableError::Duplicate(format!("column {}", desc.name)));
        }
        self.columns.push(desc);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDesc> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn remove_column(&mut self, name: &str) -> Result<ColumnDesc> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))?;
        Ok(self.columns.remove(idx))
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<()> {
        if self.column(new).is_some() {
            return Err(TableError::Duplicate(format!("column {new}")));
        }
        self.column_mut(old)
            .ok_or_else(|| TableError::ColumnNotFound(old.to_string()))?
            .name = new.to_string();
        Ok(())
    }
}
