//! The `table.info` record.
//!
//! Three user-visible fields persisted as plain text next to the
//! header: a free-form type tag, a sub-type, and readme lines.

use std::path::Path;

use crate::Result;

const INFO_FILE: &str = "table.info";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInfo {
    pub table_type: String,
    pub sub_type: String,
    pub readme: Vec<String>,
}

impl TableInfo {
    pub fn new(table_type: &str, sub_type: &str) -> Self {
        Self {
            table_type: table_type.to_string(),
            sub_type: sub_type.to_string(),
            readme: Vec::new(),
        }
    }

    pub fn add_readme_line(&mut self, line: &str) {
        self.readme.push(line.to_string());
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let mut text = String::new();
        text.push_str(&format!("Type = {}\n", self.table_type));
        text.push_str(&format!("SubType = {}\n", self.sub_type));
        for line in &self.readme {
            text.push_str(line);
            text.push('\n');
        }
        std::fs::write(dir.join(INFO_FILE), text)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(INFO_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let mut info = Self::default();
        for (i, line) in text.lines().enumerate() {
            if i == 0 {
                if let Some(v) = line.strip_prefix("Type = ") {
                    info.table_type = v.to_string();
                    continue;
                }
            }
            if i == 1 {
                if let Some(v) = line.strip_prefix("SubType = ") {
                    info.sub_type = v.to_string();
                    continue;
                }
            }
            info.readme.push(line.to_string());
        }
        Ok(info)
    }
}
