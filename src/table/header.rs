//! The self-describing table header (`table.dat`).
//!
//! Layout: an endian-tagged binary prelude followed by a JSON body.
//! The prelude carries magic, the endianness tag, format version, page
//! size, row count, timestamps, and a reserved lock-info block; every
//! multi-byte prelude field after the tag is encoded in the tagged
//! byte order. The body holds the schema and the storage-manager
//! layout record as JSON text (endian-neutral by construction). A
//! CRC32 over everything precedes the final word.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::schema::TableDesc;
use crate::data::Endian;
use crate::{Result, TableError};

const MAGIC: &[u8; 8] = b"TBLBASE\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_FILE: &str = "table.dat";
/// Reserved for lock coordination data.
const LOCK_INFO_LEN: usize = 16;

/// One storage-manager instance in the layout record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmRecord {
    pub name: String,
    pub sm_type: String,
    /// Stable file-name sequence number (`table.f<seq>`).
    pub seq: u32,
    /// Names of the columns this instance owns, in local order.
    pub columns: Vec<String>,
    /// Creation-equivalent options.
    pub spec: serde_json::Value,
    /// Instance state as of the last flush.
    pub state: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeaderBody {
    desc: TableDesc,
    managers: Vec<SmRecord>,
}

/// In-memory form of `table.dat`.
#[derive(Debug)]
pub struct TableHeader {
    pub version: u32,
    pub endian: Endian,
    pub page_size: usize,
    pub nrow: u64,
    pub created_at: i64,
    pub modified_at: i64,
    pub desc: TableDesc,
    pub managers: Vec<SmRecord>,
}

impl TableHeader {
    pub fn new(desc: TableDesc, endian: Endian, page_size: usize) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            version: FORMAT_VERSION,
            endian,
            page_size,
            nrow: 0,
            created_at: now,
            modified_at: now,
            desc,
            managers: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = chrono::Utc::now().timestamp();
    }

    pub fn manager(&self, name: &str) -> Option<&SmRecord> {
        self.managers.iter().find(|m| m.name == name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let e = self.endian;
        let body = serde_json::to_vec(&HeaderBody {
            desc: self.desc.clone(),
            managers: self.managers.clone(),
        })
        .map_err(|err| TableError::Corrupt(err.to_string()))?;

        let mut buf = Vec::with_capacity(64 + body.len());
        buf.extend_from_slice(MAGIC);
        buf.push(e as u8);
        e.put_u32(&mut buf, self.version);
        e.put_u32(&mut buf, self.page_size as u32);
        e.put_u64(&mut buf, self.nrow);
        e.put_u64(&mut buf, self.created_at as u64);
        e.put_u64(&mut buf, self.modified_at as u64);
        buf.extend_from_slice(&[0u8; LOCK_INFO_LEN]);
        e.put_u32(&mut buf, body.len() as u32);
        buf.extend_from_slice(&body);
        let crc = crc32fast::hash(&buf);
        e.put_u32(&mut buf, crc);
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // 8 magic + 1 endian + 4+4+8+8+8 + lock info + 4 body len.
        let prelude = 8 + 1 + 32 + LOCK_INFO_LEN + 4;
        if bytes.len() < prelude + 4 {
            return Err(TableError::Corrupt("header file too short".into()));
        }
        if &bytes[..8] != MAGIC {
            return Err(TableError::Corrupt("bad magic in table header".into()));
        }
        let endian = Endian::from_u8(bytes[8])
            .ok_or_else(|| TableError::Corrupt(format!("bad endian tag {}", bytes[8])))?;
        let e = endian;
        let mut pos = 9;
        let version = e.read_u32(&bytes[pos..]);
        pos += 4;
        if version > FORMAT_VERSION {
            return Err(TableError::VersionMismatch {
                expected: FORMAT_VERSION,
                actual: version,
            });
        }
        let page_size = e.read_u32(&bytes[pos..]) as usize;
        pos += 4;
        let nrow = e.read_u64(&bytes[pos..]);
        pos += 8;
        let created_at = e.read_u64(&bytes[pos..]) as i64;
        pos += 8;
        let modified_at = e.read_u64(&bytes[pos..]) as i64;
        pos += 8;
        pos += LOCK_INFO_LEN;
        let body_len = e.read_u32(&bytes[pos..]) as usize;
        pos += 4;
        if bytes.len() < pos + body_len + 4 {
            return Err(TableError::Corrupt("truncated table header body".into()));
        }
        let crc_stored = e.read_u32(&bytes[pos + body_len..]);
        let crc = crc32fast::hash(&bytes[..pos + body_len]);
        if crc != crc_stored {
            return Err(TableError::Corrupt(format!(
                "header checksum mismatch ({crc:#x} != {crc_stored:#x})"
            )));
        }
        let body: HeaderBody = serde_json::from_slice(&bytes[pos..pos + body_len])
            .map_err(|err| TableError::Corrupt(format!("bad header body: {err}")))?;
        Ok(Self {
            version,
            endian,
            page_size,
            nrow,
            created_at,
            modified_at,
            desc: body.desc,
            managers: body.managers,
        })
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(HEADER_FILE), self.to_bytes()?)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(HEADER_FILE);
        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TableError::TableNotFound(dir.display().to_string()),
            _ => TableError::Io(e),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Whether `dir` looks like a table (a readable header exists).
    pub fn exists(dir: &Path) -> bool {
        dir.join(HEADER_FILE).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;
    use crate::table::schema::ColumnDesc;

    fn sample_header(endian: Endian) -> TableHeader {
        let mut desc = TableDesc::new();
        desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
        desc.keywords.set("origin", serde_json::json!("test"));
        let mut h = TableHeader::new(desc, endian, 4096);
        h.nrow = 42;
        h.managers.push(SmRecord {
            name: "SSM".into(),
            sm_type: "standard".into(),
            seq: 0,
            columns: vec!["a".into()],
            spec: serde_json::json!({"bucket_size": 4096}),
            state: serde_json::json!({"nrow": 42}),
        });
        h
    }

    #[test]
    fn test_round_trip_both_endians() {
        for endian in [Endian::Big, Endian::Little] {
            let h = sample_header(endian);
            let bytes = h.to_bytes().unwrap();
            let back = TableHeader::from_bytes(&bytes).unwrap();
            assert_eq!(back.endian, endian);
            assert_eq!(back.nrow, 42);
            assert_eq!(back.page_size, 4096);
            assert_eq!(back.desc, h.desc);
            assert_eq!(back.managers.len(), 1);
            assert_eq!(back.managers[0].name, "SSM");
        }
    }

    #[test]
    fn test_corruption_detected() {
        let h = sample_header(Endian::Little);
        let mut bytes = h.to_bytes().unwrap();
        // Flip one body byte: the checksum must catch it.
        let at = bytes.len() - 10;
        bytes[at] ^= 0xFF;
        assert!(matches!(
            TableHeader::from_bytes(&bytes),
            Err(TableError::Corrupt(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let h = sample_header(Endian::Little);
        let mut bytes = h.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            TableHeader::from_bytes(&bytes),
            Err(TableError::Corrupt(_))
        ));
    }
}
