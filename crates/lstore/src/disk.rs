//! On-disk layout: one `Database_Directory` file enumerating tables, one
//! `<table>/<table>_meta` file per table holding counters and the page
//! directory, and one `<table>/pagerange_<n>` file per page range holding
//! raw page bytes.
//!
//! Page-range files use a fixed slot-per-inner-index layout rather than the
//! dynamic "tail page t sits right after the last allocated base page"
//! offset a straight transcription would use — see DESIGN.md for why.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use common::{DbError, DbResult, Rid};
use storage::{Page, PageKey, PageLayout, PageStore, Pid};

use crate::record::MetaRecord;

const NEW_TABLE_SEPARATOR: &[u8; 8] = b"NewTable";
const DELETED_BEGIN: &[u8; 8] = b"bdeleted";
const DELETED_END: &[u8; 8] = b"edeleted";
const NO_DELETE: &[u8; 8] = b"nodelete";

/// One row of the database directory file.
#[derive(Clone, Debug)]
pub struct TableDirEntry {
    pub name: String,
    pub key_col: usize,
    pub num_columns: usize,
    pub num_page_ranges: u64,
}

/// Everything persisted about a table besides its page bytes.
#[derive(Clone, Debug)]
pub struct TableMeta {
    pub prev_rid: Rid,
    pub prev_tid: Rid,
    pub num_rows: u64,
    pub records: Vec<MetaRecord>,
    pub deleted: Vec<MetaRecord>,
}

/// Low-level, table-agnostic file I/O for the database directory and
/// per-table files.
pub struct DiskManager {
    data_dir: PathBuf,
}

impl DiskManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn database_directory_path(&self) -> PathBuf {
        self.data_dir.join("Database_Directory")
    }

    pub fn table_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    fn table_meta_path(&self, name: &str) -> PathBuf {
        self.table_dir(name).join(format!("{name}_meta"))
    }

    fn page_range_path(&self, name: &str, idx: u64) -> PathBuf {
        self.table_dir(name).join(format!("pagerange_{idx}"))
    }

    pub fn database_exists(&self) -> bool {
        self.database_directory_path().exists()
    }

    pub fn create_database(&self) -> DbResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if !self.database_exists() {
            self.write_database_directory(&[])?;
        }
        Ok(())
    }

    pub fn read_database_directory(&self) -> DbResult<Vec<TableDirEntry>> {
        let path = self.database_directory_path();
        if !path.exists() {
            return Err(DbError::NoSuchDatabase(self.data_dir.clone()));
        }
        let mut file = File::open(&path)?;
        let num_tables = read_u64(&mut file)?;
        let mut entries = Vec::with_capacity(num_tables as usize);
        for _ in 0..num_tables {
            let name_len = read_u64(&mut file)? as usize;
            let mut name_bytes = vec![0u8; name_len];
            file.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|e| DbError::Corrupt(format!("table name not utf-8: {e}")))?;
            let key_col = read_u64(&mut file)? as usize;
            let num_columns = read_u64(&mut file)? as usize;
            let num_page_ranges = read_u64(&mut file)?;
            let mut sep = [0u8; 8];
            file.read_exact(&mut sep)?;
            if &sep != NEW_TABLE_SEPARATOR {
                return Err(DbError::Corrupt("missing table separator".into()));
            }
            entries.push(TableDirEntry {
                name,
                key_col,
                num_columns,
                num_page_ranges,
            });
        }
        Ok(entries)
    }

    pub fn write_database_directory(&self, entries: &[TableDirEntry]) -> DbResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for e in entries {
            buf.extend_from_slice(&(e.name.len() as u64).to_le_bytes());
            buf.extend_from_slice(e.name.as_bytes());
            buf.extend_from_slice(&(e.key_col as u64).to_le_bytes());
            buf.extend_from_slice(&(e.num_columns as u64).to_le_bytes());
            buf.extend_from_slice(&e.num_page_ranges.to_le_bytes());
            buf.extend_from_slice(NEW_TABLE_SEPARATOR);
        }
        let mut file = File::create(self.database_directory_path())?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn read_table_meta(&self, name: &str, num_columns: usize) -> DbResult<TableMeta> {
        let path = self.table_meta_path(name);
        let mut file = File::open(&path)?;
        let prev_rid = read_u64(&mut file)?;
        let prev_tid = read_u64(&mut file)?;
        let page_directory_size = read_u64(&mut file)?;
        let num_rows = read_u64(&mut file)?;

        let mut tag = [0u8; 8];
        file.read_exact(&mut tag)?;
        let mut deleted = Vec::new();
        if &tag == DELETED_BEGIN {
            let num_deleted = read_u64(&mut file)?;
            for _ in 0..num_deleted {
                deleted.push(decode_record(&mut file, prev_rid, num_columns)?);
            }
            let mut end_tag = [0u8; 8];
            file.read_exact(&mut end_tag)?;
            if &end_tag != DELETED_END {
                return Err(DbError::Corrupt("missing edeleted tag".into()));
            }
        } else if &tag != NO_DELETE {
            return Err(DbError::Corrupt("missing nodelete/bdeleted tag".into()));
        }

        let mut records = Vec::with_capacity(page_directory_size as usize);
        for _ in 0..page_directory_size {
            records.push(decode_record(&mut file, prev_rid, num_columns)?);
        }

        Ok(TableMeta {
            prev_rid,
            prev_tid,
            num_rows,
            records,
            deleted,
        })
    }

    pub fn write_table_meta(&self, name: &str, meta: &TableMeta) -> DbResult<()> {
        fs::create_dir_all(self.table_dir(name))?;
        let mut buf = Vec::new();
        buf.extend_from_slice(&meta.prev_rid.to_le_bytes());
        buf.extend_from_slice(&meta.prev_tid.to_le_bytes());
        buf.extend_from_slice(&(meta.records.len() as u64).to_le_bytes());
        buf.extend_from_slice(&meta.num_rows.to_le_bytes());

        if meta.deleted.is_empty() {
            buf.extend_from_slice(NO_DELETE);
        } else {
            buf.extend_from_slice(DELETED_BEGIN);
            buf.extend_from_slice(&(meta.deleted.len() as u64).to_le_bytes());
            for r in &meta.deleted {
                encode_record(&mut buf, r, meta.prev_rid);
            }
            buf.extend_from_slice(DELETED_END);
        }

        for r in &meta.records {
            encode_record(&mut buf, r, meta.prev_rid);
        }

        let mut file = File::create(self.table_meta_path(name))?;
        file.write_all(&buf)?;
        Ok(())
    }
}

fn read_u64(file: &mut File) -> DbResult<u64> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn encode_record(buf: &mut Vec<u8>, record: &MetaRecord, prev_rid: Rid) {
    buf.extend_from_slice(&record.rid.to_le_bytes());
    buf.extend_from_slice(&(record.key as u64).to_le_bytes());
    if record.is_base(prev_rid) {
        for pid in &record.columns {
            let p = pid.expect("base record must have every column's PID populated");
            buf.extend_from_slice(&p.encode());
        }
    } else {
        buf.extend_from_slice(&record.schema.to_le_bytes());
        for pid in record.columns.iter().take(4) {
            let p = pid.expect("tail record must have every system column's PID populated");
            buf.extend_from_slice(&p.encode());
        }
        for (i, pid) in record.columns.iter().enumerate().skip(4) {
            if record.schema & (1 << (i - 4)) != 0 {
                let p = pid.expect("tail record missing PID for a schema bit it set");
                buf.extend_from_slice(&p.encode());
            }
        }
    }
}

fn decode_record(file: &mut File, prev_rid: Rid, num_columns: usize) -> DbResult<MetaRecord> {
    let rid = read_u64(file)?;
    let key = read_u64(file)? as i64;
    let total_cols = num_columns + 4;

    if rid <= prev_rid {
        let mut columns = Vec::with_capacity(total_cols);
        for _ in 0..total_cols {
            columns.push(Some(read_pid(file)?));
        }
        Ok(MetaRecord {
            rid,
            key,
            columns,
            schema: 0,
        })
    } else {
        let schema = read_u64(file)?;
        let mut columns = vec![None; total_cols];
        for slot in columns.iter_mut().take(4) {
            *slot = Some(read_pid(file)?);
        }
        for i in 0..num_columns {
            if schema & (1 << i) != 0 {
                columns[4 + i] = Some(read_pid(file)?);
            }
        }
        Ok(MetaRecord {
            rid,
            key,
            columns,
            schema,
        })
    }
}

fn read_pid(file: &mut File) -> DbResult<Pid> {
    let mut buf = [0u8; 24];
    file.read_exact(&mut buf)?;
    Ok(Pid::decode(&buf))
}

/// Implements `storage::PageStore` for one table, delegating the actual
/// file I/O to a shared `DiskManager`.
pub struct TableStore {
    disk: std::sync::Arc<DiskManager>,
    table_name: String,
    layout: PageLayout,
}

impl TableStore {
    pub fn new(disk: std::sync::Arc<DiskManager>, table_name: impl Into<String>, layout: PageLayout) -> Self {
        Self {
            disk,
            table_name: table_name.into(),
            layout,
        }
    }

    fn slot_offset(&self, inner_idx: u64) -> u64 {
        let slot_size = 8 + self.layout.page_size() as u64;
        16 + inner_idx * slot_size
    }
}

impl PageStore for TableStore {
    fn load_page(&self, key: PageKey) -> DbResult<(Vec<u8>, usize)> {
        let path = self.disk.page_range_path(&self.table_name, key.range_idx);
        let page_size = self.layout.page_size();
        let offset = self.slot_offset(key.inner_idx);
        let slot_size = 8 + page_size as u64;

        let Ok(mut file) = OpenOptions::new().read(true).open(&path) else {
            return Ok((vec![0u8; page_size], 0));
        };
        let len = file.metadata()?.len();
        if len < offset + slot_size {
            return Ok((vec![0u8; page_size], 0));
        }
        file.seek(SeekFrom::Start(offset))?;
        let num_records = read_u64(&mut file)? as usize;
        let mut data = vec![0u8; page_size];
        file.read_exact(&mut data)?;
        Ok((data, num_records))
    }

    fn write_page(&self, key: PageKey, page: &Page) -> DbResult<()> {
        let path = self.disk.page_range_path(&self.table_name, key.range_idx);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let page_size = self.layout.page_size();
        let slot_size = 8 + page_size as u64;
        let offset = self.slot_offset(key.inner_idx);

        let len = file.metadata()?.len();
        let needed = offset + slot_size;
        if len < needed.max(16) {
            file.set_len(needed.max(16))?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&(page.num_records() as u64).to_le_bytes())?;
        file.write_all(page.raw_bytes())?;

        let max_base = self.layout.max_base_pages as u64;
        let is_base = key.inner_idx < max_base;
        let mut header = [0u8; 16];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let existing_base = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let existing_tail = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let new_base = if is_base {
            existing_base.max(key.inner_idx + 1)
        } else {
            existing_base
        };
        let new_tail = if !is_base {
            existing_tail.max(key.inner_idx - max_base + 1)
        } else {
            existing_tail
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&new_base.to_le_bytes())?;
        file.write_all(&new_tail.to_le_bytes())?;

        file.flush()?;
        Ok(())
    }
}

/// Filesystem-safe table name: strips everything but letters, digits, and
/// `-_.() `, then collapses runs of spaces to a single underscore. Mirrors
/// the original's `util.sanitize`, which despite its name does not lowercase.
pub fn sanitize(name: &str) -> String {
    const VALID_PUNCTUATION: &str = "-_.() ";
    let filtered: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || VALID_PUNCTUATION.contains(*c))
        .collect();
    filtered
        .split(' ')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Serializes an index registry's column set for a table's directory entry
/// (columns that currently have a secondary index) — used by `Database` to
/// decide which indexes to rebuild on open.
pub fn index_marker_path(disk: &DiskManager, table_name: &str) -> PathBuf {
    disk.table_dir(table_name).join("indexed_columns")
}

pub fn read_indexed_columns(disk: &DiskManager, table_name: &str) -> DbResult<Vec<usize>> {
    let path = index_marker_path(disk, table_name);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let count = read_u64(&mut file)?;
    let mut cols = HashMap::new();
    for i in 0..count {
        cols.insert(i, read_u64(&mut file)? as usize);
    }
    let mut out: Vec<usize> = (0..count).map(|i| cols[&i]).collect();
    out.sort_unstable();
    Ok(out)
}

pub fn write_indexed_columns(disk: &DiskManager, table_name: &str, cols: &[usize]) -> DbResult<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(cols.len() as u64).to_le_bytes());
    for &c in cols {
        buf.extend_from_slice(&(c as u64).to_le_bytes());
    }
    let mut file = File::create(index_marker_path(disk, table_name))?;
    file.write_all(&buf)?;
    Ok(())
}
