//! Owns a name→table map and drives open/close, mirroring the original
//! `db.py`'s `Database` class. Spec.md §1 lists this as an out-of-scope
//! external collaborator — it is kept intentionally thin, forwarding all
//! storage decisions to `Table`/`DiskManager`.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use common::{DbError, DbResult, EngineConfig};
use parking_lot::RwLock;

use crate::disk::{read_indexed_columns, sanitize, write_indexed_columns, DiskManager, TableDirEntry};
use crate::table::Table;

/// A directory of tables backed by one `DiskManager`.
pub struct Database {
    cfg: EngineConfig,
    disk: Arc<DiskManager>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    pub fn new(cfg: EngineConfig) -> Self {
        let disk = Arc::new(DiskManager::new(cfg.data_dir.clone()));
        Self {
            cfg,
            disk,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Reads the database directory file and rehydrates every table it
    /// lists, including rebuilding whatever secondary indexes each table
    /// had when it was last closed.
    pub fn open(&self) -> DbResult<()> {
        let entries = self.disk.read_database_directory()?;
        let mut tables = self.tables.write();
        for entry in entries {
            let table = Table::open(
                &entry.name,
                entry.num_columns,
                entry.key_col,
                entry.num_page_ranges,
                &self.cfg,
                self.disk.clone(),
            )?;
            for col in read_indexed_columns(&self.disk, &entry.name)? {
                table.create_index(col)?;
            }
            tables.insert(entry.name.clone(), table);
        }
        Ok(())
    }

    /// Flushes every table's dirty pages and meta file, then writes a fresh
    /// database directory file — a consistent snapshot, per spec.md's
    /// non-goal ("crash recovery beyond close writes a consistent
    /// snapshot").
    pub fn close(&self) -> DbResult<()> {
        let tables = self.tables.read();
        let mut entries = Vec::with_capacity(tables.len());
        for (name, table) in tables.iter() {
            table.close(&self.disk)?;
            write_indexed_columns(&self.disk, name, &table.indexed_columns())?;
            entries.push(TableDirEntry {
                name: name.clone(),
                key_col: table.key_col,
                num_columns: table.num_columns,
                num_page_ranges: table.page_range_count() as u64,
            });
        }
        self.disk.write_database_directory(&entries)
    }

    pub fn create_table(&self, name: impl Into<String>, num_columns: usize, key_col: usize) -> DbResult<Arc<Table>> {
        let name = sanitize(&name.into());
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(DbError::NameExists(name));
        }
        self.disk.create_database()?;
        let table = Table::create(name.clone(), num_columns, key_col, &self.cfg, self.disk.clone())?;
        tables.insert(name, table.clone());
        Ok(table)
    }

    /// Removes `name` from the table map and deletes its on-disk directory.
    /// The original implementation left `drop_table` unimplemented (spec.md
    /// Open Questions); dropping a table that doesn't exist is a no-op.
    pub fn drop_table(&self, name: &str) -> DbResult<()> {
        let name = sanitize(name);
        if self.tables.write().remove(&name).is_none() {
            return Ok(());
        }
        let dir = self.disk.table_dir(&name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> DbResult<Arc<Table>> {
        let name = sanitize(name);
        self.tables
            .read()
            .get(&name)
            .cloned()
            .ok_or(DbError::NoSuchTable(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}
