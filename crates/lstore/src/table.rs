//! Record placement, the indirection/schema-encoding update protocol, and
//! the versioned read (`collapse_row`) that reconstructs the latest value
//! of each requested column.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use common::{
    ColumnIndex, DbError, DbResult, EngineConfig, Rid, INDIRECTION_COLUMN, RID_COLUMN,
    SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN,
};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use storage::{Page, PageKey, PageLayout, Pid};

use btree::BPlusTree;
use buffer::BufferPool;

use crate::directory::RangeDirectory;
use crate::disk::{DiskManager, TableMeta, TableStore};
use crate::record::{MetaRecord, Record};

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct Table {
    pub name: String,
    pub num_columns: usize,
    pub key_col: usize,
    layout: PageLayout,
    directory: Arc<RangeDirectory>,
    buffer_pool: BufferPool,

    page_directory: RwLock<HashMap<Rid, MetaRecord>>,
    tombstones: Mutex<Vec<MetaRecord>>,
    key_index: RwLock<HashMap<i64, Rid>>,
    indices: RwLock<HashMap<ColumnIndex, BPlusTree>>,

    prev_rid: Mutex<Rid>,
    prev_tid: Mutex<Rid>,
    num_rows: Mutex<u64>,

    alloc_lock: Mutex<()>,
    tail_column_lock: Mutex<()>,
    row_latches: Mutex<HashMap<Rid, Arc<RwLock<()>>>>,
    updates_since_merge: Mutex<HashMap<u64, usize>>,

    /// Weak self-handle so a query thread can hand the background merge
    /// worker an owning `Arc<Table>` without the table owning itself.
    self_ref: Mutex<Weak<Table>>,
    merge_tx: Option<Sender<(Arc<Table>, u64)>>,
    merge_worker: Option<JoinHandle<()>>,
}

impl Table {
    pub fn create(name: impl Into<String>, num_columns: usize, key_col: usize, cfg: &EngineConfig, disk: Arc<DiskManager>) -> DbResult<Arc<Self>> {
        let name = name.into();
        let layout = PageLayout::from(cfg);
        let directory = Arc::new(RangeDirectory::new(layout));
        let store = Arc::new(TableStore::new(disk, name.clone(), layout));
        let buffer_pool = BufferPool::new(cfg, directory.clone(), store);
        let (merge_tx, merge_worker) = spawn_merge_worker();

        let table = Arc::new(Self {
            name,
            num_columns,
            key_col,
            layout,
            directory,
            buffer_pool,
            page_directory: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(Vec::new()),
            key_index: RwLock::new(HashMap::new()),
            indices: RwLock::new(HashMap::new()),
            prev_rid: Mutex::new(0),
            prev_tid: Mutex::new(cfg.reserved_tid()),
            num_rows: Mutex::new(0),
            alloc_lock: Mutex::new(()),
            tail_column_lock: Mutex::new(()),
            row_latches: Mutex::new(HashMap::new()),
            updates_since_merge: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(Weak::new()),
            merge_tx: Some(merge_tx),
            merge_worker: Some(merge_worker),
        });
        *table.self_ref.lock() = Arc::downgrade(&table);
        Ok(table)
    }

    /// Rehydrates a table from its persisted meta file and page ranges.
    pub fn open(
        name: impl Into<String>,
        num_columns: usize,
        key_col: usize,
        num_page_ranges: u64,
        cfg: &EngineConfig,
        disk: Arc<DiskManager>,
    ) -> DbResult<Arc<Self>> {
        let name = name.into();
        let meta = disk.read_table_meta(&name, num_columns)?;
        let layout = PageLayout::from(cfg);
        let directory = Arc::new(RangeDirectory::new(layout));

        // Every page range the directory file knows about must exist, even
        // one left empty by deletes; every (range, inner_idx) a persisted
        // PID actually points at gets an *unloaded* page handle installed so
        // the buffer pool demand-loads its real bytes from disk on first
        // access, instead of the fresh zero-filled page `create_base_page`
        // would hand back.
        for idx in 0..num_page_ranges {
            directory.ensure_range_exists(idx);
        }
        let mut slots = std::collections::BTreeSet::new();
        for r in meta.records.iter().chain(meta.deleted.iter()) {
            for pid in r.columns.iter().flatten() {
                slots.insert((pid.page_range_idx, pid.inner_page_idx));
            }
        }
        for (range_idx, inner_idx) in slots {
            let page = Page::new_unloaded(layout.cell_size_bytes, layout.cells_per_page);
            directory.install_page(range_idx, inner_idx as usize, Arc::new(Mutex::new(page)));
        }

        let store = Arc::new(TableStore::new(disk, name.clone(), layout));
        let buffer_pool = BufferPool::new(cfg, directory.clone(), store);
        let (merge_tx, merge_worker) = spawn_merge_worker();

        let mut page_directory = HashMap::new();
        let mut key_index = HashMap::new();
        for r in meta.records {
            if r.is_base(meta.prev_rid) {
                key_index.insert(r.key, r.rid);
            }
            page_directory.insert(r.rid, r);
        }

        let table = Arc::new(Self {
            name,
            num_columns,
            key_col,
            layout,
            directory,
            buffer_pool,
            page_directory: RwLock::new(page_directory),
            tombstones: Mutex::new(meta.deleted),
            key_index: RwLock::new(key_index),
            indices: RwLock::new(HashMap::new()),
            prev_rid: Mutex::new(meta.prev_rid),
            prev_tid: Mutex::new(meta.prev_tid),
            num_rows: Mutex::new(meta.num_rows),
            alloc_lock: Mutex::new(()),
            tail_column_lock: Mutex::new(()),
            row_latches: Mutex::new(HashMap::new()),
            updates_since_merge: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(Weak::new()),
            merge_tx: Some(merge_tx),
            merge_worker: Some(merge_worker),
        });
        *table.self_ref.lock() = Arc::downgrade(&table);
        Ok(table)
    }

    /// Flushes every resident dirty page and returns the snapshot to persist
    /// in the table's meta file.
    pub fn close(&self, disk: &DiskManager) -> DbResult<()> {
        let store = TableStore::new(Arc::new(DiskManager::new(disk.data_dir())), self.name.clone(), self.layout);
        let ranges = self.directory.ranges.read();
        for range in ranges.iter() {
            for inner_idx in 0..self.layout.max_base_pages + range.tail_page_count() {
                if let Some(page) = range.get_page(inner_idx) {
                    let mut p = page.lock();
                    if p.is_dirty() {
                        let key = PageKey::new(range.range_idx, inner_idx as u64);
                        storage::PageStore::write_page(&store, key, &p)?;
                        p.clear_dirty();
                    }
                }
            }
        }
        drop(ranges);

        let pd = self.page_directory.read();
        let records: Vec<MetaRecord> = pd.values().cloned().collect();
        let meta = TableMeta {
            prev_rid: *self.prev_rid.lock(),
            prev_tid: *self.prev_tid.lock(),
            num_rows: *self.num_rows.lock(),
            records,
            deleted: self.tombstones.lock().clone(),
        };
        disk.write_table_meta(&self.name, &meta)
    }

    pub fn page_range_count(&self) -> usize {
        self.directory.range_count()
    }

    fn row_latch(&self, rid: Rid) -> Arc<RwLock<()>> {
        self.row_latches
            .lock()
            .entry(rid)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn get_open_base_page(&self, col: usize, row_number: u64) -> DbResult<Pid> {
        let total_cols = (self.num_columns + 4) as u64;
        let cells_per_page = self.layout.cells_per_page as u64;
        let row_zero_based = row_number - 1;
        let slot_index = row_zero_based / cells_per_page;
        let outer_page = slot_index * total_cols + col as u64;
        let b = self.layout.max_base_pages as u64;
        let page_range_idx = outer_page / b;
        let inner_page_idx = outer_page % b;
        let cell_idx = row_zero_based % cells_per_page;

        let _guard = self.alloc_lock.lock();
        self.directory.ensure_base_page(page_range_idx, inner_page_idx as usize)?;
        Ok(Pid::new(cell_idx, inner_page_idx, page_range_idx))
    }

    /// Appends `value` to the currently open tail page of `range_idx`,
    /// fetching it through the buffer pool so a page that is unloaded —
    /// whether because it was just reconstructed from disk on `open` or
    /// because the admission worker evicted it under pressure — gets its
    /// real bytes and `num_records` loaded before anything writes to it.
    ///
    /// `get_open_tail_page`'s own capacity check can be stale for an
    /// unloaded page (it reads `num_records == 0` before the buffer pool
    /// has loaded the true count), so a `Capacity` error from the write
    /// itself — discovered only once the page is resident — is treated as
    /// "that page is actually full" and retried against a newly allocated
    /// one.
    fn write_tail_column(&self, range_idx: u64, value: i64) -> DbResult<Pid> {
        let _guard = self.tail_column_lock.lock();
        loop {
            let (inner_idx, _) = self.directory.get_open_tail_page(range_idx);
            let pid = Pid::new(0, inner_idx as u64, range_idx);
            let page = self.buffer_pool.get_page(pid, true)?;
            let result = page.lock().write(value as u64);
            self.buffer_pool.unpin(pid.page_key());
            match result {
                Ok(record_num) => {
                    return Ok(Pid::new((record_num - 1) as u64, inner_idx as u64, range_idx));
                }
                Err(DbError::Capacity) => {
                    self.directory.force_new_tail_page(range_idx);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn insert(&self, columns: &[i64]) -> DbResult<bool> {
        if columns.len() != self.num_columns {
            return Err(DbError::Arity {
                expected: self.num_columns,
                got: columns.len(),
            });
        }
        let key = columns[self.key_col];

        let _alloc_guard = self.alloc_lock.lock();
        if self.key_index.read().contains_key(&key) {
            return Err(DbError::KeyExists);
        }

        let rid = {
            let mut prev_rid = self.prev_rid.lock();
            *prev_rid += 1;
            *prev_rid
        };
        let row_number = {
            let mut num_rows = self.num_rows.lock();
            *num_rows += 1;
            *num_rows
        };
        drop(_alloc_guard);

        let total_cols = self.num_columns + 4;
        let mut values = vec![rid as i64, rid as i64, now_millis(), 0i64];
        values.extend_from_slice(columns);

        let mut pids = Vec::with_capacity(total_cols);
        for col in 0..total_cols {
            let pid = self.get_open_base_page(col, row_number)?;
            let page = self.buffer_pool.get_page(pid, true)?;
            page.lock().write_to_cell(values[col] as u64, pid.cell_idx as usize, true)?;
            self.buffer_pool.unpin(pid.page_key());
            pids.push(Some(pid));
        }

        let meta = MetaRecord {
            rid,
            key,
            columns: pids,
            schema: 0,
        };
        self.page_directory.write().insert(rid, meta);
        self.key_index.write().insert(key, rid);

        for (&user_col, tree) in self.indices.write().iter_mut() {
            tree.insert(columns[user_col], rid);
        }

        Ok(true)
    }

    pub fn update(&self, key: i64, update_data: &[Option<i64>]) -> DbResult<bool> {
        if update_data.len() != self.num_columns {
            return Err(DbError::Arity {
                expected: self.num_columns,
                got: update_data.len(),
            });
        }
        let mut tail_schema: u64 = 0;
        for (i, v) in update_data.iter().enumerate() {
            if v.is_some() {
                tail_schema |= 1 << i;
            }
        }
        if tail_schema == 0 {
            return Ok(false);
        }

        let rid = {
            let key_index = self.key_index.read();
            *key_index.get(&key).ok_or(DbError::KeyMissing)?
        };

        let latch = self.row_latch(rid);
        let _write_guard = latch.write();

        let base_pids: Vec<Option<Pid>> = {
            let pd = self.page_directory.read();
            pd.get(&rid).ok_or(DbError::KeyMissing)?.columns.clone()
        };

        let indirection_pid = base_pids[INDIRECTION_COLUMN].unwrap();
        let old_indirection = {
            let page = self.buffer_pool.get_page(indirection_pid, true)?;
            let v = page.lock().read(indirection_pid.cell_idx as usize)?;
            self.buffer_pool.unpin(indirection_pid.page_key());
            v
        };
        let schema_pid = base_pids[SCHEMA_ENCODING_COLUMN].unwrap();
        let old_schema = {
            let page = self.buffer_pool.get_page(schema_pid, true)?;
            let v = page.lock().read(schema_pid.cell_idx as usize)?;
            self.buffer_pool.unpin(schema_pid.page_key());
            v
        };

        let new_tid = {
            let mut prev_tid = self.prev_tid.lock();
            let t = *prev_tid;
            *prev_tid -= 1;
            t
        };

        let total_cols = self.num_columns + 4;
        let mut tail_pids: Vec<Option<Pid>> = vec![None; total_cols];

        tail_pids[INDIRECTION_COLUMN] = Some(self.write_tail_column(base_pids[INDIRECTION_COLUMN].unwrap().page_range_idx, old_indirection as i64)?);
        tail_pids[RID_COLUMN] = Some(self.write_tail_column(base_pids[RID_COLUMN].unwrap().page_range_idx, new_tid as i64)?);
        tail_pids[TIMESTAMP_COLUMN] = Some(self.write_tail_column(base_pids[TIMESTAMP_COLUMN].unwrap().page_range_idx, now_millis())?);
        tail_pids[SCHEMA_ENCODING_COLUMN] = Some(self.write_tail_column(base_pids[SCHEMA_ENCODING_COLUMN].unwrap().page_range_idx, tail_schema as i64)?);

        for i in 0..self.num_columns {
            if tail_schema & (1 << i) != 0 {
                let col = 4 + i;
                let base_pid = base_pids[col].unwrap();
                let value = update_data[i].unwrap();
                tail_pids[col] = Some(self.write_tail_column(base_pid.page_range_idx, value)?);
            }
        }

        self.page_directory.write().insert(
            new_tid,
            MetaRecord {
                rid: new_tid,
                key,
                columns: tail_pids,
                schema: tail_schema,
            },
        );

        {
            let page = self.buffer_pool.get_page(indirection_pid, true)?;
            page.lock().write_to_cell(new_tid, indirection_pid.cell_idx as usize, false)?;
            self.buffer_pool.unpin(indirection_pid.page_key());
        }
        {
            let new_schema = old_schema | tail_schema;
            let page = self.buffer_pool.get_page(schema_pid, true)?;
            page.lock().write_to_cell(new_schema, schema_pid.cell_idx as usize, false)?;
            self.buffer_pool.unpin(schema_pid.page_key());
        }

        for (&user_col, tree) in self.indices.write().iter_mut() {
            if tail_schema & (1 << user_col) != 0 {
                if let Some(old_val) = tree.find_by_rid(rid) {
                    tree.remove(old_val, rid);
                }
                tree.insert(update_data[user_col].unwrap(), rid);
            }
        }

        drop(_write_guard);
        self.bump_updates_since_merge(base_pids[INDIRECTION_COLUMN].unwrap().page_range_idx);
        Ok(true)
    }

    /// The versioned read: reconstructs the latest value of every column
    /// with its bit set in `want_mask` (a mask over all `4+U` columns).
    pub fn collapse_row(&self, rid: Rid, want_mask: u64) -> DbResult<Vec<i64>> {
        let latch = self.row_latch(rid);
        let _guard = latch.read();

        let total_cols = self.num_columns + 4;
        let base = {
            let pd = self.page_directory.read();
            pd.get(&rid).cloned().ok_or(DbError::KeyMissing)?
        };

        let schema_pid = base.columns[SCHEMA_ENCODING_COLUMN].unwrap();
        let base_schema = {
            let page = self.buffer_pool.get_page(schema_pid, true)?;
            let v = page.lock().read(schema_pid.cell_idx as usize)?;
            self.buffer_pool.unpin(schema_pid.page_key());
            v
        };

        let mut resp = vec![0i64; total_cols];
        let mut need = vec![false; total_cols];
        let mut tps_all = vec![0u64; total_cols];

        for c in 0..total_cols {
            if want_mask & (1 << c) == 0 {
                continue;
            }
            let pid = base.columns[c].ok_or_else(|| DbError::Corrupt("missing base column pid".into()))?;
            let page = self.buffer_pool.get_page(pid, true)?;
            let (value, tps) = {
                let p = page.lock();
                (p.read(pid.cell_idx as usize)?, p.read_tps()?)
            };
            self.buffer_pool.unpin(pid.page_key());
            resp[c] = value as i64;
            tps_all[c] = tps;
            need[c] = c >= 4 && (base_schema >> (c - 4)) & 1 == 1;
        }

        let indirection_pid = base.columns[INDIRECTION_COLUMN].unwrap();
        let mut current_rid = {
            let page = self.buffer_pool.get_page(indirection_pid, true)?;
            let v = page.lock().read(indirection_pid.cell_idx as usize)?;
            self.buffer_pool.unpin(indirection_pid.page_key());
            v
        };

        while need.iter().any(|&n| n) && current_rid != rid {
            let tail = {
                let pd = self.page_directory.read();
                match pd.get(&current_rid) {
                    Some(m) => m.clone(),
                    None => break,
                }
            };

            for c in 4..total_cols {
                if !need[c] {
                    continue;
                }
                let bit = (tail.schema >> (c - 4)) & 1 == 1;
                if !bit {
                    continue;
                }
                if current_rid < tps_all[c] {
                    if let Some(pid) = tail.columns[c] {
                        let page = self.buffer_pool.get_page(pid, true)?;
                        let v = page.lock().read(pid.cell_idx as usize)?;
                        self.buffer_pool.unpin(pid.page_key());
                        resp[c] = v as i64;
                    }
                }
                need[c] = false;
            }

            current_rid = match tail.columns[INDIRECTION_COLUMN] {
                Some(pid) => {
                    let page = self.buffer_pool.get_page(pid, true)?;
                    let v = page.lock().read(pid.cell_idx as usize)?;
                    self.buffer_pool.unpin(pid.page_key());
                    v
                }
                None => break,
            };
        }

        resp[RID_COLUMN] = rid as i64;
        Ok(resp)
    }

    pub fn select(&self, search_key: i64, search_col: usize, query_mask: u64) -> DbResult<Vec<Record>> {
        if search_col >= self.num_columns {
            return Err(DbError::OutOfRange(search_col));
        }

        let rids: Vec<Rid> = if search_col == self.key_col {
            match self.key_index.read().get(&search_key) {
                Some(&rid) => vec![rid],
                None => Vec::new(),
            }
        } else {
            self.ensure_index(search_col)?;
            self.indices
                .read()
                .get(&search_col)
                .map(|t| t.search(search_key))
                .unwrap_or_default()
        };

        let full_mask = (query_mask << 4) | 0b1111;
        let mut out = Vec::with_capacity(rids.len());
        for rid in rids {
            let values = self.collapse_row(rid, full_mask)?;
            out.push(Record {
                rid,
                key: values[4 + self.key_col],
                columns: values[4..4 + self.num_columns].to_vec(),
            });
        }
        Ok(out)
    }

    pub fn delete(&self, key: i64) -> DbResult<bool> {
        let rid = {
            let mut key_index = self.key_index.write();
            key_index.remove(&key).ok_or(DbError::KeyMissing)?
        };

        let latch = self.row_latch(rid);
        let _guard = latch.write();

        let base = {
            let mut pd = self.page_directory.write();
            pd.remove(&rid).ok_or(DbError::KeyMissing)?
        };

        let rid_pid = base.columns[RID_COLUMN].unwrap();
        {
            let page = self.buffer_pool.get_page(rid_pid, true)?;
            page.lock().write_to_cell(0, rid_pid.cell_idx as usize, false)?;
            self.buffer_pool.unpin(rid_pid.page_key());
        }

        let indirection_pid = base.columns[INDIRECTION_COLUMN].unwrap();
        let mut current_rid = {
            let page = self.buffer_pool.get_page(indirection_pid, true)?;
            let v = page.lock().read(indirection_pid.cell_idx as usize)?;
            self.buffer_pool.unpin(indirection_pid.page_key());
            v
        };

        let mut tombstoned = vec![base.clone()];
        while current_rid != rid {
            let tail = {
                let mut pd = self.page_directory.write();
                match pd.remove(&current_rid) {
                    Some(m) => m,
                    None => break,
                }
            };
            if let Some(tail_rid_pid) = tail.columns[RID_COLUMN] {
                let page = self.buffer_pool.get_page(tail_rid_pid, true)?;
                page.lock().write_to_cell(0, tail_rid_pid.cell_idx as usize, false)?;
                self.buffer_pool.unpin(tail_rid_pid.page_key());
            }
            let next_rid = match tail.columns[INDIRECTION_COLUMN] {
                Some(pid) => {
                    let page = self.buffer_pool.get_page(pid, true)?;
                    let v = page.lock().read(pid.cell_idx as usize)?;
                    self.buffer_pool.unpin(pid.page_key());
                    v
                }
                None => break,
            };
            tombstoned.push(tail);
            current_rid = next_rid;
        }

        self.tombstones.lock().extend(tombstoned);

        for (_, tree) in self.indices.write().iter_mut() {
            if let Some(val) = tree.find_by_rid(rid) {
                tree.remove(val, rid);
            }
        }

        Ok(true)
    }

    pub fn sum(&self, start: i64, end: i64, agg_col: usize) -> DbResult<i64> {
        if agg_col >= self.num_columns {
            return Err(DbError::OutOfRange(agg_col));
        }
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        let mask = 1u64 << (4 + agg_col);
        let mut total = 0i64;
        let key_index = self.key_index.read();
        for curr_key in lo..=hi {
            if let Some(&rid) = key_index.get(&curr_key) {
                let values = self.collapse_row(rid, mask)?;
                total += values[4 + agg_col];
            }
        }
        Ok(total)
    }

    /// Best-effort read-modify-write: composed from a plain `collapse_row`
    /// read followed by `update`, with no extra latch spanning the two.
    /// Two concurrent increments on the same key can still interleave and
    /// lose one, same as the original this is ported from.
    pub fn increment(&self, key: i64, user_col: usize) -> DbResult<bool> {
        if user_col >= self.num_columns {
            return Err(DbError::OutOfRange(user_col));
        }
        let rid = match self.key_index.read().get(&key) {
            Some(&r) => r,
            None => return Ok(false),
        };
        let mask = 1u64 << (4 + user_col);
        let values = self.collapse_row(rid, mask)?;
        let mut update_data = vec![None; self.num_columns];
        update_data[user_col] = Some(values[4 + user_col] + 1);
        self.update(key, &update_data)
    }

    pub fn create_index(&self, user_col: usize) -> DbResult<()> {
        if user_col >= self.num_columns {
            return Err(DbError::OutOfRange(user_col));
        }
        self.ensure_index(user_col)
    }

    pub fn drop_index(&self, user_col: usize) -> DbResult<()> {
        if user_col >= self.num_columns {
            return Err(DbError::OutOfRange(user_col));
        }
        self.indices.write().remove(&user_col);
        Ok(())
    }

    pub fn indexed_columns(&self) -> Vec<usize> {
        let mut cols: Vec<usize> = self.indices.read().keys().copied().collect();
        cols.sort_unstable();
        cols
    }

    fn ensure_index(&self, user_col: usize) -> DbResult<()> {
        if self.indices.read().contains_key(&user_col) {
            return Ok(());
        }
        let rids: Vec<Rid> = self.key_index.read().values().copied().collect();
        let mut tree = BPlusTree::new(BPlusTree::DEFAULT_MAX_NODE_SIZE);
        let mask = 1u64 << (4 + user_col);
        for rid in rids {
            let values = self.collapse_row(rid, mask)?;
            tree.insert(values[4 + user_col], rid);
        }
        self.indices.write().entry(user_col).or_insert(tree);
        Ok(())
    }

    /// Hands the background merge worker a strong handle and the range to
    /// consolidate, once `updates_since_merge` crosses the threshold
    /// (`CELLS_PER_PAGE / 2` per base page — spec.md's suggested bound, the
    /// source left this unassigned).
    fn bump_updates_since_merge(&self, range_idx: u64) {
        let threshold = self.layout.cells_per_page / 2;
        let should_merge = {
            let mut counters = self.updates_since_merge.lock();
            let counter = counters.entry(range_idx).or_insert(0);
            *counter += 1;
            if *counter >= threshold {
                *counter = 0;
                true
            } else {
                false
            }
        };
        if should_merge {
            let Some(table) = self.self_ref.lock().upgrade() else {
                return;
            };
            log::debug!("table {}: scheduling merge for page range {}", self.name, range_idx);
            if let Some(tx) = &self.merge_tx {
                if tx.send((table, range_idx)).is_err() {
                    log::error!("table {}: merge worker channel closed", self.name);
                }
            }
        }
    }

    /// Runs a merge of `range_idx` synchronously on the calling thread,
    /// bypassing the background worker. Used by tests and by callers that
    /// want a merge's effects visible before their next read.
    pub fn merge_now(&self, range_idx: u64) -> DbResult<()> {
        crate::merge::MergeJob::new(self).run(range_idx)
    }

    pub(crate) fn directory(&self) -> &Arc<RangeDirectory> {
        &self.directory
    }

    pub(crate) fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub(crate) fn page_directory(&self) -> &RwLock<HashMap<Rid, MetaRecord>> {
        &self.page_directory
    }

    pub(crate) fn prev_rid(&self) -> Rid {
        *self.prev_rid.lock()
    }

    pub(crate) fn layout(&self) -> PageLayout {
        self.layout
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.merge_tx.take();
        if let Some(handle) = self.merge_worker.take() {
            let _ = handle.join();
        }
    }
}

/// Background merge thread: dequeues `(table, range_idx)` requests enqueued
/// by `bump_updates_since_merge` and runs each merge on its own, off the
/// query thread that tripped the threshold.
fn spawn_merge_worker() -> (Sender<(Arc<Table>, u64)>, JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::unbounded::<(Arc<Table>, u64)>();
    let handle = std::thread::spawn(move || {
        while let Ok((table, range_idx)) = rx.recv() {
            if let Err(e) = crate::merge::MergeJob::new(&table).run(range_idx) {
                log::error!("table {}: merge of range {} failed: {e}", table.name, range_idx);
            }
        }
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_table(dir: &tempfile::TempDir, num_columns: usize, key_col: usize) -> Arc<Table> {
        let cfg = EngineConfig::builder()
            .data_dir(dir.path())
            .page_size(64)
            .cell_size_bytes(8)
            .build();
        let disk = Arc::new(DiskManager::new(dir.path()));
        Table::create("t", num_columns, key_col, &cfg, disk).unwrap()
    }

    #[test]
    fn insert_assigns_increasing_rids_matching_row_number() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        for i in 0..5 {
            table.insert(&[i, i * 10]).unwrap();
        }
        assert_eq!(*table.prev_rid.lock(), 5);
        assert_eq!(*table.num_rows.lock(), 5);
    }

    #[test]
    fn insert_duplicate_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        table.insert(&[1, 10]).unwrap();
        assert!(matches!(table.insert(&[1, 20]), Err(DbError::KeyExists)));
    }

    #[test]
    fn insert_wrong_arity_errors() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 3, 0);
        assert!(matches!(table.insert(&[1, 2]), Err(DbError::Arity { .. })));
    }

    #[test]
    fn update_then_select_returns_latest_value() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 3, 0);
        table.insert(&[1, 100, 200]).unwrap();
        table.update(1, &[None, Some(111), None]).unwrap();
        let rows = table.select(1, 0, 0b111).unwrap();
        assert_eq!(rows[0].columns, vec![1, 111, 200]);
    }

    #[test]
    fn update_missing_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        assert!(matches!(
            table.update(99, &[None, Some(1)]),
            Err(DbError::KeyMissing)
        ));
    }

    #[test]
    fn repeated_updates_chain_through_indirection() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        table.insert(&[1, 0]).unwrap();
        for v in 1..=10 {
            table.update(1, &[None, Some(v)]).unwrap();
        }
        let rows = table.select(1, 0, 0b11).unwrap();
        assert_eq!(rows[0].columns, vec![1, 10]);
    }

    #[test]
    fn delete_removes_key_and_tombstones_versions() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        table.insert(&[1, 0]).unwrap();
        table.update(1, &[None, Some(5)]).unwrap();
        table.delete(1).unwrap();
        assert!(matches!(table.select(1, 0, 0b11), Ok(v) if v.is_empty()));
        assert!(matches!(table.delete(1), Err(DbError::KeyMissing)));
        assert_eq!(table.tombstones.lock().len(), 2);
    }

    #[test]
    fn sum_aggregates_over_key_range() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        for k in 1..=5 {
            table.insert(&[k, k * 10]).unwrap();
        }
        assert_eq!(table.sum(2, 4, 1).unwrap(), 20 + 30 + 40);
        assert_eq!(table.sum(4, 2, 1).unwrap(), 20 + 30 + 40);
    }

    #[test]
    fn increment_bumps_column_by_one() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        table.insert(&[1, 41]).unwrap();
        table.increment(1, 1).unwrap();
        let rows = table.select(1, 0, 0b11).unwrap();
        assert_eq!(rows[0].columns, vec![1, 42]);
    }

    #[test]
    fn create_index_then_select_by_non_key_column() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        table.insert(&[1, 7]).unwrap();
        table.insert(&[2, 9]).unwrap();
        table.create_index(1).unwrap();
        let rows = table.select(9, 1, 0b11).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, 2);
        assert_eq!(table.indexed_columns(), vec![1]);
        table.drop_index(1).unwrap();
        assert!(table.indexed_columns().is_empty());
    }

    #[test]
    fn merge_now_preserves_read_value_after_folding_tails() {
        let dir = tempfile::tempdir().unwrap();
        let table = fresh_table(&dir, 2, 0);
        table.insert(&[1, 0]).unwrap();
        for v in 1..=5 {
            table.update(1, &[None, Some(v)]).unwrap();
        }
        table.merge_now(0).unwrap();
        let rows = table.select(1, 0, 0b11).unwrap();
        assert_eq!(rows[0].columns, vec![1, 5]);
    }

    #[test]
    fn close_then_open_recovers_rid_counters_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::builder()
            .data_dir(dir.path())
            .page_size(64)
            .cell_size_bytes(8)
            .build();
        let disk = Arc::new(DiskManager::new(dir.path()));
        {
            let table = Table::create("t", 2, 0, &cfg, disk.clone()).unwrap();
            table.insert(&[1, 10]).unwrap();
            table.insert(&[2, 20]).unwrap();
            table.update(1, &[None, Some(15)]).unwrap();
            table.close(&disk).unwrap();
        }

        let table = Table::open("t", 2, 0, 1, &cfg, disk).unwrap();
        assert_eq!(*table.prev_rid.lock(), 2);
        let rows = table.select(1, 0, 0b11).unwrap();
        assert_eq!(rows[0].columns, vec![1, 15]);
    }

    #[test]
    fn update_after_close_then_open_appends_to_the_reopened_tail_page() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::builder()
            .data_dir(dir.path())
            .page_size(64)
            .cell_size_bytes(8)
            .build();
        let disk = Arc::new(DiskManager::new(dir.path()));
        {
            let table = Table::create("t", 2, 0, &cfg, disk.clone()).unwrap();
            table.insert(&[1, 10]).unwrap();
            table.update(1, &[None, Some(11)]).unwrap();
            table.close(&disk).unwrap();
        }

        // Every tail page the reopened table sees starts unloaded; updating
        // again must demand-load it through the buffer pool rather than
        // writing straight to a page that thinks it has zero records.
        let table = Table::open("t", 2, 0, 1, &cfg, disk).unwrap();
        table.update(1, &[None, Some(12)]).unwrap();
        let rows = table.select(1, 0, 0b11).unwrap();
        assert_eq!(rows[0].columns, vec![1, 12]);
    }
}
