//! Background consolidation of tail updates into base pages.
//!
//! Runs against one page range at a time: for every base page holding a
//! user column, it walks each row's indirection chain (mirroring
//! [`Table::collapse_row`]) to find the column's current value, writes the
//! reconciled values into a private copy of the page, then swaps the copy
//! in and advances the page's TPS to the newest tail folded. System-column
//! pages (indirection, rid, timestamp, schema encoding) are never merged —
//! those are mutated in place by `Table::update`/`delete`, not folded.

use std::collections::HashMap;

use common::{DbResult, Rid, INDIRECTION_COLUMN, SCHEMA_ENCODING_COLUMN};
use storage::{PageKey, PageRange, Pid};

use crate::record::MetaRecord;
use crate::table::Table;

pub struct MergeJob<'t> {
    table: &'t Table,
}

impl<'t> MergeJob<'t> {
    pub fn new(table: &'t Table) -> Self {
        Self { table }
    }

    /// Consolidates every base page of `range_idx` that holds a user column.
    pub fn run(&self, range_idx: u64) -> DbResult<()> {
        let base_page_count = {
            let ranges = self.table.directory().ranges.read();
            ranges
                .get(range_idx as usize)
                .map(PageRange::base_page_count)
                .unwrap_or(0)
        };

        let total_cols = self.table.num_columns + 4;
        let b = self.table.layout().max_base_pages;

        for inner_idx in 0..base_page_count {
            let outer_page = range_idx * b as u64 + inner_idx as u64;
            let col = (outer_page % total_cols as u64) as usize;
            if col < 4 {
                continue;
            }
            self.merge_base_page(range_idx, inner_idx, col)?;
        }

        self.table.buffer_pool().flush_unpooled()
    }

    fn merge_base_page(&self, range_idx: u64, inner_idx: usize, col: usize) -> DbResult<()> {
        let key = PageKey::new(range_idx, inner_idx as u64);
        self.table.buffer_pool().pin_merge(key);
        let result = self.merge_base_page_inner(range_idx, inner_idx, col);
        self.table.buffer_pool().unpin_merge(key);
        result
    }

    /// Reads, reconciles, and swaps in a single base page. The copy is built
    /// and written to entirely before `load(.., force=true)` installs it, so
    /// a reader never observes a half-applied merge (§4.6's contract with
    /// readers, enforced here by writing cells before the new TPS).
    fn merge_base_page_inner(&self, range_idx: u64, inner_idx: usize, col: usize) -> DbResult<()> {
        let page = self.table.buffer_pool().get_page(
            Pid::new(0, inner_idx as u64, range_idx),
            true,
        )?;
        let b = self.table.layout().max_base_pages as u64;
        let total_cols = (self.table.num_columns + 4) as u64;
        let outer_page = range_idx * b + inner_idx as u64;
        let slot_index = outer_page / total_cols;
        let cells_per_page = self.table.layout().cells_per_page as u64;

        let (num_records, current_tps) = {
            let p = page.lock();
            (p.num_records() as u64, p.read_tps()?)
        };

        let page_directory = self.table.page_directory().read();
        let mut new_min_folded: Option<Rid> = None;
        let mut updates: HashMap<usize, u64> = HashMap::new();

        for cell_idx in 0..num_records {
            let row_zero_based = slot_index * cells_per_page + cell_idx;
            let rid = row_zero_based + 1;
            let Some(base) = page_directory.get(&rid) else {
                continue; // deleted, or never allocated in this slot
            };
            if !base.is_base(self.table.prev_rid()) {
                continue;
            }

            let schema_pid = base.columns[SCHEMA_ENCODING_COLUMN].unwrap();
            let base_schema = {
                let sp = self.table.buffer_pool().get_page(schema_pid, true)?;
                let v = sp.lock().read(schema_pid.cell_idx as usize)?;
                self.table.buffer_pool().unpin(schema_pid.page_key());
                v
            };
            if (base_schema >> (col - 4)) & 1 == 0 {
                continue; // base already authoritative for this column
            }

            if let Some((value, folded_rid)) = self.newest_tail_value(&page_directory, base, col, current_tps)? {
                updates.insert(cell_idx as usize, value as u64);
                new_min_folded = Some(new_min_folded.map_or(folded_rid, |m| m.min(folded_rid)));
            }
        }
        drop(page_directory);

        if new_min_folded.is_none() {
            return Ok(());
        }

        let mut copy = page.lock().deep_copy();
        for (cell_idx, value) in &updates {
            copy.write_to_cell(*value, *cell_idx, false)?;
        }
        if let Some(folded) = new_min_folded {
            let new_tps = current_tps.min(folded);
            copy.write_tps(new_tps);
        }

        let (bytes, num_records) = (copy.raw_bytes().to_vec(), copy.num_records());
        {
            let mut p = page.lock();
            p.load(bytes, num_records, true);
            p.mark_dirty();
        }
        log::debug!(
            "merge: folded {} cell(s) of page range {} inner {} (col {})",
            updates.len(),
            range_idx,
            inner_idx,
            col
        );
        Ok(())
    }

    /// Walks `base`'s indirection chain looking for the newest tail whose
    /// schema bit for `col` is set. Returns the value to use and the tail's
    /// RID (the prospective new TPS), or `None` if every tail touching this
    /// column is already folded (`r_t >= tps`) — in which case the base
    /// value is already authoritative and nothing changes.
    fn newest_tail_value(
        &self,
        page_directory: &HashMap<Rid, MetaRecord>,
        base: &MetaRecord,
        col: usize,
        tps: u64,
    ) -> DbResult<Option<(i64, Rid)>> {
        let indirection_pid = base.columns[INDIRECTION_COLUMN].unwrap();
        let mut current_rid = {
            let p = self.table.buffer_pool().get_page(indirection_pid, true)?;
            let v = p.lock().read(indirection_pid.cell_idx as usize)?;
            self.table.buffer_pool().unpin(indirection_pid.page_key());
            v
        };

        while current_rid != base.rid {
            let Some(tail) = page_directory.get(&current_rid) else {
                break;
            };
            let bit = (tail.schema >> (col - 4)) & 1 == 1;
            if bit {
                if current_rid < tps {
                    let pid = tail.columns[col].expect("tail missing PID for a schema bit it set");
                    let p = self.table.buffer_pool().get_page(pid, true)?;
                    let v = p.lock().read(pid.cell_idx as usize)?;
                    self.table.buffer_pool().unpin(pid.page_key());
                    return Ok(Some((v as i64, current_rid)));
                }
                return Ok(None);
            }
            current_rid = match tail.columns[INDIRECTION_COLUMN] {
                Some(pid) => {
                    let p = self.table.buffer_pool().get_page(pid, true)?;
                    let v = p.lock().read(pid.cell_idx as usize)?;
                    self.table.buffer_pool().unpin(pid.page_key());
                    v
                }
                None => break,
            };
        }
        Ok(None)
    }
}
