//! Owns a table's page ranges and implements `storage::PageDirectory` so the
//! buffer pool can fetch a `PageHandle` without holding a back-reference to
//! the table itself.

use common::{DbError, DbResult};
use parking_lot::RwLock;
use storage::{PageDirectory, PageHandle, PageKey, PageLayout, PageRange};

pub struct RangeDirectory {
    pub layout: PageLayout,
    pub ranges: RwLock<Vec<PageRange>>,
}

impl RangeDirectory {
    pub fn new(layout: PageLayout) -> Self {
        Self {
            layout,
            ranges: RwLock::new(Vec::new()),
        }
    }

    pub fn range_count(&self) -> usize {
        self.ranges.read().len()
    }

    fn ensure_range(&self, range_idx: u64) {
        let mut ranges = self.ranges.write();
        while ranges.len() <= range_idx as usize {
            let idx = ranges.len() as u64;
            ranges.push(PageRange::new(idx, self.layout));
        }
    }

    /// Makes sure `range_idx` exists (empty if never touched), without
    /// allocating any page within it. Used when reopening a table to
    /// recreate a page range that was persisted but holds no live rows.
    pub fn ensure_range_exists(&self, range_idx: u64) {
        self.ensure_range(range_idx);
    }

    /// Allocates base pages up to and including `inner_idx` in `range_idx`,
    /// creating the range itself if needed. A no-op if already allocated.
    pub fn ensure_base_page(&self, range_idx: u64, inner_idx: usize) -> DbResult<()> {
        self.ensure_range(range_idx);
        let mut ranges = self.ranges.write();
        let range = &mut ranges[range_idx as usize];
        while range.base_page_count() <= inner_idx {
            range.create_base_page()?;
        }
        Ok(())
    }

    /// Returns the open tail page for `range_idx`, creating the range if
    /// needed. Serialized by `PageRange`'s own internal tail lock.
    pub fn get_open_tail_page(&self, range_idx: u64) -> (usize, PageHandle) {
        self.ensure_range(range_idx);
        let mut ranges = self.ranges.write();
        ranges[range_idx as usize].get_open_tail_page()
    }

    /// Forces allocation of a brand new tail page for `range_idx`, bypassing
    /// the stale-capacity-check fast path in `get_open_tail_page`. Used by
    /// `Table::write_tail_column` once it has discovered, via the buffer
    /// pool, that the page `get_open_tail_page` handed back is actually full.
    pub fn force_new_tail_page(&self, range_idx: u64) -> (usize, PageHandle) {
        self.ensure_range(range_idx);
        let mut ranges = self.ranges.write();
        ranges[range_idx as usize].new_tail_page()
    }

    /// Installs an already-materialized page object, used when reloading a
    /// table's ranges from disk on open.
    pub fn install_page(&self, range_idx: u64, inner_idx: usize, page: PageHandle) {
        self.ensure_range(range_idx);
        let mut ranges = self.ranges.write();
        ranges[range_idx as usize].install_page(inner_idx, page);
    }
}

impl PageDirectory for RangeDirectory {
    fn page_handle(&self, key: PageKey) -> DbResult<PageHandle> {
        let ranges = self.ranges.read();
        let range = ranges
            .get(key.range_idx as usize)
            .ok_or_else(|| DbError::Corrupt(format!("no page range {}", key.range_idx)))?;
        range
            .get_page(key.inner_idx as usize)
            .ok_or_else(|| DbError::Corrupt(format!("page {:?} never allocated", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PageLayout {
        PageLayout {
            cell_size_bytes: 8,
            cells_per_page: 7,
            reserved_tid: u64::MAX,
            max_base_pages: 4,
        }
    }

    #[test]
    fn ensure_base_page_creates_ranges_and_pages_lazily() {
        let dir = RangeDirectory::new(layout());
        assert_eq!(dir.range_count(), 0);
        dir.ensure_base_page(0, 2).unwrap();
        assert_eq!(dir.range_count(), 1);
        let ranges = dir.ranges.read();
        assert!(ranges[0].base_page_count() >= 3);
    }

    #[test]
    fn ensure_base_page_is_idempotent() {
        let dir = RangeDirectory::new(layout());
        dir.ensure_base_page(0, 1).unwrap();
        let count_after_first = dir.ranges.read()[0].base_page_count();
        dir.ensure_base_page(0, 1).unwrap();
        assert_eq!(dir.ranges.read()[0].base_page_count(), count_after_first);
    }

    #[test]
    fn page_handle_missing_range_is_corrupt_error() {
        let dir = RangeDirectory::new(layout());
        assert!(matches!(
            dir.page_handle(PageKey::new(0, 0)),
            Err(DbError::Corrupt(_))
        ));
    }

    #[test]
    fn get_open_tail_page_creates_range_on_demand() {
        let dir = RangeDirectory::new(layout());
        let (inner_idx, _page) = dir.get_open_tail_page(2);
        assert_eq!(dir.range_count(), 3);
        assert_eq!(inner_idx, layout().max_base_pages);
    }
}
