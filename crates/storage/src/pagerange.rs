//! A page range: up to `B` base pages plus an unbounded, append-only list
//! of tail pages.

use std::sync::Arc;

use common::DbError;
use parking_lot::Mutex;

use crate::page::Page;
use crate::PageLayout;

/// Shared handle to a single resident page, guarded by its own mutex. The
/// buffer pool's striped locks serialize *access decisions* (load/evict);
/// this inner mutex serializes the actual byte-level read/write once a
/// caller has the page in hand.
pub type PageHandle = Arc<Mutex<Page>>;

/// Structural grouping of base pages (read-mostly, append-only at insert
/// time) and tail pages (append-only update log) for one slice of a
/// table's rows.
#[derive(Debug)]
pub struct PageRange {
    pub range_idx: u64,
    layout: PageLayout,
    base_pages: Vec<Option<PageHandle>>,
    tail_pages: Vec<PageHandle>,
    base_page_count: usize,
    tail_page_count: usize,
    tail_page_lock: Mutex<()>,
}

impl PageRange {
    pub fn new(range_idx: u64, layout: PageLayout) -> Self {
        Self {
            range_idx,
            layout,
            base_pages: (0..layout.max_base_pages).map(|_| None).collect(),
            tail_pages: Vec::new(),
            base_page_count: 0,
            tail_page_count: 0,
            tail_page_lock: Mutex::new(()),
        }
    }

    pub fn has_open_base_pages(&self) -> bool {
        self.base_page_count < self.layout.max_base_pages
    }

    pub fn base_page_count(&self) -> usize {
        self.base_page_count
    }

    pub fn tail_page_count(&self) -> usize {
        self.tail_page_count
    }

    /// Appends a new base page. Fails with `RangeFull` once `B` base pages
    /// have been allocated; the table creates a fresh range and retries.
    pub fn create_base_page(&mut self) -> Result<(usize, PageHandle), DbError> {
        if self.base_page_count >= self.layout.max_base_pages {
            return Err(DbError::RangeFull);
        }
        let inner_idx = self.base_page_count;
        let page = Arc::new(Mutex::new(Page::new(
            self.layout.cell_size_bytes,
            self.layout.cells_per_page,
            self.layout.reserved_tid,
        )));
        self.base_pages[inner_idx] = Some(page.clone());
        self.base_page_count += 1;
        Ok((inner_idx, page))
    }

    /// Returns the currently open tail page, creating one if none exists or
    /// the latest is full. Serialized so two concurrent updaters never
    /// create competing tails.
    pub fn get_open_tail_page(&mut self) -> (usize, PageHandle) {
        let _guard = self.tail_page_lock.lock();
        if self.tail_page_count == 0 {
            return self.create_tail_page();
        }
        let (inner_idx, page) = self.latest_tail();
        let has_capacity = page.lock().has_capacity();
        if has_capacity {
            (inner_idx, page)
        } else {
            self.create_tail_page()
        }
    }

    /// Unconditionally allocates a fresh tail page, skipping the capacity
    /// check `get_open_tail_page` makes against its own (possibly stale,
    /// not-yet-loaded) view of the current one. Used when a caller has
    /// already discovered, via the buffer pool, that the page it was handed
    /// is actually full.
    pub fn new_tail_page(&mut self) -> (usize, PageHandle) {
        let _guard = self.tail_page_lock.lock();
        self.create_tail_page()
    }

    fn create_tail_page(&mut self) -> (usize, PageHandle) {
        let inner_idx = self.tail_page_count + self.layout.max_base_pages;
        let page = Arc::new(Mutex::new(Page::new(
            self.layout.cell_size_bytes,
            self.layout.cells_per_page,
            self.layout.reserved_tid,
        )));
        self.tail_pages.push(page.clone());
        self.tail_page_count += 1;
        (inner_idx, page)
    }

    fn latest_tail(&self) -> (usize, PageHandle) {
        let last_idx = self.tail_page_count - 1;
        let inner_idx = self.layout.max_base_pages + last_idx;
        (inner_idx, self.tail_pages[last_idx].clone())
    }

    /// Fetches the page object at the given inner index; `None` if a base
    /// slot has not been allocated yet.
    pub fn get_page(&self, inner_idx: usize) -> Option<PageHandle> {
        if inner_idx < self.layout.max_base_pages {
            self.base_pages[inner_idx].clone()
        } else {
            self.tail_pages.get(inner_idx - self.layout.max_base_pages).cloned()
        }
    }

    /// Installs a page object for slot `inner_idx`, used when reconstructing
    /// a range from disk (pages start unloaded and are demand-loaded by the
    /// buffer pool).
    pub fn install_page(&mut self, inner_idx: usize, page: PageHandle) {
        if inner_idx < self.layout.max_base_pages {
            if inner_idx >= self.base_page_count {
                self.base_page_count = inner_idx + 1;
            }
            self.base_pages[inner_idx] = Some(page);
        } else {
            let tail_idx = inner_idx - self.layout.max_base_pages;
            if tail_idx >= self.tail_pages.len() {
                self.tail_pages.resize_with(tail_idx + 1, || {
                    Arc::new(Mutex::new(Page::new_unloaded(
                        self.layout.cell_size_bytes,
                        self.layout.cells_per_page,
                    )))
                });
            }
            self.tail_pages[tail_idx] = page;
            if tail_idx >= self.tail_page_count {
                self.tail_page_count = tail_idx + 1;
            }
        }
    }

    pub fn is_base_page(&self, inner_idx: usize) -> bool {
        inner_idx < self.layout.max_base_pages
    }
}
