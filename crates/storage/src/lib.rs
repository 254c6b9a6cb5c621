//! Page and page-range layout: the fixed-size cell array that backs every
//! column of every row, and the grouping of base/tail pages that makes up
//! one page range.

mod page;
mod pagerange;
#[cfg(test)]
mod tests;

pub use page::Page;
pub use pagerange::{PageHandle, PageRange};

use common::{DbResult, EngineConfig};

/// Layout constants shared by every `Page`/`PageRange` in a table, derived
/// once from an `EngineConfig`.
#[derive(Clone, Copy, Debug)]
pub struct PageLayout {
    pub cell_size_bytes: usize,
    pub cells_per_page: usize,
    pub reserved_tid: u64,
    pub max_base_pages: usize,
}

impl From<&EngineConfig> for PageLayout {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            cell_size_bytes: cfg.cell_size_bytes,
            cells_per_page: cfg.cells_per_page(),
            reserved_tid: cfg.reserved_tid(),
            max_base_pages: cfg.page_range_max_base_pages,
        }
    }
}

impl PageLayout {
    /// Total on-disk/in-memory byte size of one page, TPS cell included.
    pub fn page_size(&self) -> usize {
        (self.cells_per_page + 1) * self.cell_size_bytes
    }
}

/// Triple locating one cell: `inner_page_idx < B` is a base page, `>= B` is
/// tail page `inner_page_idx - B`. Stable for the lifetime of the table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Hash)]
pub struct Pid {
    pub cell_idx: u64,
    pub inner_page_idx: u64,
    pub page_range_idx: u64,
}

impl Pid {
    pub fn new(cell_idx: u64, inner_page_idx: u64, page_range_idx: u64) -> Self {
        Self {
            cell_idx,
            inner_page_idx,
            page_range_idx,
        }
    }

    /// 24-byte little-endian encoding: three consecutive u64 fields.
    pub fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.cell_idx.to_le_bytes());
        out[8..16].copy_from_slice(&self.inner_page_idx.to_le_bytes());
        out[16..24].copy_from_slice(&self.page_range_idx.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            cell_idx: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            inner_page_idx: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            page_range_idx: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        }
    }

    /// The `PageKey` (range + inner page index, cell index dropped) this
    /// PID's cell lives on.
    pub fn page_key(&self) -> PageKey {
        PageKey {
            range_idx: self.page_range_idx,
            inner_idx: self.inner_page_idx,
        }
    }
}

/// Identifies one page within a table: which page range, and which inner
/// slot (base or tail) within it. This is the key the buffer pool stripes
/// its locks, pin counts, and LRU list on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PageKey {
    pub range_idx: u64,
    pub inner_idx: u64,
}

impl PageKey {
    pub fn new(range_idx: u64, inner_idx: u64) -> Self {
        Self { range_idx, inner_idx }
    }

    /// Stripe index per the spec's hash: `(inner_idx + 100*(range_idx+1)) % stripes`.
    pub fn stripe(&self, stripes: usize) -> usize {
        ((self.inner_idx + 100 * (self.range_idx + 1)) % stripes as u64) as usize
    }
}

/// Supplies the in-memory `Page` object for a given key — implemented by
/// whatever owns the table's page ranges. Kept as a trait (rather than a
/// back-reference from the buffer pool to the table) so the buffer pool and
/// the table do not own each other cyclically.
pub trait PageDirectory: Send + Sync {
    fn page_handle(&self, key: PageKey) -> DbResult<PageHandle>;
}

/// Supplies durable storage for pages — implemented by the disk manager.
/// `load_page` returns the on-disk bytes and record count for a page that
/// has never been loaded before (zero-filled/zero count if it has never
/// been written).
pub trait PageStore: Send + Sync {
    fn load_page(&self, key: PageKey) -> DbResult<(Vec<u8>, usize)>;
    fn write_page(&self, key: PageKey, page: &Page) -> DbResult<()>;
}
