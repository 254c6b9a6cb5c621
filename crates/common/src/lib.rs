//! Shared error type, engine configuration, and logging setup used by every
//! other crate in this workspace.


use std::io;
use std::path::PathBuf;

/// 64-bit record identifier. Base RIDs count up from 1 (via `prev_rid`);
/// tail RIDs count down from `u64::MAX` (via `prev_tid`). Any RID greater
/// than the table's current `prev_rid` is a tail RID.
pub type Rid = u64;

/// Index of a user or system column within a row (0-based, system columns
/// occupy 0..START_USER_DATA_COLUMN).
pub type ColumnIndex = usize;

/// Position of the indirection system column.
pub const INDIRECTION_COLUMN: ColumnIndex = 0;
/// Position of the RID system column.
pub const RID_COLUMN: ColumnIndex = 1;
/// Position of the timestamp system column.
pub const TIMESTAMP_COLUMN: ColumnIndex = 2;
/// Position of the schema-encoding system column.
pub const SCHEMA_ENCODING_COLUMN: ColumnIndex = 3;
/// First column index holding user data.
pub const START_USER_DATA_COLUMN: ColumnIndex = 4;

/// Canonical error type shared across the storage engine.
///
/// Variants split into two groups per the propagation policy: the first
/// group is surfaced to callers as ordinary results; `Capacity` and
/// `RangeFull` are internal signals the table layer catches and retries on
/// (a caller should never observe them escape the table).
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("primary key already exists")]
    KeyExists,
    #[error("primary key not found")]
    KeyMissing,
    #[error("wrong number of columns: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("column index {0} out of range")]
    OutOfRange(usize),
    #[error("cell index {0} out of bounds")]
    OutOfBounds(usize),
    #[error("page is full")]
    Capacity,
    #[error("page range is full")]
    RangeFull,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("corrupt on-disk state: {0}")]
    Corrupt(String),
    #[error("no such database at {0}")]
    NoSuchDatabase(PathBuf),
    #[error("table {0} already exists")]
    NameExists(String),
    #[error("table {0} not found")]
    NoSuchTable(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias that carries a [`DbError`].
pub type DbResult<T> = Result<T, DbError>;

/// Tunable knobs for the storage engine, built once per [`Database::open`]
/// or [`Database::create_table`] call and threaded through `Table`,
/// `BufferPool`, and `DiskManager`.
///
/// # Example
/// ```
/// use common::EngineConfig;
///
/// let cfg = EngineConfig::builder()
///     .data_dir("./my_db")
///     .max_pool_pages(2000)
///     .build();
/// assert_eq!(cfg.cells_per_page(), 4096 / 8 - 1);
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct EngineConfig {
    /// Directory holding the database directory file and per-table subdirectories.
    #[builder(into, default = PathBuf::from("./lstore_data"))]
    pub data_dir: PathBuf,
    /// Size, in bytes, of a page's cell array (cell 0 included).
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Width, in bytes, of one integer cell. All on-disk integers are
    /// little-endian and this wide.
    #[builder(default = 8)]
    pub cell_size_bytes: usize,
    /// Base pages per page range (`B` in the spec).
    #[builder(default = 16)]
    pub page_range_max_base_pages: usize,
    /// Soft cap on resident pages kept by the buffer pool.
    #[builder(default = 2000)]
    pub max_pool_pages: usize,
    /// Number of stripes in the buffer pool's lock banks.
    #[builder(default = 500)]
    pub buffer_pool_stripes: usize,
}

impl EngineConfig {
    /// Cells available for payload per page (cell 0 is reserved for the TPS).
    pub fn cells_per_page(&self) -> usize {
        self.page_size / self.cell_size_bytes - 1
    }

    /// Sentinel TPS value meaning "nothing has been folded into this base page yet".
    pub fn reserved_tid(&self) -> Rid {
        u64::MAX
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::builder().build()
    }
}

/// Initializes the `env_logger` backend once per process. Safe to call from
/// multiple tests; subsequent calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}
