//! The page-directory entry for one record version, and the row shape
//! handed back to a caller of `select`.

use common::Rid;
use storage::Pid;

/// One row version: a base record (created on insert) or a tail record
/// (created on update). `columns[c]` locates column `c`'s value; `None`
/// marks a column a tail record never touched.
#[derive(Clone, Debug)]
pub struct MetaRecord {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<Option<Pid>>,
    /// Meaningful only for tail records: the bitmap of user columns this
    /// update touched. Always 0 in the in-memory copy of a base record —
    /// the base's authoritative schema encoding lives on its page, since
    /// merges mutate it in place.
    pub schema: u64,
}

impl MetaRecord {
    pub fn is_base(&self, prev_rid: Rid) -> bool {
        self.rid <= prev_rid
    }
}

/// A reconstructed row, as returned by `Table::select`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<i64>,
}
