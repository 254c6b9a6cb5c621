//! Forwards directly to `Table`. Spec.md §1 lists this facade as an
//! external collaborator out of scope for deep design — it exists only to
//! give callers a stable, arity-checked surface shaped like the original
//! `query.py` rather than `Table`'s own method signatures.

use std::sync::Arc;

use common::DbResult;

use crate::record::Record;
use crate::table::Table;

/// Performs insert/select/update/sum/delete against one table.
pub struct Query {
    table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    pub fn insert(&self, columns: &[i64]) -> DbResult<bool> {
        self.table.insert(columns)
    }

    /// `query_columns` is a 0/1 flag per user column, matching the
    /// original's calling convention; converted to the bitmask `Table::select`
    /// expects.
    pub fn select(&self, key: i64, column: usize, query_columns: &[i64]) -> DbResult<Vec<Record>> {
        self.table.select(key, column, flags_to_mask(query_columns))
    }

    pub fn update(&self, key: i64, columns: &[Option<i64>]) -> DbResult<bool> {
        self.table.update(key, columns)
    }

    pub fn delete(&self, key: i64) -> DbResult<bool> {
        self.table.delete(key)
    }

    pub fn sum(&self, start_range: i64, end_range: i64, aggregate_column_index: usize) -> DbResult<i64> {
        self.table.sum(start_range, end_range, aggregate_column_index)
    }

    pub fn increment(&self, key: i64, column: usize) -> DbResult<bool> {
        self.table.increment(key, column)
    }

    pub fn create_index(&self, column: usize) -> DbResult<()> {
        self.table.create_index(column)
    }

    pub fn drop_index(&self, column: usize) -> DbResult<()> {
        self.table.drop_index(column)
    }
}

fn flags_to_mask(query_columns: &[i64]) -> u64 {
    let mut mask = 0u64;
    for (i, &flag) in query_columns.iter().enumerate() {
        if flag != 0 {
            mask |= 1 << i;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EngineConfig;
    use std::sync::Arc;

    fn query_over_fresh_table(dir: &tempfile::TempDir, cols: usize, key_col: usize) -> Query {
        let cfg = EngineConfig::builder().data_dir(dir.path()).build();
        let disk = Arc::new(crate::disk::DiskManager::new(dir.path()));
        let table = Table::create("t", cols, key_col, &cfg, disk).unwrap();
        Query::new(table)
    }

    #[test]
    fn select_mask_matches_query_column_flags() {
        let dir = tempfile::tempdir().unwrap();
        let q = query_over_fresh_table(&dir, 3, 0);
        q.insert(&[1, 10, 20]).unwrap();
        let rows = q.select(1, 0, &[1, 0, 1]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, 1);
    }

    #[test]
    fn insert_then_update_then_select_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let q = query_over_fresh_table(&dir, 3, 0);
        q.insert(&[1, 10, 20]).unwrap();
        q.update(1, &[None, Some(99), None]).unwrap();
        let rows = q.select(1, 0, &[1, 1, 1]).unwrap();
        assert_eq!(rows[0].columns, vec![1, 99, 20]);
    }
}
