//! The table — record placement, the indirection/schema-encoding update
//! protocol, the versioned read (`collapse_row`), the background merge that
//! keeps that read path cheap, and the on-disk layout underneath it all.
//!
//! `Query` and `Database` are thin collaborators kept deliberately shallow:
//! neither is specified in depth (spec.md §1 lists both as out of scope for
//! the core), but a usable engine needs somewhere to open/close a directory
//! of tables and somewhere for a caller to send key/column arguments to, so
//! both are implemented as straightforward forwarders over `Table`.

mod database;
mod directory;
mod disk;
mod merge;
mod query;
mod record;
mod table;

pub use database::Database;
pub use disk::{sanitize, DiskManager, TableDirEntry, TableMeta};
pub use query::Query;
pub use record::{MetaRecord, Record};
pub use table::Table;
