mod postgres;

pub use postgres::PgStore;

use crate::error::LoadResult;
use crate::extract::ZoneRecord;

/// Outcome of `ensure_table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Created,
    Existing,
}

/// Destination of the zone lookup load.
///
/// All SQL lives behind this trait so the pipeline can be driven against an
/// in-memory table in tests. Each method is one stage of the load and maps
/// its failures to a `LoadError` tagged with that stage.
#[async_trait::async_trait]
pub trait ZoneStore: Send {
    /// Create the destination table if it does not exist.
    async fn ensure_table(&mut self) -> LoadResult<TableStatus>;

    /// Remove every row, committed on its own.
    async fn truncate(&mut self) -> LoadResult<()>;

    /// Append all records in one committed transaction; returns rows written.
    async fn bulk_insert(&mut self, records: &[ZoneRecord]) -> LoadResult<u64>;

    /// Truncate and insert as a single transaction.
    async fn replace(&mut self, records: &[ZoneRecord]) -> LoadResult<u64>;

    async fn count_rows(&mut self) -> LoadResult<i64>;

    async fn lookup(&mut self, locationid: i32) -> LoadResult<Option<ZoneRecord>>;
}
