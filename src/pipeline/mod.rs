// src/pipeline/mod.rs

use std::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::LoadResult;
use crate::extract::{read_zone_csv, ZoneTable};
use crate::store::{PgStore, TableStatus, ZoneStore};

/// How truncate and insert are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Truncate commits, then the insert commits. A failure in between
    /// leaves the table empty.
    TwoPhase,
    /// Truncate and insert share one transaction.
    SingleTransaction,
}

impl LoadMode {
    pub fn from_config(config: &Config) -> Self {
        if config.load.single_transaction {
            LoadMode::SingleTransaction
        } else {
            LoadMode::TwoPhase
        }
    }
}

/// Row count read back after the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub expected: usize,
    pub actual: i64,
}

impl Verification {
    pub fn matches(&self) -> bool {
        i64::try_from(self.expected).is_ok_and(|e| e == self.actual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub table: TableStatus,
    pub inserted: u64,
    pub verification: Verification,
}

/// Schema, load and verification stages against an open store.
pub async fn load<S>(store: &mut S, zones: &ZoneTable, mode: LoadMode) -> LoadResult<RunReport>
where
    S: ZoneStore + ?Sized,
{
    // ─── schema ───────────────────────────────────────────────────────
    let table = store.ensure_table().await?;
    match table {
        TableStatus::Created => info!("table created"),
        TableStatus::Existing => info!("table ensured"),
    }

    // ─── load ─────────────────────────────────────────────────────────
    let start = Instant::now();
    let inserted = match mode {
        LoadMode::TwoPhase => {
            store.truncate().await?;
            info!("table truncated");
            store.bulk_insert(&zones.records).await?
        }
        LoadMode::SingleTransaction => {
            let n = store.replace(&zones.records).await?;
            info!("table truncated and reloaded in one transaction");
            n
        }
    };
    info!(rows = inserted, elapsed = ?start.elapsed(), "data inserted");

    // ─── verify ───────────────────────────────────────────────────────
    let verification = Verification {
        expected: zones.len(),
        actual: store.count_rows().await?,
    };
    info!(total = verification.actual, "rows in table");
    if !verification.matches() {
        warn!(
            expected = verification.expected,
            actual = verification.actual,
            "row count differs from CSV"
        );
    }

    Ok(RunReport {
        table,
        inserted,
        verification,
    })
}

/// Full run: extract the CSV, connect, load, verify, disconnect.
///
/// The connection is closed on every path once it has been opened.
pub async fn run(config: &Config) -> LoadResult<RunReport> {
    config.validate()?;
    let zones = read_zone_csv(&config.load.csv_path)?;
    for rec in zones.preview(config.load.preview_rows) {
        info!(
            locationid = rec.locationid,
            borough = rec.borough.as_deref().unwrap_or(""),
            zone = rec.zone.as_deref().unwrap_or(""),
            service_zone = rec.service_zone.as_deref().unwrap_or(""),
            "preview"
        );
    }

    let mut store = PgStore::connect(config).await?;
    info!(table = store.table(), "connected");
    let result = load(&mut store, &zones, LoadMode::from_config(config)).await;
    store.close().await;
    result
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;

    use crate::error::{DbErrorClass, LoadError, LoadResult, Stage};
    use crate::extract::ZoneRecord;
    use crate::store::{TableStatus, ZoneStore};

    /// In-memory stand-in for the Postgres table, with commit semantics
    /// matching the real store.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub table: Option<BTreeMap<i32, ZoneRecord>>,
        /// Fail the next `count_rows` with a connection error.
        pub drop_before_verify: bool,
        pub calls: Vec<&'static str>,
    }

    impl MemoryStore {
        fn rows(&mut self, stage: Stage) -> LoadResult<&mut BTreeMap<i32, ZoneRecord>> {
            self.table.as_mut().ok_or_else(|| {
                LoadError::classified(stage, DbErrorClass::Other, "relation does not exist".into())
            })
        }

        fn insert_all(
            mut staged: BTreeMap<i32, ZoneRecord>,
            records: &[ZoneRecord],
        ) -> LoadResult<BTreeMap<i32, ZoneRecord>> {
            for rec in records {
                if staged.insert(rec.locationid, rec.clone()).is_some() {
                    return Err(LoadError::classified(
                        Stage::Insert,
                        DbErrorClass::Constraint,
                        format!("duplicate key value (locationid)=({})", rec.locationid).into(),
                    ));
                }
            }
            Ok(staged)
        }
    }

    #[async_trait::async_trait]
    impl ZoneStore for MemoryStore {
        async fn ensure_table(&mut self) -> LoadResult<TableStatus> {
            self.calls.push("ensure_table");
            Ok(match self.table {
                Some(_) => TableStatus::Existing,
                None => {
                    self.table = Some(BTreeMap::new());
                    TableStatus::Created
                }
            })
        }

        async fn truncate(&mut self) -> LoadResult<()> {
            self.calls.push("truncate");
            self.rows(Stage::Truncate)?.clear();
            Ok(())
        }

        async fn bulk_insert(&mut self, records: &[ZoneRecord]) -> LoadResult<u64> {
            self.calls.push("bulk_insert");
            let current = self.rows(Stage::Insert)?.clone();
            let staged = Self::insert_all(current, records)?;
            self.table = Some(staged);
            Ok(records.len() as u64)
        }

        async fn replace(&mut self, records: &[ZoneRecord]) -> LoadResult<u64> {
            self.calls.push("replace");
            self.rows(Stage::Truncate)?;
            let staged = Self::insert_all(BTreeMap::new(), records)?;
            self.table = Some(staged);
            Ok(records.len() as u64)
        }

        async fn count_rows(&mut self) -> LoadResult<i64> {
            self.calls.push("count_rows");
            if self.drop_before_verify {
                return Err(LoadError::classified(
                    Stage::Verify,
                    DbErrorClass::Connection,
                    "connection closed".into(),
                ));
            }
            Ok(self.rows(Stage::Verify)?.len() as i64)
        }

        async fn lookup(&mut self, locationid: i32) -> LoadResult<Option<ZoneRecord>> {
            Ok(self.rows(Stage::Verify)?.get(&locationid).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::error::LoadError;
    use crate::extract::ZoneRecord;

    fn zones(records: Vec<ZoneRecord>) -> ZoneTable {
        ZoneTable {
            headers: crate::extract::COLUMNS.iter().map(|c| c.to_string()).collect(),
            records,
        }
    }

    fn sample() -> ZoneTable {
        zones(vec![
            ZoneRecord::new(1, "Manhattan", "Battery Park", "Yellow Zone"),
            ZoneRecord::new(2, "Queens", "JFK Airport", "Airport"),
        ])
    }

    #[tokio::test]
    async fn test_load_into_missing_table() {
        let mut store = MemoryStore::default();
        let report = load(&mut store, &sample(), LoadMode::TwoPhase).await.unwrap();

        assert_eq!(report.table, TableStatus::Created);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.verification.actual, 2);
        assert!(report.verification.matches());
        assert_eq!(
            store.calls,
            vec!["ensure_table", "truncate", "bulk_insert", "count_rows"]
        );
        assert_eq!(
            store.lookup(2).await.unwrap(),
            Some(ZoneRecord::new(2, "Queens", "JFK Airport", "Airport"))
        );
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let mut store = MemoryStore::default();
        let first = load(&mut store, &sample(), LoadMode::TwoPhase).await.unwrap();
        let second = load(&mut store, &sample(), LoadMode::TwoPhase).await.unwrap();
        assert_eq!(second.table, TableStatus::Existing);
        assert_eq!(first.verification, second.verification);
    }

    #[tokio::test]
    async fn test_header_only_leaves_empty_table() {
        let mut store = MemoryStore::default();
        load(&mut store, &sample(), LoadMode::TwoPhase).await.unwrap();
        let report = load(&mut store, &zones(vec![]), LoadMode::TwoPhase).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.verification.actual, 0);
        assert!(report.verification.matches());
    }

    #[tokio::test]
    async fn test_duplicate_key_two_phase_leaves_table_empty() {
        let mut store = MemoryStore::default();
        load(&mut store, &sample(), LoadMode::TwoPhase).await.unwrap();

        let dup = zones(vec![
            ZoneRecord::new(7, "Queens", "Astoria", "Boro Zone"),
            ZoneRecord::new(7, "Queens", "Astoria Park", "Boro Zone"),
        ]);
        let err = load(&mut store, &dup, LoadMode::TwoPhase).await.unwrap_err();
        assert!(matches!(err, LoadError::ConstraintViolation { .. }), "{err:?}");
        assert_eq!(err.stage_name(), "insert");
        assert_eq!(store.count_rows().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_single_transaction_keeps_prior_rows() {
        let mut store = MemoryStore::default();
        load(&mut store, &sample(), LoadMode::SingleTransaction).await.unwrap();

        let dup = zones(vec![
            ZoneRecord::new(7, "Queens", "Astoria", "Boro Zone"),
            ZoneRecord::new(7, "Queens", "Astoria Park", "Boro Zone"),
        ]);
        let err = load(&mut store, &dup, LoadMode::SingleTransaction)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::ConstraintViolation { .. }), "{err:?}");
        assert_eq!(store.count_rows().await.unwrap(), 2);
        assert!(store.calls.contains(&"replace"));
        assert!(!store.calls.contains(&"truncate"));
    }

    #[tokio::test]
    async fn test_verify_failure_is_distinct_stage() {
        let mut store = MemoryStore {
            drop_before_verify: true,
            ..MemoryStore::default()
        };
        let err = load(&mut store, &sample(), LoadMode::TwoPhase).await.unwrap_err();
        assert!(matches!(err, LoadError::Connection { .. }), "{err:?}");
        assert_eq!(err.stage_name(), "verify");
        store.drop_before_verify = false;
        assert_eq!(store.count_rows().await.unwrap(), 2);
    }

    #[test]
    fn test_verification_matches() {
        assert!(Verification { expected: 3, actual: 3 }.matches());
        assert!(!Verification { expected: 3, actual: 2 }.matches());
        assert!(!Verification { expected: 0, actual: -1 }.matches());
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config_before_work() {
        let mut config = Config::default();
        config.load.csv_path = "/no/such/zones.csv".into();
        config.load.batch_size = 0;
        let err = run(&config).await.unwrap_err();
        assert!(matches!(err, LoadError::Config(_)), "{err:?}");
        assert_eq!(err.exit_code(), 2);

        config.load.batch_size = 10;
        config.load.table = "zones; DROP TABLE taxi_zone_lookup".into();
        let err = run(&config).await.unwrap_err();
        assert!(matches!(err, LoadError::Config(_)), "{err:?}");
    }

    #[test]
    fn test_mode_from_config() {
        let mut config = Config::default();
        assert_eq!(LoadMode::from_config(&config), LoadMode::TwoPhase);
        config.load.single_transaction = true;
        assert_eq!(LoadMode::from_config(&config), LoadMode::SingleTransaction);
    }
}
