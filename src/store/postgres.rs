use tokio::task::JoinHandle;
use tokio_postgres::{types::ToSql, Client, NoTls, Transaction};
use tracing::{debug, error, info};

use super::{TableStatus, ZoneStore};
use crate::config::Config;
use crate::error::{LoadError, LoadResult, Stage};
use crate::extract::{ZoneRecord, COLUMNS};

/// A single Postgres connection owned by the load driver.
///
/// The connection task is spawned on connect and joined by [`PgStore::close`];
/// dropping the store without closing still terminates the connection once
/// the client goes away.
pub struct PgStore {
    client: Client,
    connection: JoinHandle<()>,
    table: String,
    batch_size: usize,
}

impl PgStore {
    /// Open a connection for `config`, which is validated first: the table
    /// name is spliced into SQL and `batch_size` must be non-zero.
    pub async fn connect(config: &Config) -> LoadResult<Self> {
        config.validate()?;
        let pg_config = config
            .database
            .connection_string()?
            .parse::<tokio_postgres::Config>()
            .map_err(|e| LoadError::Config(format!("connection string: {e}")))?;
        info!(db = %config.database.redacted(), "connecting");

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| LoadError::postgres(Stage::Connect, e))?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection,
            table: config.load.table.clone(),
            batch_size: config.load.batch_size,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Drop the client and wait for the connection task to wind down.
    pub async fn close(self) {
        let Self {
            client, connection, ..
        } = self;
        drop(client);
        if let Err(e) = connection.await {
            error!("postgres connection task failed: {}", e);
        }
        debug!("connection closed");
    }
}

/// Whether a table by this (already folded) name is visible on the search
/// path. Works on servers where `to_regclass` still takes `cstring`.
const TABLE_VISIBLE_SQL: &str = "SELECT EXISTS (
    SELECT 1 FROM pg_catalog.pg_class c
    WHERE c.relname = $1
      AND c.relkind IN ('r', 'p')
      AND pg_catalog.pg_table_is_visible(c.oid)
)";

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    locationid INTEGER PRIMARY KEY,
    borough TEXT,
    zone TEXT,
    service_zone TEXT
)"
    )
}

/// Multi-row INSERT with `rows` tuples of numbered placeholders.
fn insert_sql(table: &str, rows: usize) -> String {
    let mut sql = format!("INSERT INTO {table} ({}) VALUES ", COLUMNS.join(", "));
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        let base = row * COLUMNS.len();
        sql.push_str(&format!(
            "(${}, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4
        ));
    }
    sql
}

async fn truncate_in(tx: &Transaction<'_>, table: &str) -> LoadResult<()> {
    let sql = format!("TRUNCATE TABLE {table}");
    debug!(%sql, "execute");
    tx.batch_execute(&sql)
        .await
        .map_err(|e| LoadError::postgres(Stage::Truncate, e))
}

async fn insert_in(
    tx: &Transaction<'_>,
    table: &str,
    records: &[ZoneRecord],
    batch_size: usize,
) -> LoadResult<u64> {
    let mut written = 0u64;
    for (i, chunk) in records.chunks(batch_size).enumerate() {
        let sql = insert_sql(table, chunk.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * COLUMNS.len());
        for rec in chunk {
            params.push(&rec.locationid);
            params.push(&rec.borough);
            params.push(&rec.zone);
            params.push(&rec.service_zone);
        }
        debug!(batch = i, rows = chunk.len(), "execute INSERT INTO {}", table);
        written += tx
            .execute(sql.as_str(), &params)
            .await
            .map_err(|e| LoadError::postgres(Stage::Insert, e))?;
    }
    Ok(written)
}

#[async_trait::async_trait]
impl ZoneStore for PgStore {
    async fn ensure_table(&mut self) -> LoadResult<TableStatus> {
        // unquoted identifiers fold to lower case in the DDL below
        let relname = self.table.to_ascii_lowercase();
        let existed: bool = self
            .client
            .query_one(TABLE_VISIBLE_SQL, &[&relname])
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|e| LoadError::postgres(Stage::Schema, e))?;

        let sql = create_table_sql(&self.table);
        debug!(%sql, "execute");
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| LoadError::postgres(Stage::Schema, e))?;

        Ok(if existed {
            TableStatus::Existing
        } else {
            TableStatus::Created
        })
    }

    async fn truncate(&mut self) -> LoadResult<()> {
        let tx = self
            .client
            .transaction()
            .await
            .map_err(|e| LoadError::postgres(Stage::Truncate, e))?;
        truncate_in(&tx, &self.table).await?;
        tx.commit()
            .await
            .map_err(|e| LoadError::postgres(Stage::Truncate, e))
    }

    async fn bulk_insert(&mut self, records: &[ZoneRecord]) -> LoadResult<u64> {
        let tx = self
            .client
            .transaction()
            .await
            .map_err(|e| LoadError::postgres(Stage::Insert, e))?;
        let written = insert_in(&tx, &self.table, records, self.batch_size).await?;
        tx.commit()
            .await
            .map_err(|e| LoadError::postgres(Stage::Insert, e))?;
        Ok(written)
    }

    async fn replace(&mut self, records: &[ZoneRecord]) -> LoadResult<u64> {
        let tx = self
            .client
            .transaction()
            .await
            .map_err(|e| LoadError::postgres(Stage::Truncate, e))?;
        truncate_in(&tx, &self.table).await?;
        let written = insert_in(&tx, &self.table, records, self.batch_size).await?;
        tx.commit()
            .await
            .map_err(|e| LoadError::postgres(Stage::Insert, e))?;
        Ok(written)
    }

    async fn count_rows(&mut self) -> LoadResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        debug!(%sql, "query");
        self.client
            .query_one(sql.as_str(), &[])
            .await
            .and_then(|row| row.try_get::<_, i64>(0))
            .map_err(|e| LoadError::postgres(Stage::Verify, e))
    }

    async fn lookup(&mut self, locationid: i32) -> LoadResult<Option<ZoneRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE locationid = $1",
            COLUMNS.join(", "),
            self.table
        );
        debug!(%sql, locationid, "query");
        let row = self
            .client
            .query_opt(sql.as_str(), &[&locationid])
            .await
            .map_err(|e| LoadError::postgres(Stage::Verify, e))?;
        row.map(|row| {
            Ok::<_, tokio_postgres::Error>(ZoneRecord {
                locationid: row.try_get(0)?,
                borough: row.try_get(1)?,
                zone: row.try_get(2)?,
                service_zone: row.try_get(3)?,
            })
        })
        .transpose()
        .map_err(|e| LoadError::postgres(Stage::Verify, e))
    }
}
