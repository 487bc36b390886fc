use crate::record::{NewRecord, Record};
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 4;
const MARK_CHUNK: usize = 10_000;

/// Local buffer of serial records. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreCounts {
    pub pending: i64,
    pub synced: i64,
    pub oldest_pending_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
}

impl RecordStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        tracing::info!(url = %database_url, "connecting to record store");
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid DATABASE_URL {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .context("failed to open record store")?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!("record store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                payload TEXT NOT NULL,
                serial_port TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create records table")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS records_synced_timestamp ON records (synced, timestamp)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create records index")?;
        Ok(())
    }

    pub async fn insert(&self, record: &NewRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO records (timestamp, payload, serial_port, synced) VALUES (?, ?, ?, 0)",
        )
        .bind(record.timestamp)
        .bind(&record.payload)
        .bind(&record.serial_port)
        .execute(&self.pool)
        .await
        .context("failed to insert record")?;
        Ok(result.last_insert_rowid())
    }

    /// Oldest unsynced records first, at most `batch_size` of them.
    pub async fn fetch_unsynced(&self, batch_size: usize) -> Result<Vec<Record>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let records = sqlx::query_as::<_, Record>(
            r#"
            SELECT id, timestamp, payload, serial_port, synced
            FROM records
            WHERE synced = 0
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch unsynced batch")?;
        Ok(records)
    }

    /// Sets `synced = 1` for every id, in statements of at most
    /// `MARK_CHUNK` binds to stay under SQLite's variable limit.
    pub async fn mark_synced(&self, ids: &[i64]) -> Result<u64> {
        let mut updated = 0;
        for chunk in ids.chunks(MARK_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE records SET synced = 1 WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .context("failed to update sync status")?;
            updated += result.rows_affected();
        }
        if !ids.is_empty() {
            tracing::info!(matched = ids.len(), updated, "updated sync status");
        }
        Ok(updated)
    }

    pub async fn delete_synced(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE synced = 1")
            .execute(&self.pool)
            .await
            .context("failed to delete synced records")?;
        Ok(result.rows_affected())
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0) AS synced,
                MIN(CASE WHEN synced = 0 THEN timestamp END) AS oldest_pending,
                MAX(timestamp) AS newest
            FROM records
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to count records")?;

        Ok(StoreCounts {
            pending: row.try_get::<i64, _>("pending")?,
            synced: row.try_get::<i64, _>("synced")?,
            oldest_pending_timestamp: row.try_get::<Option<i64>, _>("oldest_pending")?,
            newest_timestamp: row.try_get::<Option<i64>, _>("newest")?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
