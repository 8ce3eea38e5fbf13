use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::analytics::aggregator::DailyTally;
use crate::analytics::models::{DailyAggregate, Dimension, Event, TopRow};
use crate::analytics::storage::{ConsumedRow, DailyRow, EventRow, DAY_FORMAT};
use crate::ingest::tail::TailState;
use crate::storage::trait_def::{offset_columns, tail_state_from_columns};
use crate::storage::{cutoff_bound, EventStore, StorageResult, StoreStats};

const EVENT_COLUMNS: &str = "occurred_at, client_ip, region, method, path, status, bytes, \
                             referrer, user_agent, raw_line, source, source_generation, source_offset";

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Every connection to an in-memory database sees its own empty
        // database, so those pools are pinned to one long-lived connection.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?
        };

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn count(&self, sql: &str) -> StorageResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    fn upsert_sql(dimension: Dimension) -> String {
        let table = dimension.table();
        let column = dimension.key_column();
        format!(
            "INSERT INTO {table} (day, {column}, count) VALUES (?, ?, ?) \
             ON CONFLICT (day, {column}) DO UPDATE SET count = {table}.count + excluded.count"
        )
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                occurred_at INTEGER,
                client_ip TEXT,
                region TEXT NOT NULL,
                method TEXT,
                path TEXT,
                status INTEGER,
                bytes INTEGER,
                referrer TEXT,
                user_agent TEXT,
                raw_line TEXT NOT NULL,
                source TEXT,
                source_generation INTEGER,
                source_offset INTEGER,
                ingested_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // NULL origins never collide, so events without a source are not deduplicated
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_origin ON events(source, source_generation, source_offset)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_occurred_at ON events(occurred_at)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_pages (
                day TEXT NOT NULL,
                path TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (day, path)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_regions (
                day TEXT NOT NULL,
                region TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (day, region)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tail_offsets (
                path TEXT PRIMARY KEY,
                byte_offset INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn insert_events(
        &self,
        batch: &[Event],
        checkpoint: Option<&TailState>,
    ) -> StorageResult<u64> {
        let rows = batch
            .iter()
            .map(EventRow::from_event)
            .collect::<StorageResult<Vec<_>>>()?;
        let now = Utc::now().timestamp();
        let insert_sql = format!(
            "INSERT INTO events ({EVENT_COLUMNS}, ingested_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING"
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for row in rows {
            let result = sqlx::query(&insert_sql)
                .bind(row.occurred_at)
                .bind(row.client_ip)
                .bind(row.region)
                .bind(row.method)
                .bind(row.path)
                .bind(row.status)
                .bind(row.bytes)
                .bind(row.referrer)
                .bind(row.user_agent)
                .bind(row.raw_line)
                .bind(row.source)
                .bind(row.source_generation)
                .bind(row.source_offset)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        if let Some(state) = checkpoint {
            let (offset, generation) = offset_columns(state)?;
            sqlx::query(
                r#"
                INSERT INTO tail_offsets (path, byte_offset, generation, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (path) DO UPDATE SET
                    byte_offset = excluded.byte_offset,
                    generation = excluded.generation,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(state.source_key())
            .bind(offset)
            .bind(generation)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if inserted < batch.len() as u64 {
            debug!(
                skipped = batch.len() as u64 - inserted,
                "skipped events already stored"
            );
        }
        Ok(inserted)
    }

    async fn tail_state(&self, path: &Path) -> StorageResult<Option<TailState>> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT byte_offset, generation FROM tail_offsets WHERE path = ?",
        )
        .bind(path.to_string_lossy().into_owned())
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(|(offset, generation)| tail_state_from_columns(path, offset, generation))
            .transpose()
    }

    async fn save_tail_state(&self, state: &TailState) -> StorageResult<()> {
        let (offset, generation) = offset_columns(state)?;

        sqlx::query(
            r#"
            INSERT INTO tail_offsets (path, byte_offset, generation, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (path) DO UPDATE SET
                byte_offset = excluded.byte_offset,
                generation = excluded.generation,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.source_key())
        .bind(offset)
        .bind(generation)
        .bind(Utc::now().timestamp())
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn aggregate_daily(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;

        // Deleting first takes the write lock, so no insert can slip in
        // between reading the rows and removing them.
        let consumed = sqlx::query_as::<_, ConsumedRow>(
            r#"
            DELETE FROM events
            WHERE occurred_at IS NOT NULL AND occurred_at < ?
            RETURNING occurred_at, path, region
            "#,
        )
        .bind(cutoff_bound(cutoff))
        .fetch_all(&mut *tx)
        .await?;

        if consumed.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let tally = DailyTally::from_rows(&consumed)?;
        for dimension in Dimension::ALL {
            let sql = Self::upsert_sql(dimension);
            for row in tally.rows(dimension) {
                sqlx::query(&sql)
                    .bind(row.day.format(DAY_FORMAT).to_string())
                    .bind(row.key)
                    .bind(row.count)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(consumed.len() as u64)
    }

    async fn query_top(&self, dimension: Dimension, limit: i64) -> StorageResult<Vec<TopRow>> {
        let sql = format!(
            "SELECT {column} AS key, SUM(count) AS count FROM {table} \
             GROUP BY {column} ORDER BY 2 DESC, 1 ASC LIMIT ?",
            table = dimension.table(),
            column = dimension.key_column(),
        );

        let rows = sqlx::query_as::<_, TopRow>(&sql)
            .bind(limit)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn daily_aggregates(
        &self,
        dimension: Dimension,
        since: Option<NaiveDate>,
    ) -> StorageResult<Vec<DailyAggregate>> {
        let sql = format!(
            "SELECT day, {column} AS key, count FROM {table} \
             WHERE day >= ? ORDER BY day ASC, key ASC",
            table = dimension.table(),
            column = dimension.key_column(),
        );
        // ISO dates sort lexically, and the empty string sorts before all of them
        let since = since
            .map(|day| day.format(DAY_FORMAT).to_string())
            .unwrap_or_default();

        sqlx::query_as::<_, DailyRow>(&sql)
            .bind(since)
            .fetch_all(self.pool.as_ref())
            .await?
            .into_iter()
            .map(DailyAggregate::try_from)
            .collect()
    }

    async fn raw_events(&self, limit: i64) -> StorageResult<Vec<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id ASC LIMIT ?");
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(limit)
            .fetch_all(self.pool.as_ref())
            .await?
            .into_iter()
            .map(EventRow::into_event)
            .collect()
    }

    async fn stats(&self) -> StorageResult<StoreStats> {
        Ok(StoreStats {
            raw_events: self.count("SELECT COUNT(*) FROM events").await?,
            unparsed_events: self
                .count("SELECT COUNT(*) FROM events WHERE occurred_at IS NULL")
                .await?,
            page_rows: self.count("SELECT COUNT(*) FROM daily_pages").await?,
            region_rows: self.count("SELECT COUNT(*) FROM daily_regions").await?,
            tracked_files: self.count("SELECT COUNT(*) FROM tail_offsets").await?,
        })
    }
}
