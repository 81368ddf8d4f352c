//! Postgres destination store: schema management, batched natural-key
//! upserts, and the sync-run log.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use ttsync_core::{RunStatus, SyncRun, TransactionRecord};

pub const CRATE_NAME: &str = "ttsync-db";

/// Rows per insert round-trip. Tunable; sized for throughput, well under
/// Postgres's bind-parameter ceiling at thirteen columns per row.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Embedded destination schema. Every statement is idempotent, so running
/// it on each job is a no-op once the objects exist.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Destination-store capability the pipeline requires: idempotent schema
/// setup, insert-or-update on the natural key, and the sync-run log.
/// Expressed as a trait so the orchestrator never depends on a SQL dialect.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Create destination objects if absent. Never destroys existing data.
    async fn ensure_schema(&self) -> Result<()>;

    /// Write one file's records in a single transaction, stamping
    /// `source_file` on every row. A key that already exists has its
    /// mutable fields (count, amount, entity, source_file, loaded_at)
    /// overwritten; identifying fields are untouched. Returns rows written.
    async fn upsert_batch(
        &self,
        records: &[TransactionRecord],
        source_file: &str,
    ) -> Result<usize>;

    /// Timestamp of the most recent `success` run, or `None` if no run has
    /// ever succeeded.
    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Append a run-log row stamped with the current server time.
    async fn record_run(&self, files_processed: usize, status: RunStatus) -> Result<()>;

    /// Most recent run-log rows, newest first.
    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>>;
}

/// Collapse records sharing a natural key, keeping the last occurrence.
///
/// A multi-row `INSERT ... ON CONFLICT` cannot touch the same row twice
/// within one statement, so duplicates must be resolved before binding;
/// keeping the later occurrence matches the loader's later-wins rule.
pub fn dedup_by_natural_key(records: &[TransactionRecord]) -> Vec<&TransactionRecord> {
    let mut positions: HashMap<(Option<i32>, NaiveDateTime, &str, &str), usize> =
        HashMap::with_capacity(records.len());
    let mut out: Vec<&TransactionRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.entry(record.natural_key()) {
            Entry::Occupied(slot) => out[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(record);
            }
        }
    }
    out
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Postgres-backed implementation.
pub struct PgStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to Postgres")?;
        Ok(Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn ensure_schema(&self) -> Result<()> {
        for statement in schema_statements(SCHEMA_SQL) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("executing schema statement: {statement:.60}"))?;
        }
        info!("destination schema ensured");
        Ok(())
    }

    async fn upsert_batch(
        &self,
        records: &[TransactionRecord],
        source_file: &str,
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let deduped = dedup_by_natural_key(records);
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        let mut written = 0usize;

        for chunk in deduped.chunks(self.batch_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO transactions \
                 (terminal_id, operation, channel, entity, year, month, day, hour, \
                  transaction_count, transaction_amount, transaction_datetime, \
                  transaction_date, source_file) ",
            );
            builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.terminal_id)
                    .push_bind(&record.operation)
                    .push_bind(&record.channel)
                    .push_bind(&record.entity)
                    .push_bind(record.year)
                    .push_bind(record.month)
                    .push_bind(record.day)
                    .push_bind(record.hour)
                    .push_bind(record.transaction_count)
                    .push_bind(record.transaction_amount)
                    .push_bind(record.transaction_datetime)
                    .push_bind(record.transaction_date)
                    .push_bind(source_file);
            });
            builder.push(
                " ON CONFLICT (terminal_id, transaction_datetime, operation, channel) \
                 DO UPDATE SET \
                 transaction_count = EXCLUDED.transaction_count, \
                 transaction_amount = EXCLUDED.transaction_amount, \
                 entity = EXCLUDED.entity, \
                 source_file = EXCLUDED.source_file, \
                 loaded_at = NOW()",
            );

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting batch from {source_file}"))?;
            written += result.rows_affected() as usize;
        }

        tx.commit().await.context("committing file transaction")?;
        info!(source_file, rows = written, "file batch upserted");
        Ok(written)
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT last_sync_time
              FROM etl_runs
             WHERE status = 'success'
             ORDER BY created_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("reading last sync time")?;

        row.map(|r| r.try_get::<DateTime<Utc>, _>("last_sync_time"))
            .transpose()
            .context("decoding last sync time")
    }

    async fn record_run(&self, files_processed: usize, status: RunStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_runs (last_sync_time, status, files_processed)
            VALUES (NOW(), $1, $2)
            "#,
        )
        .bind(status.as_str())
        .bind(files_processed as i32)
        .execute(&self.pool)
        .await
        .context("recording sync run")?;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
            SELECT last_sync_time, status, files_processed, created_at
              FROM etl_runs
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("reading run log")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(SyncRun {
                last_sync_time: row.try_get("last_sync_time")?,
                status: RunStatus::parse(&status)
                    .with_context(|| format!("unknown run status {status:?}"))?,
                files_processed: row.try_get("files_processed")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(terminal_id: Option<i32>, hour: u32, amount: f64) -> TransactionRecord {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        TransactionRecord {
            terminal_id,
            operation: "Withdrawal".to_string(),
            channel: "ATM".to_string(),
            entity: "Branch A".to_string(),
            year: 2026,
            month: 3,
            day: 14,
            hour: hour as i32,
            transaction_count: 1.0,
            transaction_amount: amount,
            transaction_datetime: date.and_hms_opt(hour, 0, 0).unwrap(),
            transaction_date: date,
        }
    }

    #[test]
    fn schema_splits_into_nonempty_statements() {
        let statements = schema_statements(SCHEMA_SQL);
        assert_eq!(statements.len(), 8);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS transactions"));
        assert!(statements
            .last()
            .unwrap()
            .contains("CREATE TABLE IF NOT EXISTS etl_runs"));
        for statement in statements {
            assert!(!statement.trim().is_empty());
        }
    }

    #[test]
    fn schema_is_create_if_not_exists_only() {
        for statement in schema_statements(SCHEMA_SQL) {
            assert!(statement.contains("IF NOT EXISTS"));
            assert!(!statement.contains("DROP"));
        }
    }

    #[test]
    fn dedup_keeps_last_occurrence_per_key() {
        let records = vec![record(Some(1), 9, 100.0), record(Some(1), 9, 250.0)];
        let deduped = dedup_by_natural_key(&records);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].transaction_amount, 250.0);
    }

    #[test]
    fn dedup_preserves_distinct_keys_in_order() {
        let records = vec![
            record(Some(1), 9, 100.0),
            record(Some(2), 9, 200.0),
            record(Some(1), 10, 300.0),
        ];
        let deduped = dedup_by_natural_key(&records);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].terminal_id, Some(1));
        assert_eq!(deduped[1].terminal_id, Some(2));
    }

    #[test]
    fn dedup_collapses_null_terminals_sharing_the_rest() {
        let records = vec![record(None, 9, 10.0), record(None, 9, 20.0)];
        let deduped = dedup_by_natural_key(&records);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].transaction_amount, 20.0);
    }
}
