use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::str::FromStr;

use super::{
    EntityKey, EntityKind, PermanentRecord, RecordStore, RefreshLogEntry, StoreError,
    StoredRecord, SyncLedgerRecord, SyncStatus, UpsertSummary,
};
use crate::types::Provider;

const RECORD_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS {table} (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider TEXT NOT NULL,
        entity TEXT NOT NULL,
        natural_key TEXT NOT NULL,
        cursor TEXT,
        revision TEXT,
        payload TEXT NOT NULL,
        first_seen_ms INTEGER NOT NULL,
        updated_ms INTEGER NOT NULL,
        UNIQUE(provider, entity, natural_key)
    );
    CREATE INDEX IF NOT EXISTS idx_{table}_cursor ON {table}(provider, entity, cursor);
";

const LEDGER_TABLES: &str = r"
    CREATE TABLE IF NOT EXISTS sync_ledger (
        ledger_key TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        kind TEXT NOT NULL,
        entity TEXT NOT NULL,
        last_refresh_ms INTEGER NOT NULL,
        ttl_seconds INTEGER NOT NULL,
        status TEXT NOT NULL,
        item_count INTEGER NOT NULL,
        latest_cursor TEXT,
        last_error TEXT
    );

    CREATE TABLE IF NOT EXISTS refresh_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_key TEXT NOT NULL,
        recorded_ms INTEGER NOT NULL,
        ttl_used INTEGER NOT NULL,
        row_count INTEGER NOT NULL,
        status TEXT NOT NULL,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_refresh_log_entity ON refresh_log(entity_key, recorded_ms);
    CREATE INDEX IF NOT EXISTS idx_refresh_log_recorded ON refresh_log(recorded_ms);
";

/// Full schema: one table per [`EntityKind`] plus the ledger and refresh log. Idempotent.
#[must_use]
pub fn migration_sql() -> String {
    let mut sql = String::new();
    for kind in EntityKind::ALL {
        sql.push_str(&RECORD_TABLE.replace("{table}", kind.table()));
    }
    sql.push_str(LEDGER_TABLES);
    sql
}

/// `SQLite`-backed [`RecordStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `database_url`.
    ///
    /// In-memory databases are pinned to a single connection so every query sees the same data.
    ///
    /// # Errors
    /// Returns `StoreError::Database` if the URL is invalid or the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Opens the database and applies [`migration_sql`].
    ///
    /// # Errors
    /// Returns `StoreError::Database` on connection or schema failure.
    pub async fn connect_and_migrate(database_url: &str) -> Result<Self, StoreError> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// # Errors
    /// Returns `StoreError::Database` if the schema cannot be applied.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(&migration_sql()).execute(&self.pool).await?;
        tracing::debug!("store schema applied");
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Extracts a non-nullable field from a database row.
    fn get_required<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StoreError>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        row.try_get::<T, _>(column)
            .map_err(|e| StoreError::Database(format!("column '{column}': {e}")))
    }

    fn get_u64(row: &SqliteRow, column: &str) -> Result<u64, StoreError> {
        let value: i64 = Self::get_required(row, column)?;
        u64::try_from(value).map_err(|e| {
            StoreError::InvalidRecord(format!("column '{column}' value {value} is negative: {e}"))
        })
    }

    fn get_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
        let millis: i64 = Self::get_required(row, column)?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            StoreError::InvalidRecord(format!("column '{column}' value {millis} out of range"))
        })
    }

    fn row_to_record(row: &SqliteRow) -> Result<StoredRecord, StoreError> {
        let payload: String = Self::get_required(row, "payload")?;
        Ok(StoredRecord {
            natural_key: Self::get_required(row, "natural_key")?,
            cursor: row.try_get::<Option<String>, _>("cursor")?,
            revision: row.try_get::<Option<String>, _>("revision")?,
            payload: serde_json::from_str(&payload)?,
            first_seen_at: Self::get_timestamp(row, "first_seen_ms")?,
            updated_at: Self::get_timestamp(row, "updated_ms")?,
        })
    }

    fn row_to_ledger(row: &SqliteRow) -> Result<SyncLedgerRecord, StoreError> {
        let provider: String = Self::get_required(row, "provider")?;
        let kind: String = Self::get_required(row, "kind")?;
        let status: String = Self::get_required(row, "status")?;
        Ok(SyncLedgerRecord {
            key: EntityKey {
                provider: Provider::from(provider),
                kind: kind.parse()?,
                entity: Self::get_required(row, "entity")?,
            },
            last_refresh_at: Self::get_timestamp(row, "last_refresh_ms")?,
            ttl_seconds: Self::get_u64(row, "ttl_seconds")?,
            status: status.parse()?,
            item_count: Self::get_u64(row, "item_count")?,
            latest_cursor: row.try_get::<Option<String>, _>("latest_cursor")?,
            last_error: row.try_get::<Option<String>, _>("last_error")?,
        })
    }

    fn row_to_log(row: &SqliteRow) -> Result<RefreshLogEntry, StoreError> {
        let status: String = Self::get_required(row, "status")?;
        Ok(RefreshLogEntry {
            entity_key: Self::get_required(row, "entity_key")?,
            recorded_at: Self::get_timestamp(row, "recorded_ms")?,
            ttl_used: Self::get_u64(row, "ttl_used")?,
            row_count: Self::get_u64(row, "row_count")?,
            status: status.parse()?,
            error: row.try_get::<Option<String>, _>("error")?,
        })
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert_records(
        &self,
        key: &EntityKey,
        records: &[PermanentRecord],
    ) -> Result<UpsertSummary, StoreError> {
        let table = key.kind.table();
        let select = format!(
            "SELECT 1 FROM {table} WHERE provider = ? AND entity = ? AND natural_key = ?"
        );
        let upsert = format!(
            r"
            INSERT INTO {table} (provider, entity, natural_key, cursor, revision, payload,
                                 first_seen_ms, updated_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, entity, natural_key) DO UPDATE SET
                cursor = excluded.cursor,
                revision = excluded.revision,
                payload = excluded.payload,
                updated_ms = excluded.updated_ms
            WHERE {table}.payload <> excluded.payload
              AND ({table}.revision IS NULL
                   OR excluded.revision IS NULL
                   OR excluded.revision >= {table}.revision)
            "
        );

        let now = Utc::now().timestamp_millis();
        let mut summary = UpsertSummary::default();
        let mut tx = self.pool.begin().await?;

        for record in records {
            if record.natural_key.is_empty() {
                return Err(StoreError::InvalidRecord(format!(
                    "record for {key} has an empty natural key"
                )));
            }
            let payload = serde_json::to_string(&record.payload)?;

            let existed = sqlx::query(&select)
                .bind(key.provider.as_str())
                .bind(&key.entity)
                .bind(&record.natural_key)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

            let written = sqlx::query(&upsert)
                .bind(key.provider.as_str())
                .bind(&key.entity)
                .bind(&record.natural_key)
                .bind(&record.cursor)
                .bind(&record.revision)
                .bind(payload)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            match (existed, written > 0) {
                (false, _) => summary.inserted += 1,
                (true, true) => summary.updated += 1,
                (true, false) => summary.unchanged += 1,
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn read_records(&self, key: &EntityKey) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!(
            r"
            SELECT natural_key, cursor, revision, payload, first_seen_ms, updated_ms
            FROM {}
            WHERE provider = ? AND entity = ?
            ORDER BY cursor DESC, natural_key ASC
            ",
            key.kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(key.provider.as_str())
            .bind(&key.entity)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn count_records(&self, key: &EntityKey) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE provider = ? AND entity = ?",
            key.kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(key.provider.as_str())
            .bind(&key.entity)
            .fetch_one(&self.pool)
            .await?;
        Self::get_u64(&row, "n")
    }

    async fn latest_cursor(&self, key: &EntityKey) -> Result<Option<String>, StoreError> {
        let sql = format!(
            "SELECT MAX(cursor) AS latest FROM {} WHERE provider = ? AND entity = ?",
            key.kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(key.provider.as_str())
            .bind(&key.entity)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<String>, _>("latest")?)
    }

    async fn ledger(&self, key: &EntityKey) -> Result<Option<SyncLedgerRecord>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT provider, kind, entity, last_refresh_ms, ttl_seconds, status, item_count,
                   latest_cursor, last_error
            FROM sync_ledger
            WHERE ledger_key = ?
            ",
        )
        .bind(key.ledger_key())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_ledger(&row)).transpose()
    }

    async fn list_ledger(&self) -> Result<Vec<SyncLedgerRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT provider, kind, entity, last_refresh_ms, ttl_seconds, status, item_count,
                   latest_cursor, last_error
            FROM sync_ledger
            ORDER BY ledger_key
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_ledger).collect()
    }

    async fn record_sync(
        &self,
        ledger: &SyncLedgerRecord,
        log: &RefreshLogEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // An older completion from another process never overwrites a newer one
        sqlx::query(
            r"
            INSERT INTO sync_ledger (ledger_key, provider, kind, entity, last_refresh_ms,
                                     ttl_seconds, status, item_count, latest_cursor, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ledger_key) DO UPDATE SET
                last_refresh_ms = excluded.last_refresh_ms,
                ttl_seconds = excluded.ttl_seconds,
                status = excluded.status,
                item_count = excluded.item_count,
                latest_cursor = excluded.latest_cursor,
                last_error = excluded.last_error
            WHERE excluded.last_refresh_ms >= sync_ledger.last_refresh_ms
            ",
        )
        .bind(ledger.key.ledger_key())
        .bind(ledger.key.provider.as_str())
        .bind(ledger.key.kind.as_str())
        .bind(&ledger.key.entity)
        .bind(ledger.last_refresh_at.timestamp_millis())
        .bind(to_i64(ledger.ttl_seconds))
        .bind(ledger.status.as_str())
        .bind(to_i64(ledger.item_count))
        .bind(&ledger.latest_cursor)
        .bind(&ledger.last_error)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO refresh_log (entity_key, recorded_ms, ttl_used, row_count, status, error)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&log.entity_key)
        .bind(log.recorded_at.timestamp_millis())
        .bind(to_i64(log.ttl_used))
        .bind(to_i64(log.row_count))
        .bind(log.status.as_str())
        .bind(&log.error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn refresh_log(
        &self,
        key: &EntityKey,
        limit: u32,
    ) -> Result<Vec<RefreshLogEntry>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT entity_key, recorded_ms, ttl_used, row_count, status, error
            FROM refresh_log
            WHERE entity_key = ?
            ORDER BY recorded_ms DESC, id DESC
            LIMIT ?
            ",
        )
        .bind(key.ledger_key())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_log).collect()
    }

    async fn prune_refresh_log(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let removed = sqlx::query("DELETE FROM refresh_log WHERE recorded_ms < ?")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0 {
            tracing::info!(removed, "pruned refresh log");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn create_test_store() -> SqliteStore {
        SqliteStore::connect_and_migrate("sqlite::memory:").await.expect("Should create store")
    }

    fn filings() -> EntityKey {
        EntityKey::new("edgar", EntityKind::Filing, "AAPL")
    }

    fn filing(accession: &str, filed: &str) -> PermanentRecord {
        PermanentRecord::new(accession, json!({ "accession": accession, "filed": filed }))
            .with_cursor(filed)
    }

    fn ledger(status: SyncStatus, at: DateTime<Utc>, items: u64) -> SyncLedgerRecord {
        SyncLedgerRecord {
            key: filings(),
            last_refresh_at: at,
            ttl_seconds: 3600,
            status,
            item_count: items,
            latest_cursor: Some("2024-02-01".into()),
            last_error: None,
        }
    }

    fn log(at: DateTime<Utc>, rows: u64) -> RefreshLogEntry {
        RefreshLogEntry {
            entity_key: filings().ledger_key(),
            recorded_at: at,
            ttl_used: 3600,
            row_count: rows,
            status: SyncStatus::Success,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = create_test_store().await;
        assert!(store.migrate().await.is_ok(), "Second migration should be a no-op");
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_is_idempotent() {
        let store = create_test_store().await;
        let batch = vec![filing("0001", "2024-01-10"), filing("0002", "2024-02-01")];

        let first = store.upsert_records(&filings(), &batch).await.unwrap();
        assert_eq!(first, UpsertSummary { inserted: 2, updated: 0, unchanged: 0 });

        let second = store.upsert_records(&filings(), &batch).await.unwrap();
        assert_eq!(second, UpsertSummary { inserted: 0, updated: 0, unchanged: 2 });

        assert_eq!(store.count_records(&filings()).await.unwrap(), 2);
        assert_eq!(store.latest_cursor(&filings()).await.unwrap().as_deref(), Some("2024-02-01"));

        let rows = store.read_records(&filings()).await.unwrap();
        assert_eq!(rows[0].natural_key, "0002");
        assert_eq!(rows[1].payload["filed"], "2024-01-10");
    }

    #[tokio::test]
    async fn test_upsert_updates_changed_payload_but_not_older_revision() {
        let store = create_test_store().await;
        let v2 = PermanentRecord::new("2023-Q4", json!({ "revenue": 100 })).with_revision("2");
        store.upsert_records(&filings(), &[v2]).await.unwrap();

        let v1 = PermanentRecord::new("2023-Q4", json!({ "revenue": 90 })).with_revision("1");
        let older = store.upsert_records(&filings(), &[v1]).await.unwrap();
        assert_eq!(older.unchanged, 1);

        let v3 = PermanentRecord::new("2023-Q4", json!({ "revenue": 120 })).with_revision("3");
        let newer = store.upsert_records(&filings(), &[v3]).await.unwrap();
        assert_eq!(newer.updated, 1);

        let rows = store.read_records(&filings()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["revenue"], 120);
        assert_eq!(rows[0].revision.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_entities_and_kinds_are_isolated() {
        let store = create_test_store().await;
        store.upsert_records(&filings(), &[filing("0001", "2024-01-10")]).await.unwrap();

        let other_entity = EntityKey::new("edgar", EntityKind::Filing, "MSFT");
        let other_kind = EntityKey::new("edgar", EntityKind::Company, "AAPL");
        assert_eq!(store.count_records(&other_entity).await.unwrap(), 0);
        assert!(store.read_records(&other_kind).await.unwrap().is_empty());
        assert_eq!(store.latest_cursor(&other_entity).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_natural_key_rejected_and_rolled_back() {
        let store = create_test_store().await;
        let batch = vec![filing("0001", "2024-01-10"), PermanentRecord::new("", json!({}))];

        let result = store.upsert_records(&filings(), &batch).await;
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));
        assert_eq!(store.count_records(&filings()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_sync_writes_ledger_and_log() {
        let store = create_test_store().await;
        let now = Utc::now();
        store.record_sync(&ledger(SyncStatus::Success, now, 2), &log(now, 2)).await.unwrap();

        let stored = store.ledger(&filings()).await.unwrap().expect("ledger row");
        assert_eq!(stored.status, SyncStatus::Success);
        assert_eq!(stored.item_count, 2);
        assert_eq!(stored.last_refresh_at.timestamp_millis(), now.timestamp_millis());

        let entries = store.refresh_log(&filings(), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_count, 2);
        assert_eq!(store.list_ledger().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_older_ledger_write_does_not_overwrite_newer() {
        let store = create_test_store().await;
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(5);

        store.record_sync(&ledger(SyncStatus::Success, now, 3), &log(now, 3)).await.unwrap();
        store
            .record_sync(&ledger(SyncStatus::Failed, earlier, 0), &log(earlier, 0))
            .await
            .unwrap();

        let stored = store.ledger(&filings()).await.unwrap().expect("ledger row");
        assert_eq!(stored.status, SyncStatus::Success);
        assert_eq!(stored.item_count, 3);
        // The log is append-only and keeps both
        assert_eq!(store.refresh_log(&filings(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prune_refresh_log() {
        let store = create_test_store().await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(45);
        store.record_sync(&ledger(SyncStatus::Success, old, 1), &log(old, 1)).await.unwrap();
        store.record_sync(&ledger(SyncStatus::Success, now, 1), &log(now, 1)).await.unwrap();

        let removed = store.prune_refresh_log(now - chrono::Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.refresh_log(&filings(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_invalid_url_fails() {
        let result = SqliteStore::connect("invalid://not-a-valid-url").await;
        assert!(result.is_err(), "Invalid URL should fail");
    }
}
