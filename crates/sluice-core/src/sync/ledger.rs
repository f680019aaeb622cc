use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};

use super::ttl::{SyncContext, TtlPolicy};
use crate::store::{EntityKey, RecordStore, RefreshLogEntry, StoreError, SyncLedgerRecord, SyncStatus};

/// Decides when an entity's next incremental sync is due and records each sync's outcome.
///
/// Due-ness is `now - last_refresh_at >= ttl_seconds`. The TTL is fixed when the sync completes:
/// a successful sync stores the injected [`TtlPolicy`] evaluated at that moment, a failed one
/// stores the failure retry interval. A failure is never mistaken for a fresh sync.
#[derive(Clone)]
pub struct SyncLedger {
    store: Arc<dyn RecordStore>,
    failure_retry: Duration,
}

impl SyncLedger {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, failure_retry: Duration) -> Self {
        Self { store, failure_retry }
    }

    /// # Errors
    /// Returns [`StoreError`] if the ledger cannot be read.
    pub async fn status(&self, key: &EntityKey) -> Result<Option<SyncLedgerRecord>, StoreError> {
        self.store.ledger(key).await
    }

    /// Whether a sync should be attempted for `key` at `now`. Entities never synced are due.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the ledger cannot be read.
    pub async fn is_due(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(record) = self.store.ledger(key).await? else {
            return Ok(true);
        };
        Ok(Self::is_record_due(&record, now))
    }

    /// Due-ness of an already loaded ledger record, against the TTL stored with it.
    #[must_use]
    pub fn is_record_due(record: &SyncLedgerRecord, now: DateTime<Utc>) -> bool {
        let interval = Duration::from_secs(record.ttl_seconds);
        // Negative under clock skew between processes: not due
        (now - record.last_refresh_at).to_std().is_ok_and(|elapsed| elapsed >= interval)
    }

    /// Records a completed sync and appends it to the refresh log.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the ledger cannot be written.
    pub async fn record_success(
        &self,
        key: &EntityKey,
        policy: &dyn TtlPolicy,
        now: DateTime<Utc>,
        item_count: u64,
        latest_cursor: Option<String>,
        rows_changed: u64,
    ) -> Result<SyncLedgerRecord, StoreError> {
        let ctx = SyncContext { now, item_count, latest_cursor: latest_cursor.clone() };
        let ttl_seconds = policy.ttl(key, &ctx).as_secs();

        let record = SyncLedgerRecord {
            key: key.clone(),
            last_refresh_at: now,
            ttl_seconds,
            status: SyncStatus::Success,
            item_count,
            latest_cursor,
            last_error: None,
        };
        let log = RefreshLogEntry {
            entity_key: key.ledger_key(),
            recorded_at: now,
            ttl_used: ttl_seconds,
            row_count: rows_changed,
            status: SyncStatus::Success,
            error: None,
        };

        self.store.record_sync(&record, &log).await?;
        Ok(record)
    }

    /// Records a failed sync. Keeps the previously known item count and cursor; the next attempt
    /// is due after the failure retry interval.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the ledger cannot be read or written.
    pub async fn record_failure(
        &self,
        key: &EntityKey,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<SyncLedgerRecord, StoreError> {
        let item_count = self.store.count_records(key).await?;
        let latest_cursor = self.store.latest_cursor(key).await?;
        let ttl_seconds = self.failure_retry.as_secs();

        let record = SyncLedgerRecord {
            key: key.clone(),
            last_refresh_at: now,
            ttl_seconds,
            status: SyncStatus::Failed,
            item_count,
            latest_cursor,
            last_error: Some(error.to_string()),
        };
        let log = RefreshLogEntry {
            entity_key: key.ledger_key(),
            recorded_at: now,
            ttl_used: ttl_seconds,
            row_count: 0,
            status: SyncStatus::Failed,
            error: Some(error.to_string()),
        };

        self.store.record_sync(&record, &log).await?;
        Ok(record)
    }
}
