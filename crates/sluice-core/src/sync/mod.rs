//! # Incremental Sync
//!
//! Keeps the durable store current by fetching only records newer than what is already stored.
//!
//! ```text
//! read_or_sync(key)
//!   │
//!   ├─ store.read(key) ── rows ──┬─ ledger not due ─────────────► rows
//!   │                            └─ ledger due ── spawn sync ───► rows (background)
//!   │
//!   └─ no rows ── ledger due ── sync(key) ──────────────────────► rows (foreground)
//!
//! sync(key)
//!   since   = store.latest_cursor(key)
//!   records = source.fetch_since(gateway, entity, since)     (throttled, cached, collapsed)
//!   store.upsert_records(key, records)                       (idempotent by natural key)
//!   ledger.record_success | ledger.record_failure            (+ refresh log)
//! ```
//!
//! At most one background sync per entity runs in this process at a time; across processes the
//! ledger's due check acts as the cooldown, and natural-key upserts make overlapping syncs
//! harmless.

pub mod ledger;
pub mod ttl;

pub use ledger::SyncLedger;
pub use ttl::{
    EmptyEntityTtl, FixedTtl, MarketHoursTtl, ReportingSeasonTtl, SyncContext, TtlPolicy,
    TtlPolicyConfig,
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    gateway::{Gateway, GatewayError},
    metrics,
    store::{
        EntityKey, EntityKind, PermanentRecord, RecordStore, StoreError, StoredRecord,
        SyncLedgerRecord, UpsertSummary,
    },
    types::Provider,
};

/// Errors raised by a sync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no source registered for {provider} {kind}")]
    NoSource { provider: Provider, kind: EntityKind },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A provider adapter able to fetch the records of one entity newer than a cursor.
///
/// Adapters issue their requests through the [`Gateway`] so they share its pacing, breaker,
/// cache and collapsing with every other caller of the same provider.
#[async_trait]
pub trait IncrementalSource: Send + Sync {
    fn provider(&self) -> &Provider;

    fn kind(&self) -> EntityKind;

    /// Records for `entity` newer than `since` (all records when `since` is `None`).
    ///
    /// # Errors
    /// Returns [`GatewayError`] if the provider cannot be reached or answers with an error.
    async fn fetch_since(
        &self,
        gateway: &Gateway,
        entity: &str,
        since: Option<&str>,
        ttl: Duration,
    ) -> Result<Vec<PermanentRecord>, GatewayError>;
}

/// Outcome of one successful sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub key: EntityKey,
    pub fetched: usize,
    pub upserted: UpsertSummary,
    pub item_count: u64,
    pub latest_cursor: Option<String>,
    pub ttl_seconds: u64,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Durable rows served, no sync due.
    None,
    /// Durable rows served, a background sync was started.
    Background,
    /// Nothing stored yet; synced before answering.
    Foreground,
}

/// Durable rows for an entity plus its ledger state.
#[derive(Debug, Clone, Serialize)]
pub struct ReadOutcome {
    pub records: Vec<StoredRecord>,
    pub ledger: Option<SyncLedgerRecord>,
    pub sync: SyncTrigger,
}

#[derive(Clone)]
struct RegisteredSource {
    source: Arc<dyn IncrementalSource>,
    policy: Arc<dyn TtlPolicy>,
}

/// Releases an entity's background-sync slot.
struct InProgressGuard {
    in_progress: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.in_progress.remove(&self.key);
    }
}

/// Drives incremental syncs between registered sources and the durable store.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    gateway: Gateway,
    store: Arc<dyn RecordStore>,
    ledger: SyncLedger,
    sources: Arc<HashMap<(Provider, EntityKind), RegisteredSource>>,
    in_progress: Arc<DashMap<String, ()>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(gateway: Gateway, store: Arc<dyn RecordStore>, failure_retry: Duration) -> Self {
        Self {
            gateway,
            ledger: SyncLedger::new(Arc::clone(&store), failure_retry),
            store,
            sources: Arc::new(HashMap::new()),
            in_progress: Arc::new(DashMap::new()),
        }
    }

    /// Registers `source` for its `(provider, kind)` with the TTL policy governing its syncs.
    ///
    /// Call before cloning the engine; a later registration replaces an earlier one.
    #[must_use]
    pub fn with_source(
        mut self,
        source: Arc<dyn IncrementalSource>,
        policy: Arc<dyn TtlPolicy>,
    ) -> Self {
        let slot = (source.provider().clone(), source.kind());
        Arc::make_mut(&mut self.sources).insert(slot, RegisteredSource { source, policy });
        self
    }

    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    #[must_use]
    pub fn ledger(&self) -> &SyncLedger {
        &self.ledger
    }

    /// Registered `(provider, kind)` pairs.
    #[must_use]
    pub fn sources(&self) -> Vec<(Provider, EntityKind)> {
        let mut sources: Vec<_> = self.sources.keys().cloned().collect();
        sources.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));
        sources
    }

    fn registered(&self, key: &EntityKey) -> Result<&RegisteredSource, SyncError> {
        self.sources
            .get(&(key.provider.clone(), key.kind))
            .ok_or_else(|| SyncError::NoSource { provider: key.provider.clone(), kind: key.kind })
    }

    /// Whatever is durably stored for `key`, regardless of sync recency.
    ///
    /// # Errors
    /// Returns [`SyncError::Store`] if the store cannot be read.
    pub async fn read(&self, key: &EntityKey) -> Result<Vec<StoredRecord>, SyncError> {
        Ok(self.store.read_records(key).await?)
    }

    /// # Errors
    /// Returns [`SyncError::NoSource`] for unregistered entities, [`SyncError::Store`] if the
    /// ledger cannot be read.
    pub async fn is_due(&self, key: &EntityKey) -> Result<bool, SyncError> {
        self.registered(key)?;
        Ok(self.ledger.is_due(key, Utc::now()).await?)
    }

    /// Fetches records newer than the latest stored cursor, upserts them, and records the
    /// outcome in the ledger.
    ///
    /// Any failure after the source is resolved, whether fetching or persisting, is recorded as
    /// a failed sync before the error is returned.
    ///
    /// # Errors
    /// Returns [`SyncError`] if no source is registered, the fetch fails, or the store fails.
    pub async fn sync(&self, key: &EntityKey) -> Result<SyncReport, SyncError> {
        let registered = self.registered(key)?;
        match self.run_sync(key, registered).await {
            Ok(report) => Ok(report),
            Err(error) => {
                self.record_failure(key, &error).await;
                Err(error)
            }
        }
    }

    async fn run_sync(
        &self,
        key: &EntityKey,
        registered: &RegisteredSource,
    ) -> Result<SyncReport, SyncError> {
        let started = std::time::Instant::now();
        let since = self.store.latest_cursor(key).await?;

        let fetch_ttl = registered.policy.ttl(key, &SyncContext::at(Utc::now()));
        let records = registered
            .source
            .fetch_since(&self.gateway, &key.entity, since.as_deref(), fetch_ttl)
            .await?;

        let upserted = self.store.upsert_records(key, &records).await?;
        let item_count = self.store.count_records(key).await?;
        let latest_cursor = self.store.latest_cursor(key).await?;
        let record = self
            .ledger
            .record_success(
                key,
                registered.policy.as_ref(),
                Utc::now(),
                item_count,
                latest_cursor.clone(),
                upserted.changed(),
            )
            .await?;

        metrics::record_sync_run(key.provider.as_str(), true, upserted.changed());
        tracing::info!(
            entity = %key,
            fetched = records.len(),
            inserted = upserted.inserted,
            updated = upserted.updated,
            item_count,
            next_sync_secs = record.ttl_seconds,
            "sync complete"
        );

        Ok(SyncReport {
            key: key.clone(),
            fetched: records.len(),
            upserted,
            item_count,
            latest_cursor,
            ttl_seconds: record.ttl_seconds,
            duration: started.elapsed(),
        })
    }

    /// Best-effort ledger write for a failed sync; a store that cannot take it is only logged.
    async fn record_failure(&self, key: &EntityKey, error: &SyncError) {
        metrics::record_sync_run(key.provider.as_str(), false, 0);
        match error {
            SyncError::Store(_) => tracing::error!(entity = %key, error = %error, "sync failed"),
            _ => tracing::warn!(entity = %key, error = %error, "sync failed"),
        }
        if let Err(store_error) =
            self.ledger.record_failure(key, Utc::now(), &error.to_string()).await
        {
            tracing::error!(entity = %key, error = %store_error, "failed to record sync failure");
        }
    }

    /// Starts a background sync for `key` unless one is already running in this process.
    /// Returns whether a sync was started.
    pub fn spawn_sync(&self, key: &EntityKey) -> bool {
        let slot = key.ledger_key();
        if self.in_progress.insert(slot.clone(), ()).is_some() {
            tracing::debug!(entity = %key, "background sync already running");
            return false;
        }
        let guard = InProgressGuard { in_progress: Arc::clone(&self.in_progress), key: slot };

        let engine = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let _guard = guard;
            // Failures are logged and recorded in the ledger by `sync`
            let _ = engine.sync(&key).await;
        });
        true
    }

    /// Whether a background sync for `key` is running in this process.
    #[must_use]
    pub fn is_syncing(&self, key: &EntityKey) -> bool {
        self.in_progress.contains_key(&key.ledger_key())
    }

    /// Serves durable rows, syncing in the foreground only when nothing is stored and a sync is
    /// due, and in the background when rows exist but a sync is due.
    ///
    /// # Errors
    /// Returns [`SyncError`] if the store cannot be read or a required foreground sync fails.
    pub async fn read_or_sync(&self, key: &EntityKey) -> Result<ReadOutcome, SyncError> {
        self.registered(key)?;
        let records = self.store.read_records(key).await?;
        let ledger = self.ledger.status(key).await?;
        let now = Utc::now();
        let due = ledger.as_ref().map_or(true, |record| SyncLedger::is_record_due(record, now));

        if !due {
            return Ok(ReadOutcome { records, ledger, sync: SyncTrigger::None });
        }

        if records.is_empty() {
            self.sync(key).await?;
            return Ok(ReadOutcome {
                records: self.store.read_records(key).await?,
                ledger: self.ledger.status(key).await?,
                sync: SyncTrigger::Foreground,
            });
        }

        let sync = if self.spawn_sync(key) { SyncTrigger::Background } else { SyncTrigger::None };
        Ok(ReadOutcome { records, ledger, sync })
    }
}
