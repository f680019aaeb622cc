//! # Permanent Store
//!
//! Durable, incrementally written storage for provider records, the per-entity sync ledger,
//! and the append-only refresh log.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ companies | filings | financial_periods | holdings | ...      │
//! │   UNIQUE(entity, natural_key)  ── upsert, never delete        │
//! ├───────────────────────────────────────────────────────────────┤
//! │ sync_ledger   one row per entity: last refresh, ttl, status   │
//! ├───────────────────────────────────────────────────────────────┤
//! │ refresh_log   append-only (entity_key, at, ttl, rows, status) │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads always return whatever is stored, no matter how old. Upserts are keyed by the
//! provider's natural identifier so concurrent or repeated syncs of the same remote state are
//! idempotent; several gateway processes may write the same database without coordination.
//!
//! # Error Handling
//!
//! All operations return [`Result<T, StoreError>`](StoreError). `sqlx` errors convert through
//! `From`, so `?` works directly on queries.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::types::Provider;

/// Errors raised by the durable store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// A stored payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A record or ledger row violates a store invariant
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Category of durable entity. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Filing,
    FinancialPeriod,
    Holding,
    LobbyingFiling,
    SpendingAward,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Company,
        EntityKind::Filing,
        EntityKind::FinancialPeriod,
        EntityKind::Holding,
        EntityKind::LobbyingFiling,
        EntityKind::SpendingAward,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Filing => "filing",
            EntityKind::FinancialPeriod => "financial_period",
            EntityKind::Holding => "holding",
            EntityKind::LobbyingFiling => "lobbying_filing",
            EntityKind::SpendingAward => "spending_award",
        }
    }

    /// Backing table name. Only ever one of these fixed identifiers.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Company => "companies",
            EntityKind::Filing => "filings",
            EntityKind::FinancialPeriod => "financial_periods",
            EntityKind::Holding => "holdings",
            EntityKind::LobbyingFiling => "lobbying_filings",
            EntityKind::SpendingAward => "spending_awards",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.table() == s)
            .ok_or_else(|| StoreError::InvalidRecord(format!("unknown entity kind: {s}")))
    }
}

/// One durable entity: a provider's view of one kind of record for one subject
/// (e.g. `edgar` filings for `AAPL`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub provider: Provider,
    pub kind: EntityKind,
    pub entity: String,
}

impl EntityKey {
    #[must_use]
    pub fn new(provider: impl Into<Provider>, kind: EntityKind, entity: impl Into<String>) -> Self {
        Self { provider: provider.into(), kind, entity: entity.into() }
    }

    /// Ledger and refresh-log key: `provider:kind:entity`.
    #[must_use]
    pub fn ledger_key(&self) -> String {
        format!("{}:{}:{}", self.provider, self.kind, self.entity)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.kind, self.entity)
    }
}

/// A record as produced by a source adapter, ready to upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentRecord {
    /// Externally assigned identifier (accession number, filing UUID, period end date).
    pub natural_key: String,
    /// Sortable position used to request only newer records next time.
    pub cursor: Option<String>,
    /// Sortable version; an existing row is only replaced by an equal or newer revision.
    pub revision: Option<String>,
    pub payload: Value,
}

impl PermanentRecord {
    #[must_use]
    pub fn new(natural_key: impl Into<String>, payload: Value) -> Self {
        Self { natural_key: natural_key.into(), cursor: None, revision: None, payload }
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// A durable row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub natural_key: String,
    pub cursor: Option<String>,
    pub revision: Option<String>,
    pub payload: Value,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl UpsertSummary {
    /// Rows that were written (inserted or updated).
    #[must_use]
    pub fn changed(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(StoreError::InvalidRecord(format!("unknown sync status: {other}"))),
        }
    }
}

/// When an entity was last synced and when the next sync should be attempted.
///
/// The TTL governs the next sync attempt only; durable rows never expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLedgerRecord {
    pub key: EntityKey,
    pub last_refresh_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub status: SyncStatus,
    pub item_count: u64,
    pub latest_cursor: Option<String>,
    pub last_error: Option<String>,
}

/// One append-only refresh-log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshLogEntry {
    pub entity_key: String,
    pub recorded_at: DateTime<Utc>,
    pub ttl_used: u64,
    pub row_count: u64,
    pub status: SyncStatus,
    pub error: Option<String>,
}

/// Durable storage operations used by the sync engine.
///
/// Abstracted for testability and backend flexibility (current: `SQLite`).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upserts `records` for `key` by natural key in a single transaction.
    ///
    /// A row is replaced only when its payload differs and the incoming revision is not older
    /// than the stored one, so re-applying the same remote state changes nothing.
    async fn upsert_records(
        &self,
        key: &EntityKey,
        records: &[PermanentRecord],
    ) -> Result<UpsertSummary, StoreError>;

    /// Every durable row for `key`, newest cursor first.
    async fn read_records(&self, key: &EntityKey) -> Result<Vec<StoredRecord>, StoreError>;

    async fn count_records(&self, key: &EntityKey) -> Result<u64, StoreError>;

    /// Greatest cursor stored for `key`, the starting point of the next incremental fetch.
    async fn latest_cursor(&self, key: &EntityKey) -> Result<Option<String>, StoreError>;

    async fn ledger(&self, key: &EntityKey) -> Result<Option<SyncLedgerRecord>, StoreError>;

    async fn list_ledger(&self) -> Result<Vec<SyncLedgerRecord>, StoreError>;

    /// Writes the ledger row and appends the matching refresh-log entry atomically.
    async fn record_sync(
        &self,
        ledger: &SyncLedgerRecord,
        log: &RefreshLogEntry,
    ) -> Result<(), StoreError>;

    /// Most recent refresh-log entries for `key`, newest first.
    async fn refresh_log(
        &self,
        key: &EntityKey,
        limit: u32,
    ) -> Result<Vec<RefreshLogEntry>, StoreError>;

    /// Deletes refresh-log rows recorded before `older_than`. Returns how many were removed.
    async fn prune_refresh_log(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}
