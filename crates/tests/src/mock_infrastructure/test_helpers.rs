//! Test helper functions and fixtures.

use serde_json::{json, Value};
use sluice_core::{
    config::ProviderConfig,
    gateway::RetryPolicy,
    sources::{FieldMapping, JsonSource, SourceConfig, SourceMethod},
    store::{EntityKind, SqliteStore},
    sync::{FixedTtl, SyncEngine},
    Gateway,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Provider name used by every fixture.
pub const PROVIDER: &str = "edgar";

/// Fast retries so failure paths finish in milliseconds.
#[must_use]
pub fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        rate_limit_retries: 3,
        timeout_retries: 1,
        upstream_retries: 2,
        base_delay: Duration::from_millis(5),
    }
}

/// Provider settings pointing at `base_url` with generous pacing.
#[must_use]
pub fn provider_config(base_url: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new(PROVIDER, base_url, 100, 1_000, 0);
    config.request_timeout_ms = 2_000;
    config
}

/// Gateway over one provider at `base_url` with [`fast_retries`].
///
/// # Panics
///
/// Panics if the gateway cannot be built.
#[must_use]
pub fn test_gateway(base_url: &str) -> Gateway {
    test_gateway_with(provider_config(base_url))
}

/// # Panics
///
/// Panics if the gateway cannot be built.
#[must_use]
pub fn test_gateway_with(provider: ProviderConfig) -> Gateway {
    Gateway::builder()
        .provider(provider)
        .retry_policy(fast_retries())
        .build()
        .expect("test gateway")
}

/// A filing as a provider lists it.
#[must_use]
pub fn filing(accession: &str, filed: &str) -> Value {
    json!({
        "accessionNumber": accession,
        "filingDate": filed,
        "form": "10-K",
        "primaryDocument": format!("{accession}.htm"),
    })
}

/// `{"filings": [...]}` for `(accession, filing date)` pairs.
#[must_use]
pub fn filings_body(filings: &[(&str, &str)]) -> Value {
    json!({ "filings": filings.iter().map(|(a, d)| filing(a, d)).collect::<Vec<_>>() })
}

/// Source reading `/submissions/{entity}/filings` incrementally via `since`.
#[must_use]
pub fn filings_source_config() -> SourceConfig {
    SourceConfig {
        name: "edgar-filings".into(),
        provider: PROVIDER.into(),
        kind: EntityKind::Filing,
        method: SourceMethod::Get,
        path: "/submissions/{entity}/filings".into(),
        params: BTreeMap::new(),
        records_pointer: "/filings".into(),
        cursor_param: Some("since".into()),
        natural_key: vec!["/accessionNumber".into()],
        cursor: vec!["/filingDate".into()],
        revision: Vec::new(),
        fields: FieldMapping::new()
            .field("form", &["/form", "/formType"])
            .field("filed", &["/filingDate"]),
        ttl: Default::default(),
    }
}

/// In-memory store with the production schema.
///
/// # Panics
///
/// Panics if the schema cannot be applied.
pub async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::connect_and_migrate("sqlite::memory:").await.expect("memory store"))
}

/// Sync engine with the filings source, a one-hour TTL and a five-minute failure retry.
#[must_use]
pub fn sync_engine(gateway: Gateway, store: Arc<SqliteStore>, base_url: &str) -> SyncEngine {
    SyncEngine::new(gateway, store, Duration::from_secs(300)).with_source(
        Arc::new(JsonSource::new(filings_source_config(), base_url)),
        Arc::new(FixedTtl(Duration::from_secs(3_600))),
    )
}
