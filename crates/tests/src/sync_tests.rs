//! Incremental sync from a JSON source into an in-memory store.

use crate::mock_infrastructure::{
    filings_body, filings_path, memory_store, sync_engine, test_gateway, ProviderMockBuilder,
    PROVIDER,
};
use sluice_core::{
    store::{EntityKey, EntityKind, RecordStore, SyncStatus},
    sync::{SyncError, SyncTrigger},
    GatewayError,
};

fn filings_key(entity: &str) -> EntityKey {
    EntityKey::new(PROVIDER, EntityKind::Filing, entity)
}

#[tokio::test]
async fn test_first_sync_stores_everything_and_records_ledger() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-15"), ("0002", "2024-02-01")]), 1)
        .await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store.clone(), &mock.url());
    let key = filings_key("AAPL");

    let report = engine.sync(&key).await.unwrap();

    assert_eq!(report.fetched, 2);
    assert_eq!(report.upserted.inserted, 2);
    assert_eq!(report.item_count, 2);
    assert_eq!(report.latest_cursor.as_deref(), Some("2024-02-01"));
    assert_eq!(report.ttl_seconds, 3_600);
    mock.assert_all().await;

    let ledger = engine.ledger().status(&key).await.unwrap().unwrap();
    assert_eq!(ledger.status, SyncStatus::Success);
    assert_eq!(ledger.item_count, 2);
    assert_eq!(ledger.latest_cursor.as_deref(), Some("2024-02-01"));
    assert!(ledger.last_error.is_none());

    let records = store.read_records(&key).await.unwrap();
    let stored = records.iter().find(|r| r.natural_key == "0001").unwrap();
    assert_eq!(stored.payload["form"], "10-K");
    assert_eq!(stored.payload["filed"], "2024-01-15");
    assert!(!engine.is_due(&key).await.unwrap());
}

#[tokio::test]
async fn test_next_sync_asks_only_for_newer_records() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-15"), ("0002", "2024-02-01")]), 1)
        .await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store.clone(), &mock.url());
    let key = filings_key("AAPL");
    engine.sync(&key).await.unwrap();
    mock.assert_all().await;
    mock.reset().await;

    // Providers answer `since` inclusively, so the newest stored filing comes back too
    mock.mock_filings_since(
        "AAPL",
        "2024-02-01",
        &filings_body(&[("0002", "2024-02-01"), ("0003", "2024-03-10")]),
    )
    .await;

    let report = engine.sync(&key).await.unwrap();

    assert_eq!(report.fetched, 2);
    assert_eq!(report.upserted.inserted, 1);
    assert_eq!(report.upserted.unchanged, 1);
    assert_eq!(report.upserted.updated, 0);
    assert_eq!(report.item_count, 3);
    assert_eq!(report.latest_cursor.as_deref(), Some("2024-03-10"));
    mock.assert_all().await;

    let mut keys: Vec<_> =
        store.read_records(&key).await.unwrap().into_iter().map(|r| r.natural_key).collect();
    keys.sort();
    assert_eq!(keys, ["0001", "0002", "0003"]);

    let log = store.refresh_log(&key, 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].row_count, 1);
    assert_eq!(log[1].row_count, 2);
}

#[tokio::test]
async fn test_records_older_than_cursor_are_ignored() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("MSFT", &filings_body(&[("0005", "2024-05-01")]), 1).await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store.clone(), &mock.url());
    let key = filings_key("MSFT");
    engine.sync(&key).await.unwrap();
    mock.reset().await;

    // A provider that ignores `since` and replays its whole history
    mock.mock_filings_since(
        "MSFT",
        "2024-05-01",
        &filings_body(&[("0004", "2024-04-01"), ("0005", "2024-05-01")]),
    )
    .await;

    let report = engine.sync(&key).await.unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.upserted.changed(), 0);
    assert_eq!(store.count_records(&key).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_sync_is_recorded_and_backs_off() {
    let mut mock = ProviderMockBuilder::new().await;
    // One attempt plus two retries
    mock.mock_status(&filings_path("AAPL"), 503, 3).await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store.clone(), &mock.url());
    let key = filings_key("AAPL");

    let err = engine.sync(&key).await.unwrap_err();

    assert!(
        matches!(err, SyncError::Gateway(GatewayError::Upstream { .. })),
        "unexpected error: {err:?}"
    );
    mock.assert_all().await;

    let ledger = engine.ledger().status(&key).await.unwrap().unwrap();
    assert_eq!(ledger.status, SyncStatus::Failed);
    assert_eq!(ledger.ttl_seconds, 300);
    assert_eq!(ledger.item_count, 0);
    assert!(ledger.last_error.as_deref().unwrap().contains("503"));
    assert!(!engine.is_due(&key).await.unwrap());

    let log = store.refresh_log(&key, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, SyncStatus::Failed);
    assert!(log[0].error.is_some());
}

#[tokio::test]
async fn test_resync_within_ttl_contacts_provider() {
    let mut mock = ProviderMockBuilder::new().await;
    // Initial sync plus two incremental syncs asking with the same cursor
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-15"), ("0002", "2024-02-01")]), 3)
        .await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store.clone(), &mock.url());
    let key = filings_key("AAPL");

    for _ in 0..3 {
        engine.sync(&key).await.unwrap();
    }

    mock.assert_all().await;
    assert_eq!(store.count_records(&key).await.unwrap(), 2);
    assert_eq!(store.refresh_log(&key, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_resync_failure_is_not_masked_by_cached_answer() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-15"), ("0002", "2024-02-01")]), 2)
        .await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store.clone(), &mock.url());
    let key = filings_key("AAPL");

    // The second sync leaves a fresh gateway entry for the `since=2024-02-01` request
    engine.sync(&key).await.unwrap();
    engine.sync(&key).await.unwrap();
    mock.assert_all().await;
    mock.reset().await;

    // One attempt plus two retries
    mock.mock_status(&filings_path("AAPL"), 503, 3).await;

    let err = engine.sync(&key).await.unwrap_err();

    assert!(
        matches!(err, SyncError::Gateway(GatewayError::Upstream { .. })),
        "unexpected error: {err:?}"
    );
    mock.assert_all().await;

    let ledger = engine.ledger().status(&key).await.unwrap().unwrap();
    assert_eq!(ledger.status, SyncStatus::Failed);
    assert_eq!(ledger.ttl_seconds, 300);
    assert_eq!(ledger.item_count, 2);

    let log = store.refresh_log(&key, 10).await.unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].status, SyncStatus::Failed);
    assert_eq!(log[1].status, SyncStatus::Success);
}

#[tokio::test]
async fn test_unknown_entity_fails_without_retries() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_status(&filings_path("NOPE"), 404, 1).await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store, &mock.url());
    let key = filings_key("NOPE");

    let err = engine.sync(&key).await.unwrap_err();

    assert!(
        matches!(err, SyncError::Gateway(GatewayError::NotFound { .. })),
        "unexpected error: {err:?}"
    );
    mock.assert_all().await;
    assert_eq!(
        engine.ledger().status(&key).await.unwrap().map(|l| l.status),
        Some(SyncStatus::Failed)
    );
}

#[tokio::test]
async fn test_read_or_sync_syncs_once_then_serves_stored_rows() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-15"), ("0002", "2024-02-01")]), 1)
        .await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store, &mock.url());
    let key = filings_key("AAPL");

    let first = engine.read_or_sync(&key).await.unwrap();
    assert_eq!(first.sync, SyncTrigger::Foreground);
    assert_eq!(first.records.len(), 2);
    assert_eq!(first.ledger.as_ref().map(|l| l.item_count), Some(2));

    let second = engine.read_or_sync(&key).await.unwrap();
    assert_eq!(second.sync, SyncTrigger::None);
    assert_eq!(second.records.len(), 2);
    assert!(!engine.is_syncing(&key));

    mock.assert_all().await;
}

#[tokio::test]
async fn test_unregistered_kind_has_no_source() {
    let mock = ProviderMockBuilder::new().await;
    let store = memory_store().await;
    let engine = sync_engine(test_gateway(&mock.url()), store, &mock.url());
    let key = EntityKey::new(PROVIDER, EntityKind::LobbyingFiling, "ACME");

    let err = engine.read_or_sync(&key).await.unwrap_err();

    assert!(matches!(err, SyncError::NoSource { kind: EntityKind::LobbyingFiling, .. }));
}
