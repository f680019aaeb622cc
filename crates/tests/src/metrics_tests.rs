//! Prometheus exposition after real gateway traffic.
//!
//! The recorder is process-global, so these tests run serially.

use crate::mock_infrastructure::{
    filings_body, filings_path, memory_store, sync_engine, test_gateway, ProviderMockBuilder,
    PROVIDER,
};
use serial_test::serial;
use sluice_core::{
    metrics::MetricsCollector,
    store::{EntityKey, EntityKind},
};

#[tokio::test]
#[serial]
async fn test_fetch_and_sync_counters_are_rendered() {
    let collector = MetricsCollector::new();
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-15")]), 1).await;
    let engine = sync_engine(test_gateway(&mock.url()), memory_store().await, &mock.url());

    engine.sync(&EntityKey::new(PROVIDER, EntityKind::Filing, "AAPL")).await.unwrap();

    let rendered = collector.get_prometheus_metrics();
    assert!(rendered.contains("gateway_requests_total"), "missing requests: {rendered}");
    assert!(rendered.contains("gateway_upstream_calls_total"));
    assert!(rendered.contains("sync_runs_total"));
    assert!(rendered.contains("sync_rows_upserted_total"));
    assert!(rendered.contains(r#"provider="edgar""#));
}

#[tokio::test]
#[serial]
async fn test_upstream_errors_are_labelled_by_type() {
    let collector = MetricsCollector::new();
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_status(&filings_path("AAPL"), 503, 3).await;
    let engine = sync_engine(test_gateway(&mock.url()), memory_store().await, &mock.url());

    let _ = engine.sync(&EntityKey::new(PROVIDER, EntityKind::Filing, "AAPL")).await;

    let rendered = collector.get_prometheus_metrics();
    assert!(rendered.contains("gateway_upstream_errors_total"));
    assert!(rendered.contains(r#"error_type="http_5xx""#));
    assert!(rendered.contains(r#"status="failed""#));
}
