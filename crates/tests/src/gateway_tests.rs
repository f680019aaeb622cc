//! Gateway behaviour against a mock provider, through the real HTTP client.

use crate::mock_infrastructure::{
    filings_body, filings_path, provider_config, test_gateway, test_gateway_with,
    ProviderMockBuilder, PROVIDER,
};
use mockito::Matcher;
use serde_json::Value;
use sluice_core::{
    upstream::CircuitBreakerState, CacheKey, FetchOptions, FetchSource, Fetched, Gateway,
    GatewayError, Provider,
};
use std::{sync::Arc, time::Duration};

const TTL: Duration = Duration::from_secs(60);

/// `cached_fetch` of `entity`'s filings through the gateway's HTTP client.
async fn fetch(
    gateway: &Gateway,
    base_url: &str,
    entity: &str,
    ttl: Duration,
    options: FetchOptions,
) -> Result<Fetched<Value>, GatewayError> {
    let provider = Provider::new(PROVIDER);
    let key = CacheKey::new(&provider, entity);
    let http = Arc::clone(gateway.http());
    let url = format!("{base_url}{}", filings_path(entity));
    let caller = provider.clone();

    gateway
        .cached_fetch(
            &provider,
            &key,
            move || {
                let http = Arc::clone(&http);
                let url = url.clone();
                let provider = caller.clone();
                async move { http.get_json(&provider, &url, &[], Duration::from_secs(2)).await }
            },
            ttl,
            options,
        )
        .await
}

#[tokio::test]
async fn test_second_call_is_served_from_cache() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-01")]), 1).await;
    let gateway = test_gateway(&mock.url());

    let first = fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap();
    let second = fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap();

    assert_eq!(first.source, FetchSource::Api);
    assert_eq!(second.source, FetchSource::Cache);
    assert_eq!(first.data, second.data);
    assert_eq!(first.fetched_at, second.fetched_at);
    mock.assert_all().await;
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_call() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("MSFT", &filings_body(&[("0001", "2024-01-01")]), 1).await;
    let gateway = test_gateway(&mock.url());
    let url = mock.url();

    let calls = (0..8).map(|_| fetch(&gateway, &url, "MSFT", TTL, FetchOptions::default()));
    let results = futures::future::join_all(calls).await;

    let sources: Vec<_> = results.iter().map(|r| r.as_ref().unwrap().source).collect();
    assert_eq!(sources.iter().filter(|s| **s == FetchSource::Api).count(), 1);
    assert_eq!(sources.iter().filter(|s| **s == FetchSource::Deduplicated).count(), 7);
    mock.assert_all().await;

    let stats = gateway.stats().await;
    assert_eq!(stats.providers[0].upstream_calls, 1);
    assert_eq!(stats.providers[0].deduplicated, 7);
}

#[tokio::test]
async fn test_rate_limited_then_recovers_honouring_retry_after() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_rate_limited(&filings_path("AAPL"), 0, 2).await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-01")]), 1).await;
    let gateway = test_gateway(&mock.url());

    let fetched =
        fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap();

    assert_eq!(fetched.source, FetchSource::Api);
    assert_eq!(fetched.data["filings"][0]["accessionNumber"], "0001");
    mock.assert_all().await;

    let state = gateway.provider_state(&Provider::new(PROVIDER)).unwrap();
    assert_eq!(state.throttle().consecutive_errors(), 0);
    assert_eq!(state.breaker().get_state().await, CircuitBreakerState::Closed);
}

#[tokio::test]
async fn test_rate_limit_exhaustion_is_provider_unavailable() {
    let mut mock = ProviderMockBuilder::new().await;
    // One attempt plus three retries
    mock.mock_rate_limited(&filings_path("AAPL"), 0, 4).await;
    let mut provider = provider_config(&mock.url());
    provider.circuit_breaker_threshold = 10;
    let gateway = test_gateway_with(provider);

    let err = fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap_err();

    assert!(
        matches!(err, GatewayError::ProviderUnavailable { attempts: 4, .. }),
        "unexpected error: {err:?}"
    );
    mock.assert_all().await;
}

#[tokio::test]
async fn test_not_found_is_not_retried_and_keeps_breaker_closed() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_status(&filings_path("ZZZZ"), 404, 1).await;
    let gateway = test_gateway(&mock.url());

    let err = fetch(&gateway, &mock.url(), "ZZZZ", TTL, FetchOptions::default()).await.unwrap_err();

    assert!(matches!(err, GatewayError::NotFound { .. }), "unexpected error: {err:?}");
    mock.assert_all().await;

    let state = gateway.provider_state(&Provider::new(PROVIDER)).unwrap();
    assert_eq!(state.breaker().get_failure_count().await, 0);
}

#[tokio::test]
async fn test_server_errors_fall_back_to_expired_value() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-01")]), 1).await;
    let gateway = test_gateway(&mock.url());

    let short = FetchOptions::default().stale_duration(Duration::from_millis(60));
    let first =
        fetch(&gateway, &mock.url(), "AAPL", Duration::from_millis(30), short).await.unwrap();
    assert_eq!(first.source, FetchSource::Api);

    // Past the stale window: a plain lookup misses, the entry is still held
    tokio::time::sleep(Duration::from_millis(120)).await;
    mock.reset().await;
    // One attempt plus two retries
    mock.mock_status(&filings_path("AAPL"), 503, 3).await;

    let fallback =
        fetch(&gateway, &mock.url(), "AAPL", Duration::from_millis(30), short).await.unwrap();

    assert_eq!(fallback.source, FetchSource::Stale);
    assert_eq!(fallback.data, first.data);
    assert_eq!(fallback.fetched_at, first.fetched_at);
    mock.assert_all().await;
}

#[tokio::test]
async fn test_server_errors_surface_when_fallback_disabled() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_status(&filings_path("AAPL"), 500, 3).await;
    let gateway = test_gateway(&mock.url());

    let err = fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default().fail_on_error())
        .await
        .unwrap_err();

    match err {
        GatewayError::Upstream { source, .. } => assert!(source.to_string().contains("500")),
        other => panic!("expected Upstream, got {other:?}"),
    }
}

#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let mut mock = ProviderMockBuilder::new().await;
    mock.mock_status(&filings_path("AAPL"), 500, 2).await;
    let mut provider = provider_config(&mock.url());
    provider.circuit_breaker_threshold = 2;
    let gateway = test_gateway_with(provider);

    // The second failure opens the breaker; the next retry is refused before any call
    let err = fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap_err();
    assert!(matches!(err, GatewayError::CircuitOpen { .. }), "unexpected error: {err:?}");

    let err = fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap_err();
    match err {
        GatewayError::CircuitOpen { remaining, .. } => assert!(remaining > Duration::ZERO),
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    mock.assert_all().await;
}

#[tokio::test]
async fn test_requests_carry_identifying_headers() {
    let mut mock = ProviderMockBuilder::new().await;
    let identified = mock
        .get_server()
        .mock("GET", filings_path("AAPL").as_str())
        .match_header("user-agent", Matcher::Regex(r"^sluice/\S+ \S+@\S+$".to_string()))
        .match_header("accept", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(filings_body(&[]).to_string())
        .create_async()
        .await;
    let gateway = test_gateway(&mock.url());

    fetch(&gateway, &mock.url(), "AAPL", TTL, FetchOptions::default()).await.unwrap();
    identified.assert_async().await;
}
