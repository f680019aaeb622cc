//! Sync ledger handlers.

#![allow(clippy::missing_errors_doc)]

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use sluice_core::store::{EntityKey, EntityKind, RefreshLogEntry, StoreError, SyncLedgerRecord};

use crate::{router::ApiError, AppState};

const DEFAULT_LOG_LIMIT: u32 = 50;
const MAX_LOG_LIMIT: u32 = 1_000;

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<u32>,
}

/// GET /admin/ledger
pub async fn list_ledger(
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncLedgerRecord>>, ApiError> {
    Ok(Json(state.store.list_ledger().await?))
}

/// GET /admin/ledger/{provider}/{kind}/{entity}/log
pub async fn get_refresh_log(
    State(state): State<AppState>,
    Path((provider, kind, entity)): Path<(String, String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<RefreshLogEntry>>, ApiError> {
    let kind: EntityKind =
        kind.parse().map_err(|e: StoreError| ApiError::bad_request(e.to_string()))?;
    let key = EntityKey::new(provider, kind, entity);
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);

    Ok(Json(state.store.refresh_log(&key, limit).await?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::{create_app, test_support};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_ledger_starts_empty() {
        let app = create_app(test_support::state("http://127.0.0.1:1").await);
        let (status, body) = call(app, "GET", "/admin/ledger").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn test_failed_and_successful_syncs_are_logged() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/submissions/AAPL/filings")
            .with_status(400)
            .with_body("bad ticker")
            .create_async()
            .await;

        let state = test_support::state(&server.url()).await;
        let (status, _) =
            call(create_app(state.clone()), "POST", "/v1/records/filing/AAPL/sync").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        failing.remove_async().await;

        server
            .mock("GET", "/submissions/AAPL/filings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"filings":[{"accessionNumber":"0001","filingDate":"2024-01-01"}]}"#)
            .create_async()
            .await;
        let (status, _) =
            call(create_app(state.clone()), "POST", "/v1/records/filing/AAPL/sync").await;
        assert_eq!(status, StatusCode::OK);

        let (_, ledger) = call(create_app(state.clone()), "GET", "/admin/ledger").await;
        assert_eq!(ledger.as_array().unwrap().len(), 1);
        assert_eq!(ledger[0]["status"], "success");
        assert_eq!(ledger[0]["item_count"], 1);

        let (status, log) =
            call(create_app(state), "GET", "/admin/ledger/edgar/filing/AAPL/log?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        let log = log.as_array().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0]["status"], "success");
        assert_eq!(log[1]["status"], "failed");
    }

    #[tokio::test]
    async fn test_refresh_log_rejects_unknown_kind() {
        let app = create_app(test_support::state("http://127.0.0.1:1").await);
        let (status, _) = call(app, "GET", "/admin/ledger/edgar/weather/AAPL/log").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
