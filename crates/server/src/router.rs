use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sluice_core::{
    metrics::MetricsState,
    store::{EntityKey, EntityKind, StoreError},
    sync::{SyncError, SyncTrigger},
    upstream::CircuitBreakerState,
    GatewayError, Provider,
};

use crate::AppState;

/// Error body shared by every endpoint: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), retry_after_secs: None }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": { "code": self.code, "message": self.message } }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        let status = match &error {
            GatewayError::UnknownProvider(_) | GatewayError::NotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::CircuitOpen { .. } |
            GatewayError::ProviderUnavailable { .. } |
            GatewayError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { .. } | GatewayError::Decode(_) => StatusCode::BAD_GATEWAY,
        };
        let retry_after_secs = match &error {
            GatewayError::CircuitOpen { remaining, .. } => Some(remaining.as_secs().max(1)),
            _ => None,
        };
        Self {
            status,
            code: error.as_metric_str(),
            message: error.user_message(),
            retry_after_secs,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        tracing::error!(error = %error, "store error while serving request");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store", error.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::NoSource { .. } => {
                Self::new(StatusCode::NOT_FOUND, "no_source", error.to_string())
            }
            SyncError::Gateway(e) => e.into(),
            SyncError::Store(e) => e.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordsQuery {
    /// Required only when several providers serve the same kind.
    pub provider: Option<String>,
}

/// Resolves the entity addressed by `/v1/records/{kind}/{entity}`.
fn entity_key(
    state: &AppState,
    kind: &str,
    entity: String,
    provider: Option<String>,
) -> Result<EntityKey, ApiError> {
    let kind: EntityKind = kind.parse().map_err(|e: StoreError| ApiError::bad_request(e.to_string()))?;
    if entity.trim().is_empty() {
        return Err(ApiError::bad_request("entity cannot be empty"));
    }

    let provider = match provider {
        Some(name) => Provider::new(name),
        None => {
            let mut candidates =
                state.engine.sources().into_iter().filter(|(_, k)| *k == kind).map(|(p, _)| p);
            match (candidates.next(), candidates.next()) {
                (Some(provider), None) => provider,
                (None, _) => {
                    return Err(ApiError::new(
                        StatusCode::NOT_FOUND,
                        "no_source",
                        format!("no source registered for {kind}"),
                    ))
                }
                (Some(_), Some(_)) => {
                    return Err(ApiError::bad_request(format!(
                        "several providers serve {kind}; pass ?provider="
                    )))
                }
            }
        }
    };

    Ok(EntityKey::new(provider, kind, entity))
}

/// GET /v1/records/{kind}/{entity}
///
/// Serves durable rows. Syncs in the foreground when nothing is stored yet, in the background
/// when rows exist but are due. The `x-sync` header reports which happened.
pub async fn get_records(
    State(state): State<AppState>,
    Path((kind, entity)): Path<(String, String)>,
    Query(query): Query<RecordsQuery>,
) -> Result<Response, ApiError> {
    let key = entity_key(&state, &kind, entity, query.provider)?;
    let outcome = state.engine.read_or_sync(&key).await?;

    let trigger = match outcome.sync {
        SyncTrigger::None => "none",
        SyncTrigger::Background => "background",
        SyncTrigger::Foreground => "foreground",
    };
    Ok(([("x-sync", trigger)], Json(outcome)).into_response())
}

/// POST /v1/records/{kind}/{entity}/sync
pub async fn sync_records(
    State(state): State<AppState>,
    Path((kind, entity)): Path<(String, String)>,
    Query(query): Query<RecordsQuery>,
) -> Result<Response, ApiError> {
    let key = entity_key(&state, &kind, entity, query.provider)?;
    let report = state.engine.sync(&key).await?;
    Ok(Json(report).into_response())
}

#[allow(clippy::unused_async)]
pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(collector) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            collector.get_prometheus_metrics(),
        )
            .into_response(),
        None => ApiError::new(StatusCode::NOT_FOUND, "metrics_disabled", "metrics are disabled")
            .into_response(),
    }
}

/// GET /health
///
/// Healthy while every breaker is closed, degraded while some are not, unhealthy (503) when
/// every provider's breaker is open.
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.gateway().stats().await;
    let total = stats.providers.len();
    let open = stats
        .providers
        .iter()
        .filter(|p| p.breaker_state == CircuitBreakerState::Open)
        .count();
    let not_closed = stats
        .providers
        .iter()
        .filter(|p| p.breaker_state != CircuitBreakerState::Closed)
        .count();

    let (status, code) = if total > 0 && open == total {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if not_closed > 0 {
        ("degraded", StatusCode::OK)
    } else {
        ("healthy", StatusCode::OK)
    };

    let body = json!({
        "status": status,
        "providers": { "total": total, "open_breakers": open },
        "cache": { "entries": stats.cache.entries, "capacity": stats.cache.capacity },
        "in_flight": stats.in_flight,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (code, Json(body))
}
