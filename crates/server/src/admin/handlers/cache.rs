//! Cache and gateway stats handlers.

#![allow(clippy::missing_errors_doc)]

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use sluice_core::{gateway::GatewayStats, CacheKey, Provider};

use crate::{router::ApiError, AppState};

/// Body of `POST /admin/cache/invalidate`.
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub provider: String,
    /// A full cache key (`provider:entity[:params]`). Omitted: every key of the provider.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub removed: usize,
}

/// GET /admin/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<GatewayStats> {
    Json(state.gateway().stats().await)
}

/// POST /admin/cache/invalidate
pub async fn invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<RemovedResponse>, ApiError> {
    let provider = Provider::new(&request.provider);
    state.gateway().provider_state(&provider)?;

    let removed = match request.key {
        Some(raw) => {
            let key = CacheKey::from_raw(raw);
            if !key.belongs_to(&provider) {
                return Err(ApiError::bad_request(format!(
                    "key {key} does not belong to provider {provider}"
                )));
            }
            usize::from(state.gateway().invalidate(&key))
        }
        None => state.gateway().invalidate_provider(&provider),
    };

    tracing::info!(provider = %provider, removed, "cache invalidated via admin");
    Ok(Json(RemovedResponse { removed }))
}

/// POST /admin/cache/purge
pub async fn purge_expired(State(state): State<AppState>) -> Json<RemovedResponse> {
    Json(RemovedResponse { removed: state.gateway().purge_expired() })
}
