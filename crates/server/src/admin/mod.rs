//! Admin API.
//!
//! Operational endpoints served alongside the data API: gateway stats, cache invalidation and
//! the sync ledger. They share [`AppState`] with the data handlers.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

/// Creates the admin router. State is attached by the caller.
pub fn create_admin_router() -> Router<AppState> {
    Router::new()
        .route("/admin/stats", get(handlers::cache::get_stats))
        .route("/admin/cache/invalidate", post(handlers::cache::invalidate))
        .route("/admin/cache/purge", post(handlers::cache::purge_expired))
        .route("/admin/ledger", get(handlers::ledger::list_ledger))
        .route(
            "/admin/ledger/{provider}/{kind}/{entity}/log",
            get(handlers::ledger::get_refresh_log),
        )
}
