//! HTTP surface and process wiring for the sluice gateway.
//!
//! - [`router`]: data reads (`/v1/records`), liveness and Prometheus metrics
//! - [`admin`]: gateway stats, cache invalidation, sync ledger inspection
//! - [`middleware`]: request correlation IDs

pub mod admin;
pub mod middleware;
pub mod router;

use std::{sync::Arc, time::Instant};

use axum::{
    http::Request,
    routing::{get, post},
    Router,
};
use sluice_core::{
    config::AppConfig, metrics::MetricsCollector, store::RecordStore, sync::SyncEngine, Gateway,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
    pub store: Arc<dyn RecordStore>,
    /// `None` when metrics are disabled; `/metrics` then answers 404.
    pub metrics: Option<MetricsCollector>,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(
        engine: SyncEngine,
        store: Arc<dyn RecordStore>,
        metrics: Option<MetricsCollector>,
    ) -> Self {
        Self { engine, store, metrics, start_time: Instant::now() }
    }

    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        self.engine.gateway()
    }
}

/// Builds the full application router.
pub fn create_app(state: AppState) -> Router {
    let (set_request_id, propagate_request_id) = middleware::create_request_id_layers();

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        tracing::info_span!(
            "http",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = middleware::correlation_id::request_id(request).unwrap_or("-"),
        )
    });

    Router::new()
        .route("/health", get(router::handle_health))
        .route("/metrics", get(router::handle_metrics))
        .route("/v1/records/{kind}/{entity}", get(router::get_records))
        .route("/v1/records/{kind}/{entity}/sync", post(router::sync_records))
        .merge(admin::create_admin_router())
        .with_state(state)
        .layer(trace)
        .layer(propagate_request_id)
        .layer(set_request_id)
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; `debug` and `trace` are shorthands that raise only the sluice
/// crates. The output format follows `logging.format`.
pub fn init_logging(config: &AppConfig) {
    let filter = match std::env::var("RUST_LOG").as_deref() {
        Ok("debug") => EnvFilter::new("warn,sluice_core=debug,server=debug,tower_http=debug"),
        Ok("trace") => EnvFilter::new("warn,sluice_core=trace,server=trace,tower_http=trace"),
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.logging.level))),
        Err(_) => EnvFilter::new(default_filter(&config.logging.level)),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

fn default_filter(level: &str) -> String {
    format!("warn,sluice_core={level},server={level}")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use sluice_core::{
        config::ProviderConfig,
        sources::{FieldMapping, JsonSource, SourceConfig, SourceMethod},
        store::{EntityKind, SqliteStore},
        sync::{FixedTtl, TtlPolicyConfig},
    };
    use std::{collections::BTreeMap, time::Duration};

    pub(crate) fn filings_source(provider: &str) -> SourceConfig {
        SourceConfig {
            name: format!("{provider}-filings"),
            provider: provider.to_string(),
            kind: EntityKind::Filing,
            method: SourceMethod::Get,
            path: "/submissions/{entity}/filings".into(),
            params: BTreeMap::new(),
            records_pointer: "/filings".into(),
            cursor_param: Some("since".into()),
            natural_key: vec!["/accessionNumber".into()],
            cursor: vec!["/filingDate".into()],
            revision: Vec::new(),
            fields: FieldMapping::new(),
            ttl: TtlPolicyConfig::default(),
        }
    }

    /// App state over an in-memory store with one `edgar` filings source at `base_url`.
    pub(crate) async fn state(base_url: &str) -> AppState {
        let gateway = Gateway::builder()
            .provider(ProviderConfig::new("edgar", base_url, 10, 1_000, 0))
            .provider(ProviderConfig::new("lda", base_url, 10, 1_000, 0))
            .build()
            .expect("gateway");
        let store: Arc<dyn RecordStore> =
            Arc::new(SqliteStore::connect_and_migrate("sqlite::memory:").await.expect("store"));
        let engine = SyncEngine::new(gateway, Arc::clone(&store), Duration::from_secs(300))
            .with_source(
                Arc::new(JsonSource::new(filings_source("edgar"), base_url)),
                Arc::new(FixedTtl(Duration::from_secs(3_600))),
            );
        AppState::new(engine, store, None)
    }
}
