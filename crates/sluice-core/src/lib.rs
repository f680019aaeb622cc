//! # Sluice Core
//!
//! Core library for the Sluice gateway to rate-limited public data providers (filing
//! registries, lobbying and spending registries, pricing feeds).
//!
//! This crate provides:
//!
//! - **[`upstream`]**: per-provider throttle and circuit breaker, the provider registry, and the
//!   outbound HTTP client.
//!
//! - **[`cache`]**: bounded in-process cache with fresh/stale/expired lifetimes and the request
//!   collapser that shares one outbound call among concurrent identical requests.
//!
//! - **[`gateway`]**: `cached_fetch` orchestration, retry policy, stale fallback and stats.
//!
//! - **[`store`]**: durable `SQLite` storage for records, the sync ledger and the refresh log.
//!
//! - **[`sync`]**: TTL policies and the incremental sync engine.
//!
//! - **[`sources`]**: thin provider adapters and explicit field precedence.
//!
//! - **[`config`]** / **[`metrics`]**: layered configuration and Prometheus metrics.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SyncEngine                          │
//! │   read_or_sync ── SyncLedger (TtlPolicy) ── RecordStore      │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ IncrementalSource::fetch_since
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │                            Gateway                           │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │ InProcessCache │  │ RequestCollapser │  │ RetryPolicy  │  │
//! │  └────────────────┘  └──────────────────┘  └──────────────┘  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ ProviderRegistry: per provider Throttle + Breaker      │  │
//! │  └────────────────────────────┬───────────────────────────┘  │
//! └───────────────────────────────┼──────────────────────────────┘
//!                                 ▼
//!                            HttpClient
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! cached_fetch(provider, key, fetch, ttl)
//!       │
//!       ▼
//! ┌─────────────┐
//! │ Cache Check │ ── Fresh ──► cache
//! └──────┬──────┘ ── Stale ──► stale (+ background refresh)
//!        │ Miss
//!        ▼
//! ┌─────────────┐
//! │  Collapser  │ ── In flight ──► deduplicated
//! └──────┬──────┘
//!        │ Leader
//!        ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Throttle   │ ──► │   Breaker   │ ──► │  fetch()    │ ── retry on 429 / timeout / 5xx
//! └─────────────┘     └─────────────┘     └──────┬──────┘
//!                                                │
//!                                  ok ──► Cache Insert ──► api
//!                                  err ─► held value? ──► stale, else typed error
//! ```

pub mod cache;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod sources;
pub mod store;
pub mod sync;
pub mod types;
pub mod upstream;

pub use gateway::{Gateway, GatewayBuilder, GatewayError};
pub use types::{CacheKey, FetchOptions, FetchSource, Fetched, Provider};
