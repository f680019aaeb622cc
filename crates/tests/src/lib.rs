//! Integration tests for the sluice gateway.
//!
//! Every test runs against a mockito server standing in for a provider and, where durable
//! storage is involved, an in-memory `SQLite` store with the production schema.
//!
//! - `gateway_tests`: rate limiting, retries, `NotFound`, stale fallback, collapsing and the
//!   identifying header, end to end through the real HTTP client
//! - `sync_tests`: incremental sync from a JSON source into the store, ledger and refresh log
//! - `metrics_tests`: Prometheus rendering (process-global recorder, run serially)
//! - `mock_infrastructure`: reusable provider mocks and fixtures
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod gateway_tests;

#[cfg(test)]
mod sync_tests;

#[cfg(test)]
mod metrics_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
