//! Mock infrastructure for testing the sluice gateway.
//!
//! ## Components
//!
//! - `ProviderMockBuilder`: wraps mockito with helpers for provider answers (records, 429 with
//!   `Retry-After`, arbitrary statuses)
//! - Test helpers for gateways, sources and stores wired to a mock
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::{filings_body, ProviderMockBuilder};
//!
//! let mut mock = ProviderMockBuilder::new().await;
//! mock.mock_filings("AAPL", &filings_body(&[("0001", "2024-01-01")]), 1).await;
//!
//! // Use mock.url() as the provider base URL
//! ```

pub mod provider_mock;
pub mod test_helpers;

pub use provider_mock::{filings_path, ProviderMockBuilder};
pub use test_helpers::*;
