//! Provider mock builder.
//!
//! Wraps mockito with the answers a public data provider gives: record listings, 429 with a
//! `Retry-After` header, 404 for unknown entities and server errors.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::Value;

/// Path the test filings source reads for `entity`.
#[must_use]
pub fn filings_path(entity: &str) -> String {
    format!("/submissions/{entity}/filings")
}

/// Builder for mock provider responses.
pub struct ProviderMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl ProviderMockBuilder {
    /// Creates a builder over a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    /// Base URL of the mock provider.
    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Answers every GET of `entity`'s filings with `body`, `hits` times.
    pub async fn mock_filings(&mut self, entity: &str, body: &Value, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("GET", filings_path(entity).as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Answers `entity`'s filings only when `since` carries `cursor`.
    pub async fn mock_filings_since(
        &mut self,
        entity: &str,
        cursor: &str,
        body: &Value,
    ) -> &mut Self {
        let mock = self
            .server
            .mock("GET", filings_path(entity).as_str())
            .match_query(Matcher::UrlEncoded("since".into(), cursor.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .expect(1)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Answers 429 with `Retry-After: retry_after_secs`, `hits` times.
    pub async fn mock_rate_limited(
        &mut self,
        path: &str,
        retry_after_secs: u64,
        hits: usize,
    ) -> &mut Self {
        let mock = self
            .server
            .mock("GET", path)
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", &retry_after_secs.to_string())
            .with_body("slow down")
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Answers `status` with a plain body, `hits` times.
    pub async fn mock_status(&mut self, path: &str, status: usize, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("GET", path)
            .match_query(Matcher::Any)
            .with_status(status)
            .with_body(format!("status {status}"))
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Returns the underlying mockito server for advanced mocking.
    pub fn get_server(&mut self) -> &mut ServerGuard {
        &mut self.server
    }

    /// Removes every registered mock, so later mocks answer alone.
    pub async fn reset(&mut self) {
        for mock in self.mocks.drain(..) {
            mock.remove_async().await;
        }
    }

    /// Asserts every registered mock saw its expected number of hits.
    pub async fn assert_all(&self) {
        for mock in &self.mocks {
            mock.assert_async().await;
        }
    }
}
