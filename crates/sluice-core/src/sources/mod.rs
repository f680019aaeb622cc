//! Thin provider adapters feeding the durable store.
//!
//! Each adapter supplies only what is specific to a provider: where to fetch, how to ask for
//! records newer than a cursor, and how to map the response into [`PermanentRecord`]s. Pacing,
//! caching, collapsing, retries and breaking all happen in the [`Gateway`] it calls through.
//!
//! [`PermanentRecord`]: crate::store::PermanentRecord
//! [`Gateway`]: crate::gateway::Gateway

pub mod json;
pub mod mapping;

pub use json::JsonSource;
pub use mapping::{FieldMapping, FieldRule};

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::{AppConfig, ConfigValidationError},
    store::EntityKind,
    sync::{IncrementalSource, TtlPolicy, TtlPolicyConfig},
};

/// Request style of a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMethod {
    /// GET with query parameters.
    #[default]
    Get,
    /// Read-style POST with a JSON filter body.
    Post,
}

/// A configured JSON source.
///
/// ```toml
/// [[sources]]
/// name = "edgar-filings"
/// provider = "edgar"
/// kind = "filing"
/// path = "/submissions/{entity}/filings"
/// records = "/filings"
/// cursor_param = "since"
/// natural_key = ["/accessionNumber"]
/// cursor = ["/filingDate"]
///
/// [sources.ttl]
/// type = "fixed"
/// preset = "filings"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Name of a configured provider.
    pub provider: String,

    pub kind: EntityKind,

    #[serde(default)]
    pub method: SourceMethod,

    /// Appended to the provider's base URL. `{entity}` is replaced by the URL-encoded entity.
    pub path: String,

    /// Fixed query parameters (GET) or body fields (POST). Values may contain `{entity}`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// JSON pointer to the array of records in the response. Empty: the body is the array.
    #[serde(default, rename = "records")]
    pub records_pointer: String,

    /// Parameter carrying the latest stored cursor. Without it every sync fetches everything
    /// and older records are filtered locally.
    #[serde(default)]
    pub cursor_param: Option<String>,

    /// Pointers to the natural key, first non-null wins.
    pub natural_key: Vec<String>,

    #[serde(default)]
    pub cursor: Vec<String>,

    #[serde(default)]
    pub revision: Vec<String>,

    /// Normalized payload fields. Empty: the raw record is stored.
    #[serde(default)]
    pub fields: FieldMapping,

    #[serde(default)]
    pub ttl: TtlPolicyConfig,
}

impl SourceConfig {
    fn invalid(&self, reason: impl Into<String>) -> ConfigValidationError {
        ConfigValidationError::InvalidSource { source_name: self.name.clone(), reason: reason.into() }
    }

    /// # Errors
    /// Returns [`ConfigValidationError::InvalidSource`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name cannot be empty"));
        }
        if !self.path.starts_with('/') {
            return Err(self.invalid("path must start with '/'"));
        }
        if self.natural_key.is_empty() {
            return Err(self.invalid("natural_key needs at least one pointer"));
        }
        if self.cursor_param.as_deref().is_some_and(str::is_empty) {
            return Err(self.invalid("cursor_param cannot be empty"));
        }

        mapping::validate_pointer(&self.records_pointer).map_err(|e| self.invalid(e))?;
        for pointer in self.natural_key.iter().chain(&self.cursor).chain(&self.revision) {
            mapping::validate_pointer(pointer).map_err(|e| self.invalid(e))?;
        }
        self.fields.validate().map_err(|e| self.invalid(e))
    }
}

/// Builds every configured source with its TTL policy.
///
/// # Errors
/// Returns [`ConfigValidationError`] if a source references an unknown provider or its TTL
/// policy is invalid.
pub fn build_sources(
    config: &AppConfig,
) -> Result<Vec<(Arc<dyn IncrementalSource>, Arc<dyn TtlPolicy>)>, ConfigValidationError> {
    config
        .sources
        .iter()
        .map(|source| {
            let provider = config.provider(&source.provider).ok_or_else(|| {
                ConfigValidationError::UnknownSourceProvider {
                    source_name: source.name.clone(),
                    provider: source.provider.clone(),
                }
            })?;
            let policy = source.ttl.build(&config.ttl_presets)?;
            let adapter: Arc<dyn IncrementalSource> =
                Arc::new(JsonSource::new(source.clone(), &provider.base_url));
            Ok((adapter, policy))
        })
        .collect()
}
