use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};

use super::{
    mapping::{first_present_string, FieldMapping},
    SourceConfig, SourceMethod,
};
use crate::{
    gateway::{Gateway, GatewayError},
    store::{EntityKind, PermanentRecord},
    sync::IncrementalSource,
    types::{CacheKey, FetchOptions, Fetched, Provider},
};

/// Generic adapter for providers answering JSON arrays of records.
pub struct JsonSource {
    config: SourceConfig,
    provider: Provider,
    base_url: String,
}

impl JsonSource {
    #[must_use]
    pub fn new(config: SourceConfig, base_url: &str) -> Self {
        Self {
            provider: Provider::new(&config.provider),
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn url(&self, entity: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(entity.as_bytes()).collect();
        format!("{}{}", self.base_url, self.config.path.replace("{entity}", &encoded))
    }

    fn params(&self, entity: &str, since: Option<&str>) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .config
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.replace("{entity}", entity)))
            .collect();
        if let (Some(name), Some(since)) = (&self.config.cursor_param, since) {
            params.push((name.clone(), since.to_string()));
        }
        params
    }

    /// Maps a response body into records, skipping items without a natural key and items
    /// strictly older than `since`.
    fn extract(&self, body: &Value, since: Option<&str>) -> Result<Vec<PermanentRecord>, GatewayError> {
        let items = body
            .pointer(&self.config.records_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                GatewayError::Decode(format!(
                    "{}: no record array at '{}'",
                    self.config.name, self.config.records_pointer
                ))
            })?;

        let mut records = Vec::with_capacity(items.len());
        let mut skipped = 0usize;
        for item in items {
            let Some(natural_key) = first_present_string(item, &self.config.natural_key) else {
                skipped += 1;
                continue;
            };
            let cursor = first_present_string(item, &self.config.cursor);
            if let (Some(cursor), Some(since)) = (cursor.as_deref(), since) {
                if cursor < since {
                    continue;
                }
            }

            records.push(PermanentRecord {
                natural_key,
                cursor,
                revision: first_present_string(item, &self.config.revision),
                payload: payload(&self.config.fields, item),
            });
        }

        if skipped > 0 {
            tracing::warn!(source = %self.config.name, skipped, "records without a natural key skipped");
        }
        Ok(records)
    }
}

fn payload(fields: &FieldMapping, item: &Value) -> Value {
    if fields.is_empty() {
        item.clone()
    } else {
        fields.apply(item)
    }
}

#[async_trait]
impl IncrementalSource for JsonSource {
    fn provider(&self) -> &Provider {
        &self.provider
    }

    fn kind(&self) -> EntityKind {
        self.config.kind
    }

    async fn fetch_since(
        &self,
        gateway: &Gateway,
        entity: &str,
        since: Option<&str>,
        ttl: Duration,
    ) -> Result<Vec<PermanentRecord>, GatewayError> {
        let url = self.url(entity);
        let params = self.params(entity, since);
        let timeout = gateway.provider_state(&self.provider)?.limits().request_timeout;

        let key_params: Vec<(&str, &str)> =
            params.iter().map(|(name, value)| (name.as_str(), value.as_str())).collect();
        let key = CacheKey::with_params(
            &self.provider,
            &format!("{}:{entity}", self.config.kind),
            &key_params,
        );

        let http = Arc::clone(gateway.http());
        let provider = self.provider.clone();
        let method = self.config.method;
        let params = Arc::new(params);

        let fetched: Fetched<Value> = gateway
            .cached_fetch(
                &self.provider,
                &key,
                move || {
                    let http = Arc::clone(&http);
                    let provider = provider.clone();
                    let url = url.clone();
                    let params = Arc::clone(&params);
                    async move {
                        match method {
                            SourceMethod::Get => {
                                http.get_json(&provider, &url, &params, timeout).await
                            }
                            SourceMethod::Post => {
                                let body: Map<String, Value> = params
                                    .iter()
                                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                                    .collect();
                                http.post_json(&provider, &url, &Value::Object(body), timeout).await
                            }
                        }
                    }
                },
                ttl,
                // Every sync asks the provider; a held value must not count as one
                FetchOptions::default().force_refresh().fail_on_error(),
            )
            .await?;

        tracing::debug!(
            source = %self.config.name,
            entity,
            origin = fetched.source.as_str(),
            "source response received"
        );
        self.extract(&fetched.data, since)
    }
}
