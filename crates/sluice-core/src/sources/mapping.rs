//! Explicit field precedence for normalizing provider records.
//!
//! Providers often report the same fact under several names (`/Revenues`,
//! `/SalesRevenueNet`, ...). A [`FieldMapping`] lists, per normalized field, the JSON pointers to
//! try in order; the first non-null value wins and an absent field becomes `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One normalized field and its candidate source pointers, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    #[serde(rename = "from")]
    pub sources: Vec<String>,
}

/// Ordered `(normalized_field, [source pointers])` rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(Vec<FieldRule>);

/// First non-null value among `pointers` in `item`.
#[must_use]
pub fn first_present<'a>(item: &'a Value, pointers: &[String]) -> Option<&'a Value> {
    pointers.iter().filter_map(|pointer| item.pointer(pointer)).find(|value| !value.is_null())
}

/// Like [`first_present`], rendered as a string key. Objects and arrays are not keys.
#[must_use]
pub fn first_present_string(item: &Value, pointers: &[String]) -> Option<String> {
    match first_present(item, pointers)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Checks that `pointer` is a JSON pointer (`""` or starting with `/`).
///
/// # Errors
/// Returns a description of the malformed pointer.
pub fn validate_pointer(pointer: &str) -> Result<(), String> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(format!("'{pointer}' is not a JSON pointer (expected a leading '/')"))
    }
}

impl FieldMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule. Earlier `sources` take precedence.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>, sources: &[&str]) -> Self {
        self.0.push(FieldRule {
            field: field.into(),
            sources: sources.iter().map(|s| (*s).to_string()).collect(),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn rules(&self) -> &[FieldRule] {
        &self.0
    }

    /// Value of one normalized field for `item`.
    #[must_use]
    pub fn resolve<'a>(&self, field: &str, item: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .find(|rule| rule.field == field)
            .and_then(|rule| first_present(item, &rule.sources))
    }

    /// Builds the normalized object for `item`: every mapped field, `null` when absent.
    #[must_use]
    pub fn apply(&self, item: &Value) -> Value {
        let mut normalized = Map::with_capacity(self.0.len());
        for rule in &self.0 {
            let value = first_present(item, &rule.sources).cloned().unwrap_or(Value::Null);
            normalized.insert(rule.field.clone(), value);
        }
        Value::Object(normalized)
    }

    /// # Errors
    /// Returns a description of the first empty field name, empty rule or malformed pointer.
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.0 {
            if rule.field.is_empty() {
                return Err("mapped field name is empty".to_string());
            }
            if rule.sources.is_empty() {
                return Err(format!("field '{}' has no sources", rule.field));
            }
            for pointer in &rule.sources {
                validate_pointer(pointer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revenue() -> FieldMapping {
        FieldMapping::new()
            .field("revenue", &["/Revenues", "/SalesRevenueNet", "/RevenueFromContracts"])
            .field("period", &["/end"])
    }

    #[test]
    fn test_first_non_null_source_wins() {
        let item = json!({ "Revenues": null, "SalesRevenueNet": 120, "RevenueFromContracts": 130 });
        assert_eq!(revenue().resolve("revenue", &item), Some(&json!(120)));
    }

    #[test]
    fn test_precedence_is_declaration_order_not_document_order() {
        let item = json!({ "RevenueFromContracts": 130, "Revenues": 100 });
        assert_eq!(revenue().resolve("revenue", &item), Some(&json!(100)));
    }

    #[test]
    fn test_apply_fills_absent_fields_with_null() {
        let item = json!({ "SalesRevenueNet": 5, "unrelated": true });
        assert_eq!(revenue().apply(&item), json!({ "revenue": 5, "period": null }));
    }

    #[test]
    fn test_nested_pointers_and_string_keys() {
        let item = json!({ "filing": { "uuid": "abc-123" }, "id": 42 });
        let by_uuid = vec!["/filing/uuid".to_string(), "/id".to_string()];
        let by_id = vec!["/missing".to_string(), "/id".to_string()];
        assert_eq!(first_present_string(&item, &by_uuid).as_deref(), Some("abc-123"));
        assert_eq!(first_present_string(&item, &by_id).as_deref(), Some("42"));
        assert_eq!(first_present_string(&item, &["/filing".to_string()]), None);
    }

    #[test]
    fn test_validate() {
        assert!(revenue().validate().is_ok());
        assert!(FieldMapping::new().field("x", &["Revenues"]).validate().is_err());
        assert!(FieldMapping::new().field("x", &[]).validate().is_err());
    }

    #[test]
    fn test_deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            fields: FieldMapping,
        }
        let wrapper: Wrapper = toml::from_str(
            r#"
            [[fields]]
            field = "revenue"
            from = ["/Revenues", "/SalesRevenueNet"]
            "#,
        )
        .unwrap();
        assert_eq!(wrapper.fields, FieldMapping::new().field("revenue", &["/Revenues", "/SalesRevenueNet"]));
    }
}
