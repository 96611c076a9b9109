//! Deterministic hashing of PII and UUID values.
//!
//! Hashes are salted SHA-256 so the same input maps to the same output across
//! queries, which keeps sanitized rows joinable.

use crate::config::SanitizeConfig;
use crate::domain::model::QueryResult;
use crate::utils::error::{Result, StolonError};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::OnceLock;
use uuid::Uuid;

/// Prefix that marks a hashed PII value.
pub const HASH_PREFIX: &str = "h_";

fn uuid_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("valid uuid regex")
    })
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    salt: String,
    columns: HashSet<String>,
    patterns: Vec<Regex>,
    hash_uuids: bool,
}

impl Sanitizer {
    pub fn from_config(config: &SanitizeConfig) -> Result<Self> {
        let patterns = config
            .pii_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| StolonError::InvalidConfigValueError {
                    field: "sanitize.pii_patterns".to_string(),
                    value: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            salt: config.salt.clone(),
            columns: config
                .pii_columns
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            patterns,
            hash_uuids: config.hash_uuids,
        })
    }

    pub fn is_pii_column(&self, column: &str) -> bool {
        self.columns.contains(&column.to_ascii_lowercase())
            || self.patterns.iter().any(|p| p.is_match(column))
    }

    fn digest(&self, value: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.finalize().into()
    }

    pub fn hash_text(&self, value: &str) -> String {
        let digest = self.digest(value);
        format!("{}{}", HASH_PREFIX, &hex::encode(digest)[..16])
    }

    /// Maps a UUID onto another UUID so the value keeps its shape.
    pub fn hash_uuid(&self, value: &str) -> String {
        let digest = self.digest(&value.to_ascii_lowercase());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes).to_string()
    }

    fn is_uuid(value: &str) -> bool {
        uuid_regex().is_match(value)
    }

    /// Sanitizes one value given the column or key it belongs to.
    pub fn sanitize_value(&self, column: Option<&str>, value: &Value) -> Value {
        let pii = column.map(|c| self.is_pii_column(c)).unwrap_or(false);

        match value {
            Value::Null => Value::Null,
            Value::String(s) if self.hash_uuids && Self::is_uuid(s) => {
                Value::String(self.hash_uuid(s))
            }
            Value::String(s) if pii => Value::String(self.hash_text(s)),
            Value::Number(n) if pii => Value::String(self.hash_text(&n.to_string())),
            Value::Bool(b) if pii => Value::String(self.hash_text(&b.to_string())),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| {
                        if pii {
                            self.sanitize_pii(item)
                        } else {
                            self.sanitize_value(None, item)
                        }
                    })
                    .collect(),
            ),
            Value::Object(map) => {
                if pii {
                    self.sanitize_pii(value)
                } else {
                    Value::Object(
                        map.iter()
                            .map(|(k, v)| (k.clone(), self.sanitize_value(Some(k), v)))
                            .collect(),
                    )
                }
            }
            other => other.clone(),
        }
    }

    /// Everything under a PII key is hashed, nested or not.
    fn sanitize_pii(&self, value: &Value) -> Value {
        match value {
            Value::Null => Value::Null,
            Value::String(s) if self.hash_uuids && Self::is_uuid(s) => {
                Value::String(self.hash_uuid(s))
            }
            Value::String(s) => Value::String(self.hash_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|i| self.sanitize_pii(i)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize_pii(v)))
                    .collect(),
            ),
            other => Value::String(self.hash_text(&other.to_string())),
        }
    }

    /// Sanitizes arbitrary JSON, deciding PII by object key.
    pub fn sanitize_json(&self, value: &Value) -> Value {
        self.sanitize_value(None, value)
    }

    pub fn sanitize_result(&self, mut result: QueryResult) -> QueryResult {
        let pii_columns: Vec<bool> = result
            .columns
            .iter()
            .map(|c| self.is_pii_column(c))
            .collect();

        for row in &mut result.rows {
            for (i, cell) in row.iter_mut().enumerate() {
                let column = result.columns.get(i).map(String::as_str);
                *cell = if pii_columns.get(i).copied().unwrap_or(false) {
                    self.sanitize_pii(cell)
                } else {
                    self.sanitize_value(column, cell)
                };
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitizer() -> Sanitizer {
        Sanitizer::from_config(&SanitizeConfig {
            salt: "test-salt".to_string(),
            pii_columns: vec!["email".to_string(), "Last_Name".to_string()],
            pii_patterns: vec!["(?i)_phone$".to_string()],
            hash_uuids: true,
        })
        .unwrap()
    }

    #[test]
    fn test_pii_column_matching() {
        let s = sanitizer();
        assert!(s.is_pii_column("EMAIL"));
        assert!(s.is_pii_column("last_name"));
        assert!(s.is_pii_column("home_phone"));
        assert!(!s.is_pii_column("status"));
    }

    #[test]
    fn test_hash_is_deterministic_and_salted() {
        let s = sanitizer();
        let a = s.hash_text("jane@example.com");
        assert_eq!(a, s.hash_text("jane@example.com"));
        assert!(a.starts_with(HASH_PREFIX));
        assert_eq!(a.len(), HASH_PREFIX.len() + 16);

        let other = Sanitizer::from_config(&SanitizeConfig {
            salt: "another".to_string(),
            ..SanitizeConfig::default()
        })
        .unwrap();
        assert_ne!(a, other.hash_text("jane@example.com"));
    }

    #[test]
    fn test_uuid_keeps_shape_and_ignores_case() {
        let s = sanitizer();
        let id = "3F2504E0-4F89-11D3-9A0C-0305E82C3301";
        let hashed = s.hash_uuid(id);
        assert!(Uuid::parse_str(&hashed).is_ok());
        assert_ne!(hashed.to_ascii_lowercase(), id.to_ascii_lowercase());
        assert_eq!(hashed, s.hash_uuid(&id.to_ascii_lowercase()));
    }

    #[test]
    fn test_sanitize_result() {
        let s = sanitizer();
        let result = QueryResult::new(
            vec![
                "id".to_string(),
                "email".to_string(),
                "account_id".to_string(),
                "status".to_string(),
            ],
            vec![
                vec![
                    json!(7),
                    json!("jane@example.com"),
                    json!("3f2504e0-4f89-11d3-9a0c-0305e82c3301"),
                    json!("active"),
                ],
                vec![json!(8), Value::Null, Value::Null, json!("closed")],
            ],
            false,
        );

        let clean = s.sanitize_result(result);
        assert_eq!(clean.rows[0][0], json!(7));
        assert_eq!(clean.rows[0][1], json!(s.hash_text("jane@example.com")));
        assert_eq!(
            clean.rows[0][2],
            json!(s.hash_uuid("3f2504e0-4f89-11d3-9a0c-0305e82c3301"))
        );
        assert_eq!(clean.rows[0][3], json!("active"));
        assert_eq!(clean.rows[1][1], Value::Null);
    }

    #[test]
    fn test_sanitize_nested_json() {
        let s = sanitizer();
        let body = json!({
            "data": [
                {"email": "a@example.com", "plan": "pro", "last_name": {"value": "Smith"}},
                {"work_phone": 5551234, "plan": "free"}
            ]
        });

        let clean = s.sanitize_json(&body);
        assert_eq!(clean["data"][0]["email"], json!(s.hash_text("a@example.com")));
        assert_eq!(clean["data"][0]["plan"], json!("pro"));
        assert_eq!(clean["data"][0]["last_name"]["value"], json!(s.hash_text("Smith")));
        assert_eq!(clean["data"][1]["work_phone"], json!(s.hash_text("5551234")));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = SanitizeConfig {
            pii_patterns: vec!["([".to_string()],
            ..SanitizeConfig::default()
        };
        assert!(Sanitizer::from_config(&config).is_err());
    }
}
