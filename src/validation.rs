//! ALFA Session Guard - Request Validation
//!
//! Runs before any crypto or network work. Rejects path traversal,
//! restricted endpoints and privilege-escalation parameters.

use std::collections::HashSet;

use serde_json::Value;

use crate::config::RequestConfig;
use crate::error::{GuardError, GuardResult};

/// Encoded forms of `.`, `/`, `\` and NUL
const ENCODED_TRAVERSAL: [&str; 4] = ["%2e", "%2f", "%5c", "%00"];

#[derive(Debug, Clone)]
pub struct RequestValidator {
    restricted_paths: Vec<String>,
    denied_keys: HashSet<String>,
    max_depth: usize,
}

impl RequestValidator {
    pub fn new(config: &RequestConfig) -> Self {
        Self {
            restricted_paths: config
                .restricted_paths
                .iter()
                .map(|p| p.trim_end_matches('/').to_ascii_lowercase())
                .collect(),
            denied_keys: config
                .denied_param_keys
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
            max_depth: config.max_param_depth,
        }
    }

    /// Validate path, query params and JSON body of one call
    pub fn validate(&self, path: &str, params: Option<&Value>, body: Option<&Value>) -> GuardResult<()> {
        self.validate_path(path)?;
        if let Some(params) = params {
            self.validate_value(params, 0)?;
        }
        if let Some(body) = body {
            self.validate_value(body, 0)?;
        }
        Ok(())
    }

    pub fn validate_path(&self, path: &str) -> GuardResult<()> {
        if !path.starts_with('/') {
            return Err(reject("path must be absolute"));
        }

        let lower = path.to_ascii_lowercase();
        if lower.contains("..") || lower.contains('\\') || lower.contains('\0') {
            return Err(reject("path traversal"));
        }
        if ENCODED_TRAVERSAL.iter().any(|enc| lower.contains(enc)) {
            return Err(reject("encoded traversal sequence"));
        }
        if lower.contains("//") {
            return Err(reject("empty path segment"));
        }

        let route = lower.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
        let route = route.trim_end_matches('/');
        for restricted in &self.restricted_paths {
            let hit = route == restricted
                || route
                    .strip_prefix(restricted.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if hit {
                return Err(reject(format!("restricted endpoint {}", restricted)));
            }
        }

        Ok(())
    }

    fn validate_value(&self, value: &Value, depth: usize) -> GuardResult<()> {
        if depth > self.max_depth {
            return Err(reject("parameters nested too deeply"));
        }

        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    if self.denied_keys.contains(&key.to_ascii_lowercase()) {
                        return Err(reject(format!("forbidden parameter {}", key)));
                    }
                    self.validate_value(nested, depth + 1)?;
                }
                Ok(())
            }
            Value::Array(items) => items
                .iter()
                .try_for_each(|item| self.validate_value(item, depth + 1)),
            _ => Ok(()),
        }
    }
}

fn reject(reason: impl Into<String>) -> GuardError {
    let reason = reason.into();
    tracing::warn!(target: "security", reason = %reason, "request failed validation");
    GuardError::ValidationRejected(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> RequestValidator {
        RequestValidator::new(&RequestConfig::default())
    }

    #[test]
    fn test_traversal_rejected() {
        let v = validator();
        for path in [
            "/photos/../admin",
            "/photos/%2E%2E/secret",
            "/photos\\..\\x",
            "/photos//x",
            "/photos/%00",
            "photos",
        ] {
            assert!(
                matches!(v.validate_path(path), Err(GuardError::ValidationRejected(_))),
                "{} accepted",
                path
            );
        }
    }

    #[test]
    fn test_restricted_prefixes() {
        let v = validator();
        assert!(v.validate_path("/admin").is_err());
        assert!(v.validate_path("/Admin/users?x=1").is_err());
        assert!(v.validate_path("/internal/").is_err());
        // Only whole segments match
        assert!(v.validate_path("/administrators-guide").is_ok());
        assert!(v.validate_path("/photos/42?size=thumb").is_ok());
    }

    #[test]
    fn test_denied_keys_recursive_case_insensitive() {
        let v = validator();
        let body = json!({"album": {"meta": [{"IsAdmin": true}]}});
        assert!(v.validate("/albums", None, Some(&body)).is_err());

        let params = json!({"__proto__": {"x": 1}});
        assert!(v.validate("/albums", Some(&params), None).is_err());

        let ok = json!({"title": "Holiday", "tags": ["sea"]});
        assert!(v.validate("/albums", Some(&ok), Some(&ok)).is_ok());
    }

    #[test]
    fn test_depth_limit() {
        let v = validator();
        let mut value = json!(1);
        for _ in 0..12 {
            value = json!({ "n": value });
        }
        assert!(v.validate("/albums", None, Some(&value)).is_err());
    }
}
