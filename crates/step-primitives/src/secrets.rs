//! Secret substitution at executor-invocation time.
//!
//! `{{secret:NAME}}` tokens are resolved through a provider only for
//! the single step being invoked. The raw values returned here must be
//! masked before any snapshot enters the memory recorder.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::errors::StepError;

static SECRET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*secret:([A-Za-z0-9_\-]+)\s*\}\}").expect("secret regex"));

/// Supplies credential values for substitution into configuration.
pub trait SecretProvider: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Provider that reads the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed map of secrets, for tests and embedded use.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretProvider {
    inner: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.insert(name.into(), value.into());
        self
    }
}

impl SecretProvider for StaticSecretProvider {
    fn resolve(&self, name: &str) -> Option<String> {
        self.inner.get(name).cloned()
    }
}

/// Provider for workflows that use no credentials.
#[derive(Debug, Default, Clone)]
pub struct NoSecrets;

impl SecretProvider for NoSecrets {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Substitute every `{{secret:NAME}}` token in a resolved config.
///
/// Returns the invocable configuration plus the list of raw secret
/// values used, so callers can mask them out of provenance snapshots.
pub fn substitute_secrets(
    config: &Value,
    provider: &dyn SecretProvider,
) -> Result<(Value, Vec<String>), StepError> {
    let mut used = Vec::new();
    let resolved = walk(config, provider, &mut used)?;
    Ok((resolved, used))
}

fn walk(
    value: &Value,
    provider: &dyn SecretProvider,
    used: &mut Vec<String>,
) -> Result<Value, StepError> {
    match value {
        Value::String(s) => {
            if !SECRET_RE.is_match(s) {
                return Ok(value.clone());
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in SECRET_RE.captures_iter(s) {
                let whole = caps.get(0).expect("regex match");
                let name = caps.get(1).expect("name group").as_str();
                let secret = provider.resolve(name).ok_or_else(|| {
                    StepError::Configuration(format!("secret '{name}' is not available"))
                })?;
                out.push_str(&s[last..whole.start()]);
                out.push_str(&secret);
                if !used.contains(&secret) {
                    used.push(secret);
                }
                last = whole.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(walk(item, provider, used)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), walk(item, provider, used)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_and_reports_raw_values() {
        let provider = StaticSecretProvider::new().with_secret("MAIL_TOKEN", "tok-9");
        let config = json!({"header": "Bearer {{secret:MAIL_TOKEN}}", "plain": "x"});
        let (resolved, used) = substitute_secrets(&config, &provider).unwrap();
        assert_eq!(resolved, json!({"header": "Bearer tok-9", "plain": "x"}));
        assert_eq!(used, vec!["tok-9".to_string()]);
    }

    #[test]
    fn missing_secret_is_a_configuration_error() {
        let config = json!({"header": "{{secret:NOPE}}"});
        let err = substitute_secrets(&config, &NoSecrets).unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
    }

    #[test]
    fn untokenized_config_passes_through() {
        let config = json!({"a": 1, "b": ["x"]});
        let (resolved, used) = substitute_secrets(&config, &NoSecrets).unwrap();
        assert_eq!(resolved, config);
        assert!(used.is_empty());
    }
}
