//! Scoped variable store with template substitution.
//!
//! The store is a stack of scopes: one workflow-global scope at the
//! bottom plus one child scope per active loop iteration. Lookups
//! resolve innermost-first; writes target the innermost scope unless a
//! caller explicitly forwards to the parent. On scope pop, declared
//! forward keys are copied into the parent and declared aggregate keys
//! are appended to a parent-scope array named for the key. Nothing
//! else leaks.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Prefix for process-environment lookups inside `{{...}}` tokens.
pub const ENV_PREFIX: &str = "env:";

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_:\.\-\[\]]+)\s*\}\}").expect("token regex"));

/// Variable store errors.
#[derive(Debug, Error)]
pub enum VarError {
    /// A template token referenced a key no scope can resolve. This is
    /// always fatal: silently substituting the literal token would
    /// corrupt downstream state.
    #[error("unresolved template token '{{{{{token}}}}}': missing key '{key}'")]
    TemplateResolution { token: String, key: String },

    /// Environment variable named by an `env:` token is not set.
    #[error("unresolved template token '{{{{env:{name}}}}}': environment variable not set")]
    EnvMissing { name: String },

    /// Aggregation target exists in the parent scope but is not an array.
    #[error("aggregate target '{0}' exists in parent scope but is not an array")]
    AggregateTarget(String),

    /// Attempted to pop the workflow-global scope.
    #[error("cannot pop the workflow-global scope")]
    RootScope,
}

type Scope = HashMap<String, Value>;

/// Nested key/value state for one workflow run.
#[derive(Clone, Debug)]
pub struct VarStore {
    scopes: Vec<Scope>,
}

impl Default for VarStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VarStore {
    /// Create a store with an empty workflow-global scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new()],
        }
    }

    /// Create a store whose global scope is seeded with `initial`.
    pub fn with_initial(initial: HashMap<String, Value>) -> Self {
        Self {
            scopes: vec![initial],
        }
    }

    /// Number of active scopes (1 = global only).
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Innermost-first lookup of a plain key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(key))
    }

    /// Write into the innermost active scope.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.innermost_mut().insert(key.into(), value);
    }

    /// Write into the parent of the innermost scope ("forward to
    /// parent"). Falls back to the innermost scope when no parent
    /// exists.
    pub fn set_forwarded(&mut self, key: impl Into<String>, value: Value) {
        let idx = self.scopes.len().saturating_sub(2);
        self.scopes[idx].insert(key.into(), value);
    }

    /// Merge a partial map into the innermost scope.
    pub fn merge(&mut self, partial: Map<String, Value>) {
        let scope = self.innermost_mut();
        for (key, value) in partial {
            scope.insert(key, value);
        }
    }

    /// Remove a key from the innermost scope that holds it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.remove(key))
    }

    /// Clear the innermost scope.
    pub fn clear(&mut self) {
        self.innermost_mut().clear();
    }

    /// Open a child scope for a loop iteration.
    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Close the innermost scope, applying forwarding rules.
    ///
    /// Keys in `forward` are copied into the parent scope. Keys in
    /// `aggregate` are appended to a parent-scope array named for the
    /// key (created when absent). The child scope is then discarded.
    pub fn pop_scope(&mut self, forward: &[String], aggregate: &[String]) -> Result<(), VarError> {
        if self.scopes.len() <= 1 {
            return Err(VarError::RootScope);
        }
        let child = self.scopes.pop().expect("scope stack is non-empty");
        let parent = self.innermost_mut();

        for key in forward {
            if let Some(value) = child.get(key) {
                parent.insert(key.clone(), value.clone());
            }
        }

        for key in aggregate {
            let Some(value) = child.get(key) else {
                continue;
            };
            match parent.entry(key.clone()).or_insert_with(|| Value::Array(Vec::new())) {
                Value::Array(items) => items.push(value.clone()),
                _ => return Err(VarError::AggregateTarget(key.clone())),
            }
        }

        debug!(depth = self.scopes.len(), "popped variable scope");
        Ok(())
    }

    /// Discard the innermost scope without applying any forwarding.
    /// Used when an iteration fails before its outputs are trustworthy.
    pub fn discard_scope(&mut self) -> Result<(), VarError> {
        if self.scopes.len() <= 1 {
            return Err(VarError::RootScope);
        }
        self.scopes.pop();
        Ok(())
    }

    /// Resolve a dotted path (`order.items.0.sku`) against the store,
    /// innermost-first on the head segment, then structural traversal.
    pub fn lookup_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = self.get(head)?.clone();
        for segment in segments {
            current = match current {
                Value::Object(ref map) => map.get(segment)?.clone(),
                Value::Array(ref items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?.clone()
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replace every `{{path}}` token in `input`. `{{env:NAME}}` reads
    /// the process environment. Unresolved tokens fail hard.
    pub fn resolve_template(&self, input: &str) -> Result<String, VarError> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in TOKEN_RE.captures_iter(input) {
            let whole = caps.get(0).expect("regex match");
            let token = caps.get(1).expect("token group").as_str();
            out.push_str(&input[last..whole.start()]);
            let value = self.resolve_token(token)?;
            out.push_str(&value_to_string(&value));
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Like [`resolve_template`](Self::resolve_template), but an input
    /// that is exactly one token yields the underlying JSON value so
    /// arrays and objects survive substitution with their types.
    pub fn resolve_template_value(&self, input: &str) -> Result<Value, VarError> {
        if let Some(caps) = TOKEN_RE.captures(input) {
            let whole = caps.get(0).expect("regex match");
            if whole.start() == 0 && whole.end() == input.len() {
                let token = caps.get(1).expect("token group").as_str();
                return self.resolve_token(token);
            }
        }
        self.resolve_template(input).map(Value::String)
    }

    /// Deep-resolve every string inside a JSON config value.
    pub fn resolve_config(&self, config: &Value) -> Result<Value, VarError> {
        match config {
            Value::String(s) => self.resolve_template_value(s),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_config(item)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.resolve_config(value)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Flattened view of all scopes, innermost winning. Used for
    /// provenance snapshots.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for scope in &self.scopes {
            for (key, value) in scope {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }

    fn resolve_token(&self, token: &str) -> Result<Value, VarError> {
        if let Some(name) = token.strip_prefix(ENV_PREFIX) {
            return std::env::var(name)
                .map(Value::String)
                .map_err(|_| VarError::EnvMissing {
                    name: name.to_string(),
                });
        }
        self.lookup_path(token)
            .ok_or_else(|| VarError::TemplateResolution {
                token: token.to_string(),
                key: token.to_string(),
            })
    }

    fn innermost_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is non-empty")
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_is_innermost_first() {
        let mut store = VarStore::new();
        store.set("color", json!("red"));
        store.push_scope();
        store.set("color", json!("blue"));
        assert_eq!(store.get("color"), Some(&json!("blue")));
        store.pop_scope(&[], &[]).unwrap();
        assert_eq!(store.get("color"), Some(&json!("red")));
    }

    #[test]
    fn child_scope_does_not_leak() {
        let mut store = VarStore::new();
        store.push_scope();
        store.set("temp", json!(1));
        store.pop_scope(&[], &[]).unwrap();
        assert!(store.get("temp").is_none());
    }

    #[test]
    fn forward_copies_into_parent() {
        let mut store = VarStore::new();
        store.push_scope();
        store.set("result", json!("ok"));
        store.set("scratch", json!("gone"));
        store.pop_scope(&["result".to_string()], &[]).unwrap();
        assert_eq!(store.get("result"), Some(&json!("ok")));
        assert!(store.get("scratch").is_none());
    }

    #[test]
    fn aggregate_appends_to_parent_array() {
        let mut store = VarStore::new();
        for i in 0..3 {
            store.push_scope();
            store.set("row", json!(i));
            store.pop_scope(&[], &["row".to_string()]).unwrap();
        }
        assert_eq!(store.get("row"), Some(&json!([0, 1, 2])));
    }

    #[test]
    fn aggregate_onto_non_array_fails() {
        let mut store = VarStore::new();
        store.set("row", json!("scalar"));
        store.push_scope();
        store.set("row", json!(1));
        let err = store.pop_scope(&[], &["row".to_string()]).unwrap_err();
        assert!(matches!(err, VarError::AggregateTarget(_)));
    }

    #[test]
    fn popping_root_scope_is_an_error() {
        let mut store = VarStore::new();
        assert!(matches!(
            store.pop_scope(&[], &[]),
            Err(VarError::RootScope)
        ));
    }

    #[test]
    fn template_resolves_paths_and_literals() {
        let mut store = VarStore::new();
        store.set("user", json!({"name": "Ada", "id": 7}));
        let out = store
            .resolve_template("hello {{user.name}} (#{{user.id}})")
            .unwrap();
        assert_eq!(out, "hello Ada (#7)");
    }

    #[test]
    fn unresolved_token_is_fatal_not_literal() {
        let store = VarStore::new();
        let err = store.resolve_template("value: {{missing}}").unwrap_err();
        match err {
            VarError::TemplateResolution { key, .. } => assert_eq!(key, "missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn env_token_reads_process_environment() {
        std::env::set_var("FLOWMILL_TEST_TOKEN", "sekret-host");
        let store = VarStore::new();
        let out = store
            .resolve_template("host={{env:FLOWMILL_TEST_TOKEN}}")
            .unwrap();
        assert_eq!(out, "host=sekret-host");
    }

    #[test]
    fn single_token_preserves_value_type() {
        let mut store = VarStore::new();
        store.set("rows", json!([1, 2, 3]));
        let value = store.resolve_template_value("{{rows}}").unwrap();
        assert_eq!(value, json!([1, 2, 3]));
        // Embedded in a larger string it stringifies instead.
        let text = store.resolve_template("rows={{rows}}").unwrap();
        assert_eq!(text, "rows=[1,2,3]");
    }

    #[test]
    fn resolve_config_walks_nested_structures() {
        let mut store = VarStore::new();
        store.set("url", json!("https://example.test"));
        store.set("count", json!(4));
        let config = json!({
            "target": "{{url}}",
            "nested": {"n": "{{count}}"},
            "list": ["{{count}}", "plain"]
        });
        let resolved = store.resolve_config(&config).unwrap();
        assert_eq!(
            resolved,
            json!({
                "target": "https://example.test",
                "nested": {"n": 4},
                "list": [4, "plain"]
            })
        );
    }

    #[test]
    fn lookup_path_indexes_arrays() {
        let mut store = VarStore::new();
        store.set("items", json!([{"sku": "a"}, {"sku": "b"}]));
        assert_eq!(store.lookup_path("items.1.sku"), Some(json!("b")));
        assert_eq!(store.lookup_path("items.9.sku"), None);
    }
}
