//! Pure transforms over variable-store paths.
//!
//! Transforms are a pre-registered function registry keyed by name:
//! no expression evaluation or arbitrary code, no side effects, no
//! I/O. Unknown function names fail validation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{StepCtx, StepError, StepExecutor, StepOutcome};

/// Signature of a registered transform: a pure function over its
/// resolved input values.
pub type TransformFn = fn(&[Value]) -> Result<Value, String>;

/// Named registry of pure transform functions.
#[derive(Default)]
pub struct TransformRegistry {
    inner: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in function set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("upper", builtin::upper);
        registry.register("lower", builtin::lower);
        registry.register("trim", builtin::trim);
        registry.register("length", builtin::length);
        registry.register("concat", builtin::concat);
        registry.register("join", builtin::join);
        registry.register("sum", builtin::sum);
        registry.register("pick", builtin::pick);
        registry.register("default", builtin::default_value);
        registry.register("to_number", builtin::to_number);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, f: TransformFn) {
        self.inner.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<TransformFn> {
        self.inner.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

mod builtin {
    use serde_json::{json, Value};

    fn as_str(value: &Value) -> Result<&str, String> {
        value
            .as_str()
            .ok_or_else(|| format!("expected string, got {value}"))
    }

    pub fn upper(inputs: &[Value]) -> Result<Value, String> {
        Ok(json!(as_str(one(inputs)?)?.to_uppercase()))
    }

    pub fn lower(inputs: &[Value]) -> Result<Value, String> {
        Ok(json!(as_str(one(inputs)?)?.to_lowercase()))
    }

    pub fn trim(inputs: &[Value]) -> Result<Value, String> {
        Ok(json!(as_str(one(inputs)?)?.trim()))
    }

    pub fn length(inputs: &[Value]) -> Result<Value, String> {
        match one(inputs)? {
            Value::String(s) => Ok(json!(s.chars().count())),
            Value::Array(items) => Ok(json!(items.len())),
            Value::Object(map) => Ok(json!(map.len())),
            other => Err(format!("length is undefined for {other}")),
        }
    }

    pub fn concat(inputs: &[Value]) -> Result<Value, String> {
        let mut out = String::new();
        for input in inputs {
            match input {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        Ok(json!(out))
    }

    pub fn join(inputs: &[Value]) -> Result<Value, String> {
        let [items, separator] = inputs else {
            return Err("join expects (array, separator)".into());
        };
        let items = items
            .as_array()
            .ok_or_else(|| "join expects an array first".to_string())?;
        let separator = as_str(separator)?;
        let parts: Vec<String> = items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Ok(json!(parts.join(separator)))
    }

    pub fn sum(inputs: &[Value]) -> Result<Value, String> {
        let mut total = 0f64;
        for input in inputs {
            match input {
                Value::Number(n) => total += n.as_f64().unwrap_or(0.0),
                Value::Array(items) => {
                    for item in items {
                        total += item
                            .as_f64()
                            .ok_or_else(|| format!("sum: non-numeric element {item}"))?;
                    }
                }
                other => return Err(format!("sum: non-numeric input {other}")),
            }
        }
        Ok(json!(total))
    }

    pub fn pick(inputs: &[Value]) -> Result<Value, String> {
        let [source, key] = inputs else {
            return Err("pick expects (object, key)".into());
        };
        let key = as_str(key)?;
        source
            .get(key)
            .cloned()
            .ok_or_else(|| format!("pick: key '{key}' not present"))
    }

    pub fn default_value(inputs: &[Value]) -> Result<Value, String> {
        let [value, fallback] = inputs else {
            return Err("default expects (value, fallback)".into());
        };
        Ok(if value.is_null() {
            fallback.clone()
        } else {
            value.clone()
        })
    }

    pub fn to_number(inputs: &[Value]) -> Result<Value, String> {
        match one(inputs)? {
            Value::Number(n) => Ok(json!(n)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|n| json!(n))
                .map_err(|_| format!("to_number: '{s}' is not numeric")),
            other => Err(format!("to_number is undefined for {other}")),
        }
    }

    fn one(inputs: &[Value]) -> Result<&Value, String> {
        match inputs {
            [single] => Ok(single),
            _ => Err(format!("expected exactly one input, got {}", inputs.len())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TransformConfig {
    function: String,

    /// Variable-store paths whose values become the function inputs.
    #[serde(default)]
    inputs: Vec<String>,

    /// Literal arguments appended after the path-resolved inputs.
    #[serde(default)]
    args: Vec<Value>,
}

/// Executor for `transform` nodes.
pub struct TransformExecutor {
    registry: Arc<TransformRegistry>,
}

impl TransformExecutor {
    pub fn new(registry: Arc<TransformRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl StepExecutor for TransformExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Transform
    }

    fn default_output_key(&self) -> &'static str {
        "transformed"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        let parsed: TransformConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("transform: {err}")))?;
        if !self.registry.contains(&parsed.function) {
            return Err(StepError::Configuration(format!(
                "transform: unknown function '{}'",
                parsed.function
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let transform: TransformConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("transform: {err}")))?;

        let f = self.registry.get(&transform.function).ok_or_else(|| {
            StepError::Configuration(format!(
                "transform: unknown function '{}'",
                transform.function
            ))
        })?;

        let mut inputs = Vec::with_capacity(transform.inputs.len() + transform.args.len());
        for path in &transform.inputs {
            let value = vars.lookup_path(path).ok_or_else(|| StepError::Transform {
                name: transform.function.clone(),
                message: format!("input path '{path}' is unset"),
                input: json!({"paths": transform.inputs}),
            })?;
            inputs.push(value);
        }
        inputs.extend(transform.args.iter().cloned());

        debug!(node = %ctx.node_id, function = %transform.function, "applying transform");
        let result = f(&inputs).map_err(|message| StepError::Transform {
            name: transform.function.clone(),
            message,
            input: Value::Array(inputs),
        })?;

        Ok(StepOutcome::with_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedBrowser, ScriptedReasoner};
    use flowmill_core_types::{NodeId, SessionHandle};
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn executor() -> TransformExecutor {
        TransformExecutor::new(Arc::new(TransformRegistry::builtin()))
    }

    fn ctx() -> StepCtx {
        StepCtx::new(
            SessionHandle::new(),
            Arc::new(ScriptedBrowser::new()),
            Arc::new(ScriptedReasoner::new()),
            NodeId::from("t"),
            Instant::now() + Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn applies_a_pure_function_over_paths() {
        let mut vars = VarStore::new();
        vars.set("subject", json!("  Invoice 42  "));
        let outcome = executor()
            .execute(
                &ctx(),
                &json!({"function": "trim", "inputs": ["subject"]}),
                &mut vars,
            )
            .await
            .unwrap();
        assert_eq!(outcome.result.unwrap(), json!("Invoice 42"));
    }

    #[tokio::test]
    async fn failure_carries_the_offending_input() {
        let mut vars = VarStore::new();
        vars.set("n", json!({"not": "a string"}));
        let err = executor()
            .execute(
                &ctx(),
                &json!({"function": "upper", "inputs": ["n"]}),
                &mut vars,
            )
            .await
            .unwrap_err();
        match err {
            StepError::Transform { name, input, .. } => {
                assert_eq!(name, "upper");
                assert_eq!(input, json!([{"not": "a string"}]));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_function_fails_validation() {
        let err = executor()
            .validate(&json!({"function": "eval", "inputs": []}))
            .unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
    }

    #[tokio::test]
    async fn literal_args_follow_path_inputs() {
        let mut vars = VarStore::new();
        vars.set("names", json!(["ada", "grace"]));
        let outcome = executor()
            .execute(
                &ctx(),
                &json!({"function": "join", "inputs": ["names"], "args": [", "]}),
                &mut vars,
            )
            .await
            .unwrap();
        assert_eq!(outcome.result.unwrap(), json!("ada, grace"));
    }

    #[test]
    fn builtin_sum_flattens_arrays() {
        let result = TransformRegistry::builtin().get("sum").unwrap()(&[json!([1, 2]), json!(3)])
            .unwrap();
        assert_eq!(result, json!(6.0));
    }
}
