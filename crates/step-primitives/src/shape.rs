//! Structural validation of values against declared output shapes.
//!
//! A shape is a small JSON declaration: `{"type": "object",
//! "properties": {...}, "required": [...]}`, `{"type": "array",
//! "items": {...}}`, or a scalar `{"type": "string" | "number" |
//! "boolean" | "null" | "any"}`. Deliberately smaller than JSON
//! Schema: just enough to make AI-returned data unambiguous.

use serde_json::Value;

/// Check that a shape declaration itself is well-formed.
pub fn check_declaration(shape: &Value) -> Result<(), String> {
    let obj = shape
        .as_object()
        .ok_or_else(|| "shape must be an object".to_string())?;
    let ty = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "shape must declare a 'type' string".to_string())?;
    match ty {
        "object" => {
            if let Some(props) = obj.get("properties") {
                let props = props
                    .as_object()
                    .ok_or_else(|| "'properties' must be an object".to_string())?;
                for (key, sub) in props {
                    check_declaration(sub).map_err(|e| format!("properties.{key}: {e}"))?;
                }
            }
            Ok(())
        }
        "array" => {
            if let Some(items) = obj.get("items") {
                check_declaration(items).map_err(|e| format!("items: {e}"))?;
            }
            Ok(())
        }
        "string" | "number" | "boolean" | "null" | "any" => Ok(()),
        other => Err(format!("unknown shape type '{other}'")),
    }
}

/// Validate a value against a declared shape. Returns the first
/// mismatch with its path.
pub fn validate(value: &Value, shape: &Value) -> Result<(), String> {
    validate_at(value, shape, "$")
}

fn validate_at(value: &Value, shape: &Value, path: &str) -> Result<(), String> {
    let ty = shape
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{path}: shape missing 'type'"))?;

    match ty {
        "any" => Ok(()),
        "null" => match value {
            Value::Null => Ok(()),
            _ => Err(format!("{path}: expected null")),
        },
        "boolean" => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(format!("{path}: expected boolean, got {}", kind_of(value))),
        },
        "number" => match value {
            Value::Number(_) => Ok(()),
            _ => Err(format!("{path}: expected number, got {}", kind_of(value))),
        },
        "string" => match value {
            Value::String(_) => Ok(()),
            _ => Err(format!("{path}: expected string, got {}", kind_of(value))),
        },
        "array" => {
            let items = value
                .as_array()
                .ok_or_else(|| format!("{path}: expected array, got {}", kind_of(value)))?;
            if let Some(item_shape) = shape.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(item, item_shape, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        "object" => {
            let map = value
                .as_object()
                .ok_or_else(|| format!("{path}: expected object, got {}", kind_of(value)))?;
            if let Some(required) = shape.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        return Err(format!("{path}: missing required key '{key}'"));
                    }
                }
            }
            if let Some(props) = shape.get("properties").and_then(Value::as_object) {
                for (key, sub_shape) in props {
                    if let Some(sub_value) = map.get(key) {
                        validate_at(sub_value, sub_shape, &format!("{path}.{key}"))?;
                    }
                }
            }
            Ok(())
        }
        other => Err(format!("{path}: unknown shape type '{other}'")),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_shapes() {
        assert!(validate(&json!(true), &json!({"type": "boolean"})).is_ok());
        assert!(validate(&json!("x"), &json!({"type": "boolean"})).is_err());
        assert!(validate(&json!(3.5), &json!({"type": "number"})).is_ok());
    }

    #[test]
    fn object_shape_with_required_keys() {
        let shape = json!({
            "type": "object",
            "required": ["subject"],
            "properties": {"subject": {"type": "string"}, "unread": {"type": "boolean"}}
        });
        assert!(validate(&json!({"subject": "hi", "unread": false}), &shape).is_ok());
        let err = validate(&json!({"unread": true}), &shape).unwrap_err();
        assert!(err.contains("subject"));
    }

    #[test]
    fn array_items_are_checked() {
        let shape = json!({"type": "array", "items": {"type": "number"}});
        assert!(validate(&json!([1, 2]), &shape).is_ok());
        let err = validate(&json!([1, "two"]), &shape).unwrap_err();
        assert!(err.contains("[1]"));
    }

    #[test]
    fn declaration_checking_rejects_nonsense() {
        assert!(check_declaration(&json!({"type": "object"})).is_ok());
        assert!(check_declaration(&json!({"type": "wibble"})).is_err());
        assert!(check_declaration(&json!("string")).is_err());
    }
}
