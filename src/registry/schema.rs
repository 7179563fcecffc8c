//! 能力参数校验（JSON Schema 子集）
//!
//! 支持 type（含类型数组）、required、properties 下的 type / enum、additionalProperties: false。
//! 其余关键字忽略：Agent 自己仍会做完整校验。

use serde_json::{Map, Value};

/// 校验 args 是否满足 schema；错误信息直接回显给决策后端
pub fn validate(schema: &Value, args: &Value) -> Result<(), String> {
    if schema_allows_object(schema) {
        let obj = args
            .as_object()
            .ok_or_else(|| format!("arguments must be a JSON object, got {}", type_name(args)))?;
        validate_object(schema, obj)
    } else {
        check_type(schema, args, "arguments")
    }
}

/// schema 中声明的属性名
pub fn property_names(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default()
}

fn schema_allows_object(schema: &Value) -> bool {
    match schema.get("type") {
        None => true,
        Some(t) => type_list(t).iter().any(|t| *t == "object"),
    }
}

fn validate_object(schema: &Value, obj: &Map<String, Value>) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| obj.get(*key).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required argument(s): {}", missing.join(", ")));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, value) in obj {
            if let Some(prop) = properties.get(key) {
                check_type(prop, value, key)?;
                check_enum(prop, value, key)?;
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let unknown: Vec<&str> = obj
            .keys()
            .filter(|k| properties.map_or(true, |p| !p.contains_key(*k)))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(format!("unexpected argument(s): {}", unknown.join(", ")));
        }
    }
    Ok(())
}

fn type_list(t: &Value) -> Vec<&str> {
    match t {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn check_type(prop: &Value, value: &Value, key: &str) -> Result<(), String> {
    let Some(t) = prop.get("type") else {
        return Ok(());
    };
    let allowed = type_list(t);
    if allowed.is_empty() || allowed.iter().any(|t| matches_type(t, value)) {
        return Ok(());
    }
    Err(format!(
        "argument '{key}' must be {}, got {}",
        allowed.join(" or "),
        type_name(value)
    ))
}

fn check_enum(prop: &Value, value: &Value, key: &str) -> Result<(), String> {
    match prop.get("enum").and_then(Value::as_array) {
        Some(options) if !options.contains(value) => Err(format!(
            "argument '{key}' must be one of {}",
            Value::Array(options.clone())
        )),
        _ => Ok(()),
    }
}

fn matches_type(t: &str, value: &Value) -> bool {
    match t {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // 未知类型关键字不拦截
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
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

    fn region_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "region": { "type": "string", "enum": ["Europe", "Asia", "Americas"] },
                "top_n": { "type": "integer" }
            },
            "required": ["region"]
        })
    }

    #[test]
    fn test_valid_arguments() {
        assert!(validate(&region_schema(), &json!({"region": "Europe", "top_n": 3})).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&region_schema(), &json!({"top_n": 3})).unwrap_err();
        assert!(err.contains("region"));
        let err = validate(&region_schema(), &json!({"region": null})).unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn test_wrong_type_and_enum() {
        let err = validate(&region_schema(), &json!({"region": "Europe", "top_n": "3"})).unwrap_err();
        assert!(err.contains("top_n") && err.contains("integer"));
        let err = validate(&region_schema(), &json!({"region": "Mars"})).unwrap_err();
        assert!(err.contains("one of"));
    }

    #[test]
    fn test_non_object_arguments() {
        assert!(validate(&region_schema(), &json!("Europe")).is_err());
    }

    #[test]
    fn test_additional_properties_false() {
        let schema = json!({"type": "object", "properties": {"a": {}}, "additionalProperties": false});
        assert!(validate(&schema, &json!({"a": 1})).is_ok());
        assert!(validate(&schema, &json!({"a": 1, "b": 2})).unwrap_err().contains("b"));
    }

    #[test]
    fn test_permissive_schema() {
        assert!(validate(&json!({"type": "object"}), &json!({"anything": [1, 2]})).is_ok());
        assert_eq!(property_names(&region_schema()).len(), 2);
    }
}
