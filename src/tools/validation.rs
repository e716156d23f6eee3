//! Validate tool schemas at registration and arguments before execution.

const KNOWN_TYPES: &[&str] = &["string", "number", "integer", "boolean", "object", "array", "null"];

/// Check that a tool's input schema is one we can validate against.
///
/// The schema must be an object schema; `properties` must map names to
/// objects with a known `type` (when given) and `required` may only name
/// declared properties.
pub fn validate_schema(schema: &serde_json::Value) -> Result<(), String> {
    let Some(root) = schema.as_object() else {
        return Err("input schema must be a JSON object".into());
    };
    match root.get("type").and_then(|v| v.as_str()) {
        Some("object") => {}
        Some(other) => return Err(format!("input schema type must be 'object', got '{other}'")),
        None => return Err("input schema must declare \"type\": \"object\"".into()),
    }

    let properties = match root.get("properties") {
        None => None,
        Some(value) => Some(
            value
                .as_object()
                .ok_or_else(|| "'properties' must be an object".to_string())?,
        ),
    };

    if let Some(properties) = properties {
        for (name, prop) in properties {
            let Some(prop) = prop.as_object() else {
                return Err(format!("property '{name}' must be a schema object"));
            };
            let types: Vec<&serde_json::Value> = match prop.get("type") {
                None => Vec::new(),
                Some(serde_json::Value::Array(union)) => union.iter().collect(),
                Some(single) => vec![single],
            };
            for ty in types {
                let ty = ty
                    .as_str()
                    .ok_or_else(|| format!("property '{name}' has a non-string type"))?;
                if !KNOWN_TYPES.contains(&ty) {
                    return Err(format!("property '{name}' has unknown type '{ty}'"));
                }
            }
        }
    }

    if let Some(required) = root.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| "'required' must be an array".to_string())?;
        for field in required {
            let field = field
                .as_str()
                .ok_or_else(|| "'required' entries must be strings".to_string())?;
            if !properties.is_some_and(|props| props.contains_key(field)) {
                return Err(format!("required field '{field}' is not a declared property"));
            }
        }
    }

    Ok(())
}

/// Validate tool arguments against a JSON Schema.
///
/// Checks the top-level type, required field presence, declared property
/// types, `enum` membership, array item types and `additionalProperties:
/// false`. Returns `Err(message)` describing the first violation found.
pub fn validate_arguments(
    args: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), String> {
    if let Some(schema_type) = schema.get("type").and_then(|v| v.as_str()) {
        if schema_type == "object" && !args.is_object() {
            return Err(format!(
                "expected object arguments, got {}",
                json_type_name(args)
            ));
        }
    }

    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for field in required {
            if let Some(name) = field.as_str() {
                if !obj.contains_key(name) {
                    return Err(format!("missing required field '{name}'"));
                }
            }
        }
    }

    let properties = schema.get("properties").and_then(|v| v.as_object());
    let closed = schema.get("additionalProperties") == Some(&serde_json::Value::Bool(false));

    for (key, value) in obj {
        let Some(prop_schema) = properties.and_then(|props| props.get(key)) else {
            if closed {
                return Err(format!("unexpected field '{key}'"));
            }
            continue;
        };
        check_value(key, value, prop_schema)?;
    }

    Ok(())
}

fn check_value(
    path: &str,
    value: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), String> {
    if let Some(expected_type) = schema.get("type").and_then(|v| v.as_str()) {
        if !value_matches_type(value, expected_type) {
            return Err(format!(
                "field '{}' expected type '{}', got {}",
                path,
                expected_type,
                json_type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|v| v.as_array()) {
        if !allowed.contains(value) {
            return Err(format!("field '{path}' must be one of {}", serde_json::Value::Array(allowed.clone())));
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            check_value(&format!("{path}[{index}]"), item, item_schema)?;
        }
    }

    Ok(())
}

fn value_matches_type(value: &serde_json::Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_object_args_when_schema_expects_object() {
        let schema = json!({ "type": "object", "properties": {}, "required": [] });
        let args = json!("not an object");

        let result = validate_arguments(&args, &schema);

        assert!(result.unwrap_err().contains("expected object"));
    }

    #[test]
    fn rejects_when_any_required_field_is_absent() {
        let schema = json!({
            "type": "object",
            "properties": {
                "amount": { "type": "number" },
                "percentage": { "type": "number" },
            },
            "required": ["amount", "percentage"],
        });
        let args = json!({ "amount": 1200 });

        let result = validate_arguments(&args, &schema);

        assert!(result
            .unwrap_err()
            .contains("missing required field 'percentage'"));
    }

    #[test]
    fn rejects_field_with_wrong_type() {
        let schema = json!({
            "type": "object",
            "properties": { "count": { "type": "integer" } },
            "required": ["count"],
        });
        let args = json!({ "count": 1.5 });

        let err = validate_arguments(&args, &schema).unwrap_err();
        assert!(err.contains("field 'count'"));
        assert!(err.contains("expected type 'integer'"));
    }

    #[test]
    fn accepts_extra_fields_unless_closed() {
        let mut schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        });
        let args = json!({ "path": "a.txt", "extra": true });
        assert!(validate_arguments(&args, &schema).is_ok());

        schema["additionalProperties"] = json!(false);
        assert!(validate_arguments(&args, &schema)
            .unwrap_err()
            .contains("unexpected field 'extra'"));
    }

    #[test]
    fn enforces_enum_membership() {
        let schema = json!({
            "type": "object",
            "properties": { "unit": { "type": "string", "enum": ["c", "f"] } },
        });
        assert!(validate_arguments(&json!({ "unit": "c" }), &schema).is_ok());
        assert!(validate_arguments(&json!({ "unit": "k" }), &schema)
            .unwrap_err()
            .contains("must be one of"));
    }

    #[test]
    fn checks_array_item_types() {
        let schema = json!({
            "type": "object",
            "properties": { "tags": { "type": "array", "items": { "type": "string" } } },
        });
        assert!(validate_arguments(&json!({ "tags": ["a", "b"] }), &schema).is_ok());
        let err = validate_arguments(&json!({ "tags": ["a", 2] }), &schema).unwrap_err();
        assert!(err.contains("tags[1]"));
    }

    #[test]
    fn accepts_null_args_when_schema_has_no_type() {
        assert!(validate_arguments(&serde_json::Value::Null, &json!({})).is_ok());
    }

    #[test]
    fn schema_must_be_an_object_schema() {
        assert!(validate_schema(&json!({ "type": "object" })).is_ok());
        assert!(validate_schema(&json!({ "type": "string" })).is_err());
        assert!(validate_schema(&json!("object")).is_err());
        assert!(validate_schema(&json!({})).is_err());
    }

    #[test]
    fn schema_required_must_be_declared() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "required": ["a", "b"],
        });
        assert!(validate_schema(&schema).unwrap_err().contains("'b'"));
    }

    #[test]
    fn schema_rejects_unknown_property_types() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "text" } },
        });
        assert!(validate_schema(&schema).unwrap_err().contains("unknown type"));
    }
}
