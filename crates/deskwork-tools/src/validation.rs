//! Argument checks against a tool's declared schema.
//!
//! Only the shape the model is likely to get wrong is checked: the payload
//! must be an object, `required` fields must be present, and declared
//! primitive types must match. Messages are meant for the model to
//! self-correct on the next round.

use serde_json::Value;

pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(object) = args.as_object() else {
        return Err(format!("expected a JSON object, got {}", type_name(args)));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            match object.get(field) {
                None | Some(Value::Null) => return Err(format!("'{field}' is required")),
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(format!("'{field}' is required (got empty string)"));
                }
                Some(_) => {}
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (field, value) in object {
        let Some(expected) = properties
            .get(field)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if !matches_type(expected, value) {
            return Err(format!(
                "{field}: expected {expected}, got {}",
                type_name(value)
            ));
        }
    }
    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
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

    fn command_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "args": {"type": "array"},
                "timeout": {"type": "integer"}
            },
            "required": ["command"]
        })
    }

    #[test]
    fn accepts_well_formed_arguments() {
        assert!(validate_arguments(&command_schema(), &json!({"command": "ls", "args": ["-la"]})).is_ok());
    }

    #[test]
    fn rejects_non_object_payload() {
        let err = validate_arguments(&command_schema(), &json!("ls")).unwrap_err();
        assert!(err.contains("object"), "{err}");
    }

    #[test]
    fn rejects_missing_or_empty_required_field() {
        let err = validate_arguments(&command_schema(), &json!({})).unwrap_err();
        assert!(err.contains("command"), "{err}");
        let err = validate_arguments(&command_schema(), &json!({"command": ""})).unwrap_err();
        assert!(err.contains("empty"), "{err}");
    }

    #[test]
    fn rejects_wrong_primitive_type() {
        let err = validate_arguments(&command_schema(), &json!({"command": "ls", "timeout": "5"}))
            .unwrap_err();
        assert!(err.contains("timeout"), "{err}");
    }

    #[test]
    fn unknown_fields_pass_through() {
        assert!(validate_arguments(&command_schema(), &json!({"command": "ls", "extra": 1})).is_ok());
    }
}
