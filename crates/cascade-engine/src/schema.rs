//! Structural validation of check outputs against a declared schema.
//!
//! Supports the subset of JSON Schema that check contracts actually use:
//! `type` (string or list), `required`, `properties`, `items`, `enum`.
//! Violations are contract failures, not execution failures: they surface as
//! non-fatal `contract/schema_validation_failed` issues and never change
//! routing.

use std::collections::HashMap;

use cascade_types::{Issue, SchemaSpec, Severity};
use serde_json::Value;

pub const SCHEMA_RULE_ID: &str = "contract/schema_validation_failed";

/// Validate `output` against the check's schema declaration, resolving named
/// validators through `named`. Returns one issue per violation.
pub fn validate_output(
    check_id: &str,
    output: Option<&Value>,
    spec: &SchemaSpec,
    named: &HashMap<String, Value>,
) -> Vec<Issue> {
    let schema = match spec {
        SchemaSpec::Inline(schema) => schema,
        SchemaSpec::Named(id) => match named.get(id) {
            Some(schema) => schema,
            None => {
                return vec![violation(
                    check_id,
                    format!("schema validator '{id}' is not registered"),
                )];
            }
        },
    };

    let Some(output) = output else {
        return vec![violation(check_id, "output is missing".to_string())];
    };

    let mut problems = Vec::new();
    validate_value(output, schema, "$", &mut problems);
    problems
        .into_iter()
        .map(|problem| violation(check_id, problem))
        .collect()
}

fn violation(check_id: &str, problem: String) -> Issue {
    Issue::new(
        Severity::Warning,
        SCHEMA_RULE_ID,
        format!("{check_id}: {problem}"),
    )
    .with_category("contract")
}

fn validate_value(value: &Value, schema: &Value, path: &str, problems: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(name) => type_matches(value, name),
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .any(|name| type_matches(value, name)),
            _ => true,
        };
        if !matches {
            problems.push(format!(
                "{path}: expected type {expected}, got {}",
                type_name(value)
            ));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        problems.push(format!("{path}: value not in enum"));
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(field) {
                    problems.push(format!("{path}: missing required field '{field}'"));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (field, field_schema) in properties {
                if let Some(field_value) = object.get(field) {
                    validate_value(
                        field_value,
                        field_schema,
                        &format!("{path}.{field}"),
                        problems,
                    );
                }
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            validate_value(item, item_schema, &format!("{path}[{index}]"), problems);
        }
    }
}

fn type_matches(value: &Value, name: &str) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "string" => value.is_string(),
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
