//! Parameter template resolution against an execution's context.
//!
//! Step parameters are JSON templates. Any string inside them may reference
//! execution state with `{{ ... }}` placeholders:
//!
//! - `{{ context.<key>[.<field>...] }}` -- a value from the execution context
//! - `{{ steps.<step_id>.result[.<field>...] }}` -- a completed step's result
//! - `{{ workflow.id }}` / `{{ execution.id }}`
//!
//! A string consisting of exactly one placeholder resolves to the referenced
//! JSON value with its type intact. Placeholders embedded in longer strings
//! are interpolated as text. Unknown references are left as-is.

use std::collections::HashMap;

use serde_json::{Map, Value};
use taskweave_types::execution::StepResult;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TemplateScope
// ---------------------------------------------------------------------------

/// Read-only view of the state placeholders can reference.
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub workflow_id: &'a str,
    pub execution_id: Uuid,
    pub context: &'a Map<String, Value>,
    pub step_results: &'a HashMap<String, StepResult>,
}

impl<'a> TemplateScope<'a> {
    /// Resolve every placeholder in a JSON template, recursively.
    pub fn resolve(&self, template: &Value) -> Value {
        match template {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(&self, template: &str) -> Value {
        // Whole-string placeholder keeps the referenced value's type.
        if let Some(expr) = whole_placeholder(template) {
            if let Some(value) = self.lookup(expr) {
                return value;
            }
            return Value::String(template.to_string());
        }

        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            result.push_str(&rest[..start]);
            let expr = rest[start + 2..end - 2].trim();
            match self.lookup(expr) {
                Some(value) => result.push_str(&value_to_string(&value)),
                None => result.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }
        result.push_str(rest);
        Value::String(result)
    }

    /// Look up a dotted reference such as `context.account.id`.
    pub fn lookup(&self, expr: &str) -> Option<Value> {
        let mut parts = expr.split('.');
        let root = match parts.next()? {
            "context" => self.context.get(parts.next()?)?,
            "steps" => {
                let step = self.step_results.get(parts.next()?)?;
                match parts.next()? {
                    "result" => &step.result,
                    "success" => return Some(Value::Bool(step.success)),
                    _ => return None,
                }
            }
            "workflow" => {
                return (parts.next()? == "id" && parts.next().is_none())
                    .then(|| Value::String(self.workflow_id.to_string()));
            }
            "execution" => {
                return (parts.next()? == "id" && parts.next().is_none())
                    .then(|| Value::String(self.execution_id.to_string()));
            }
            _ => return None,
        };

        let mut current = root;
        for field in parts {
            current = match current {
                Value::Object(map) => map.get(field)?,
                Value::Array(items) => items.get(field.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Merge a step's context updates into the execution context.
///
/// Later writes win; keys absent from `updates` are untouched.
pub fn merge_context(context: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (key, value) in updates {
        context.insert(key.clone(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The expression inside `{{ expr }}` when the template is exactly one placeholder.
fn whole_placeholder(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Convert a JSON value to a display string for interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
