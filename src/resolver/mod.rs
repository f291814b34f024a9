//! Variable resolution for step inputs
//!
//! Resolves `${path.to.value}` references against a layered context made of
//! the trigger input, prior step outputs, aggregated prerequisite outputs,
//! configuration, secrets and environment. Resolution is best-effort: a
//! reference that cannot be resolved is left in place untouched.

pub mod condition;

pub use condition::{evaluate_condition, validate_condition, ResolveError};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Matches ${variable}, ${variable.path}, ${items[0].name}, ${variable:-default}
static VARIABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid variable regex"));

/// A template that is exactly one reference
static WHOLE_VARIABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{([^}]+)\}$").expect("valid whole variable regex"));

/// Layered resolution context
///
/// Each layer is exposed under its own root key: `trigger`, `steps`, `deps`,
/// `config`, `secrets` and `env`. Any other root is looked up in the trigger
/// input.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub trigger: Value,
    pub steps: Map<String, Value>,
    pub deps: Map<String, Value>,
    pub config: Value,
    pub secrets: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl ResolveContext {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Record the outputs of a finished step
    pub fn set_step_output(&mut self, step_id: &str, outputs: Value) {
        self.steps.insert(step_id.to_string(), outputs);
    }

    /// Child context for one step, with its prerequisites' outputs aggregated
    /// under `deps`
    pub fn for_step(&self, depends_on: &[String]) -> Self {
        let mut child = self.clone();
        child.deps = depends_on
            .iter()
            .map(|dep| {
                let outputs = self.steps.get(dep).cloned().unwrap_or(Value::Null);
                (dep.clone(), outputs)
            })
            .collect();
        child
    }

    /// Look up a parsed path
    pub fn lookup(&self, path: &[String]) -> Option<Value> {
        let (root, rest) = path.split_first()?;
        let base = match root.as_str() {
            "trigger" | "input" => self.trigger.clone(),
            "steps" => Value::Object(self.steps.clone()),
            "deps" => Value::Object(self.deps.clone()),
            "config" => self.config.clone(),
            "secrets" => string_map_to_value(&self.secrets),
            "env" => string_map_to_value(&self.env),
            _ => return walk(self.trigger.clone(), path),
        };
        walk(base, rest)
    }
}

fn string_map_to_value(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Follow path segments through objects and arrays
fn walk(mut current: Value, segments: &[String]) -> Option<Value> {
    for segment in segments {
        current = if let Some(index) = segment
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
        {
            let index: usize = index.parse().ok()?;
            match current {
                Value::Array(mut items) if index < items.len() => items.swap_remove(index),
                _ => return None,
            }
        } else {
            match current {
                Value::Object(mut map) => map.remove(segment)?,
                _ => return None,
            }
        };
    }
    Some(current)
}

/// Parse a variable expression like "steps.a.outputs" or "timeout:-600"
fn parse_expression(expr: &str) -> Option<(Vec<String>, Option<String>)> {
    let (path_str, default) = match expr.find(":-") {
        Some(idx) => (&expr[..idx], Some(expr[idx + 2..].to_string())),
        None => (expr, None),
    };
    let path = parse_path(path_str.trim());
    if path.is_empty() {
        None
    } else {
        Some((path, default))
    }
}

/// Split a path into segments, keeping `[n]` indexes as their own segments
pub fn parse_path(path_str: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;

    for ch in path_str.chars() {
        match ch {
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                in_brackets = true;
                current.push(ch);
            }
            ']' => {
                current.push(ch);
                in_brackets = false;
                segments.push(std::mem::take(&mut current));
            }
            '.' if !in_brackets => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

/// Resolve one `${...}` expression to a value
fn resolve_expression(expr: &str, context: &ResolveContext) -> Option<Value> {
    let (path, default) = parse_expression(expr)?;
    context
        .lookup(&path)
        .or_else(|| default.map(Value::String))
}

/// Convert a JSON value to its embedded string form
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Resolve a string template
///
/// A template that is exactly one reference resolves to the referenced value
/// with its native type; otherwise each reference is substituted with its
/// string form.
pub fn resolve_str(template: &str, context: &ResolveContext) -> Value {
    if let Some(caps) = WHOLE_VARIABLE_REGEX.captures(template) {
        return resolve_expression(&caps[1], context)
            .unwrap_or_else(|| Value::String(template.to_string()));
    }

    Value::String(interpolate(template, context))
}

/// Substitute every reference in `template` with its string form
pub fn interpolate(template: &str, context: &ResolveContext) -> String {
    VARIABLE_REGEX
        .replace_all(template, |caps: &regex::Captures| {
            match resolve_expression(&caps[1], context) {
                Some(value) => value_to_string(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve a template value recursively
pub fn resolve(template: &Value, context: &ResolveContext) -> Value {
    match template {
        Value::String(s) => resolve_str(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Escape a string for safe use in shell commands
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        return s.to_string();
    }

    let escaped = s.replace('\'', "'\\''");
    format!("'{}'", escaped)
}
