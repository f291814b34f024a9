//! Step condition evaluation
//!
//! A condition is read as a comparison (`==`, `!=`, `>=`, `<=`, `>`, `<`), a
//! boolean literal, or a truthy value. Comparisons are split on the leftmost
//! operator outside any `${...}` reference before either side is resolved, so
//! resolved values never introduce operators. A leading `!` negates the whole
//! expression.

use super::{interpolate, ResolveContext};
use once_cell::sync::Lazy;
use regex::Regex;

static UNRESOLVED_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{[^}]+\}").expect("valid unresolved regex"));

/// Operators tried at each position; two-character operators must come first
const OPERATORS: [(&str, Op); 6] = [
    ("==", Op::Eq),
    ("!=", Op::Ne),
    (">=", Op::Ge),
    ("<=", Op::Le),
    (">", Op::Gt),
    ("<", Op::Lt),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Empty condition")]
    EmptyCondition,

    #[error("Comparison '{0}' is missing an operand")]
    MissingOperand(String),

    #[error("Unbalanced variable reference in '{0}'")]
    UnbalancedReference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Check that a condition is well formed without evaluating it
pub fn validate_condition(expr: &str) -> Result<(), ResolveError> {
    let body = strip_negation(expr.trim()).0;
    if body.is_empty() {
        return Err(ResolveError::EmptyCondition);
    }
    if body.matches("${").count() != body.matches('}').count() {
        return Err(ResolveError::UnbalancedReference(expr.to_string()));
    }
    if let Some((lhs, _, rhs)) = split_comparison(body) {
        if lhs.is_empty() || rhs.is_empty() {
            return Err(ResolveError::MissingOperand(expr.to_string()));
        }
    }
    Ok(())
}

/// Evaluate a condition against the context
///
/// Malformed conditions and any reference left unresolved evaluate to false.
pub fn evaluate_condition(expr: &str, context: &ResolveContext) -> bool {
    if validate_condition(expr).is_err() {
        return false;
    }

    let (body, negated) = strip_negation(expr.trim());
    let result = match split_comparison(body) {
        Some((lhs, op, rhs)) => {
            match (resolve_operand(lhs, context), resolve_operand(rhs, context)) {
                (Some(lhs), Some(rhs)) => compare(&lhs, op, &rhs),
                _ => return false,
            }
        }
        None => match resolve_operand(body, context) {
            Some(value) => is_truthy(&value),
            None => return false,
        },
    };

    result != negated
}

/// Resolve one side of a condition; `None` if a reference stays unresolved
fn resolve_operand(raw: &str, context: &ResolveContext) -> Option<String> {
    let resolved = interpolate(raw, context);
    if UNRESOLVED_REGEX.is_match(&resolved) {
        return None;
    }
    Some(resolved.trim().to_string())
}

fn strip_negation(expr: &str) -> (&str, bool) {
    match expr.strip_prefix('!') {
        Some(rest) if !rest.starts_with('=') => (rest.trim(), true),
        _ => (expr, false),
    }
}

fn split_comparison(expr: &str) -> Option<(&str, Op, &str)> {
    let mut depth = 0usize;
    let mut idx = 0;
    while idx < expr.len() {
        let rest = &expr[idx..];
        if rest.starts_with("${") {
            depth += 1;
            idx += 2;
            continue;
        }
        if depth > 0 {
            if rest.starts_with('}') {
                depth -= 1;
            }
        } else if let Some((token, op)) =
            OPERATORS.iter().find(|(token, _)| rest.starts_with(token))
        {
            return Some((expr[..idx].trim(), *op, expr[idx + token.len()..].trim()));
        }
        idx += rest.chars().next().map_or(1, char::len_utf8);
    }
    None
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(s)
}

fn compare(lhs: &str, op: Op, rhs: &str) -> bool {
    let (lhs, rhs) = (unquote(lhs), unquote(rhs));

    if let (Ok(l), Ok(r)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        return match op {
            Op::Eq => l == r,
            Op::Ne => l != r,
            Op::Ge => l >= r,
            Op::Le => l <= r,
            Op::Gt => l > r,
            Op::Lt => l < r,
        };
    }

    match op {
        Op::Eq => lhs == rhs,
        Op::Ne => lhs != rhs,
        Op::Ge => lhs >= rhs,
        Op::Le => lhs <= rhs,
        Op::Gt => lhs > rhs,
        Op::Lt => lhs < rhs,
    }
}

fn is_truthy(value: &str) -> bool {
    let value = unquote(value);
    !matches!(value, "" | "0" | "null" | "false")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ResolveContext {
        let mut ctx = ResolveContext::new(json!({
            "count": 5,
            "env": "prod",
            "enabled": true,
            "disabled": false,
            "empty": ""
        }));
        ctx.set_step_output("lint", json!({"errors": 0}));
        ctx
    }

    #[test]
    fn test_literals_and_truthiness() {
        assert!(evaluate_condition("true", &ctx()));
        assert!(!evaluate_condition("false", &ctx()));
        assert!(evaluate_condition("${trigger.enabled}", &ctx()));
        assert!(!evaluate_condition("${trigger.disabled}", &ctx()));
        assert!(!evaluate_condition("${trigger.empty}", &ctx()));
        assert!(!evaluate_condition("${steps.lint.errors}", &ctx()));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(evaluate_condition("${trigger.count} > 3", &ctx()));
        assert!(evaluate_condition("${trigger.count} >= 5", &ctx()));
        assert!(!evaluate_condition("${trigger.count} < 5", &ctx()));
        assert!(evaluate_condition("${trigger.count} == 5.0", &ctx()));
        // lexically "5" > "10", numerically it is not
        assert!(!evaluate_condition("${trigger.count} > 10", &ctx()));
    }

    #[test]
    fn test_string_comparison() {
        assert!(evaluate_condition("${trigger.env} == prod", &ctx()));
        assert!(evaluate_condition("${trigger.env} == 'prod'", &ctx()));
        assert!(evaluate_condition("${trigger.env} != staging", &ctx()));
    }

    #[test]
    fn test_negation() {
        assert!(evaluate_condition("!${trigger.disabled}", &ctx()));
        assert!(!evaluate_condition("! ${trigger.count} > 3", &ctx()));
    }

    #[test]
    fn test_unresolved_reference_is_false() {
        assert!(!evaluate_condition("${trigger.missing}", &ctx()));
        assert!(!evaluate_condition("${trigger.missing} != x", &ctx()));
        assert!(!evaluate_condition("!${trigger.missing}", &ctx()));
    }

    #[test]
    fn test_operator_inside_a_resolved_value_is_not_split() {
        let ctx = ResolveContext::new(json!({
            "expr": "a==b",
            "arrow": "x>y",
            "plain": "a"
        }));
        assert!(evaluate_condition("${trigger.expr} == a==b", &ctx));
        assert!(!evaluate_condition("${trigger.expr} == a", &ctx));
        assert!(evaluate_condition("${trigger.arrow} != x", &ctx));
        assert!(evaluate_condition("${trigger.arrow}", &ctx));
        // leftmost operator wins even when a longer one appears later
        assert!(evaluate_condition("${trigger.plain} != a==b", &ctx));
    }

    #[test]
    fn test_validation() {
        assert_eq!(validate_condition("  "), Err(ResolveError::EmptyCondition));
        assert!(matches!(
            validate_condition("${a} =="),
            Err(ResolveError::MissingOperand(_))
        ));
        assert!(matches!(
            validate_condition("${a.b"),
            Err(ResolveError::UnbalancedReference(_))
        ));
        assert!(validate_condition("${a} == 1").is_ok());
    }
}
