//! Branch condition evaluation.
//!
//! The grammar is deliberately minimal: an optional `${…}` wrapper around
//! exactly `IDENT OP NUMBER`. Anything that does not parse, any missing or
//! non-numeric variable, evaluates to `false` — a condition can never fail
//! a step.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static CONDITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(==|!=|>=|<=|>|<)\s*([+-]?(?:\d+(?:\.\d+)?|\.\d+))\s*$")
        .unwrap()
});

/// Decide whether a labeled branch fires given the instance variables.
///
/// Deterministic and side-effect-free. Callers that need to distinguish
/// "no condition" from "condition evaluated false" check for the presence
/// of the expression themselves.
pub fn evaluate(expression: &str, variables: &BTreeMap<String, Value>) -> bool {
    let inner = strip_wrapper(expression);

    let Some(caps) = CONDITION_RE.captures(inner) else {
        return false;
    };

    let Some(left) = variables.get(&caps[1]).and_then(as_f64) else {
        return false;
    };
    let Ok(right) = caps[3].parse::<f64>() else {
        return false;
    };

    match &caps[2] {
        "==" => (left - right).abs() < f64::EPSILON,
        "!=" => (left - right).abs() >= f64::EPSILON,
        ">=" => left >= right,
        "<=" => left <= right,
        ">" => left > right,
        "<" => left < right,
        _ => false,
    }
}

fn strip_wrapper(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
}

/// Native numbers and numeric-looking strings compare numerically;
/// everything else does not compare at all.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
