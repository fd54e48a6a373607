//! Symbolic reference resolution between plan steps
//!
//! Step inputs thread evidence by reference rather than by value:
//!
//! - `$WORKING_INPUT` — the current working input, by value-copy
//! - `#E3` — the output recorded for step `E3`
//! - `#E3.balance.amount` — a JSON path walk into that output; a missing
//!   path yields null, not an error
//!
//! Any other string is returned unchanged. Resolution operates on nested
//! mappings and lists; a mapping carrying `agent`/`query`/`input` keys is a
//! call config and only its `input` field is resolved.

use crate::state::{RawInput, ResultLog};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Reference token for the whole working input
pub const WORKING_INPUT_REF: &str = "$WORKING_INPUT";

fn ref_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[#＃]E(\d+)").expect("ref token regex"))
}

fn full_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[#＃]E(\d+)(?:\.(.+))?$").expect("full ref regex"))
}

/// True when the whole string is a `#Ek` or `#Ek.path` reference
pub fn is_step_ref(expr: &str) -> bool {
    full_ref_re().is_match(expr.trim())
}

/// Scan raw step input for `#Ek` tokens, in order of first appearance
pub fn find_refs(raw: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for caps in ref_token_re().captures_iter(raw) {
        let id = format!("E{}", &caps[1]);
        if !refs.contains(&id) {
            refs.push(id);
        }
    }
    refs
}

/// Walk a dotted path into a JSON value; missing segments yield null
///
/// Accepts `a.b.c`, `$.a.b.c`, or a bare `$`. Numeric segments index into
/// arrays.
pub fn get_by_path(value: &Value, path: &str) -> Value {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() || path == "$" {
        return value.clone();
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Resolve a single string expression
pub fn resolve_str(expr: &str, working: &RawInput, results: &ResultLog) -> Value {
    if expr == WORKING_INPUT_REF {
        return working.to_value();
    }
    if let Some(caps) = full_ref_re().captures(expr.trim()) {
        let id = format!("E{}", &caps[1]);
        let base = results
            .get(&id)
            .map(|result| result.output.clone())
            .unwrap_or(Value::Null);
        return match caps.get(2) {
            Some(path) => get_by_path(&base, path.as_str()),
            None => base,
        };
    }
    Value::String(expr.to_string())
}

/// Resolve references inside any JSON value
pub fn resolve(expr: &Value, working: &RawInput, results: &ResultLog) -> Value {
    match expr {
        Value::String(s) => resolve_str(s, working, results),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve(item, working, results))
                .collect(),
        ),
        Value::Object(map) => {
            let is_call_config =
                map.contains_key("agent") || map.contains_key("query") || map.contains_key("input");
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                if is_call_config && key != "input" {
                    out.insert(key.clone(), value.clone());
                } else {
                    out.insert(key.clone(), resolve(value, working, results));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
