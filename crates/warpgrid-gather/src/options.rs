//! Typed access to untyped gatherer options.
//!
//! Options arrive as a loose JSON-like map (usually straight from a TOML
//! table). Each accessor validates one key and turns every shape problem into
//! a [`GatherError::Config`] naming that key.

use std::time::Duration;

use serde_json::Value;

use crate::error::{GatherError, GatherResult};

/// Untyped per-gatherer options, keyed by option name.
pub type GathererOptions = serde_json::Map<String, Value>;

/// A non-empty string option.
pub fn required_str(opts: &GathererOptions, key: &str) -> GatherResult<String> {
    match opts.get(key) {
        None | Some(Value::Null) => Err(GatherError::config(key, "option is required")),
        Some(Value::String(s)) if s.is_empty() => {
            Err(GatherError::config(key, "option is required"))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(GatherError::config(
            key,
            format!("expected a string, got {}", type_name(other)),
        )),
    }
}

/// A non-empty list of strings. Element order is preserved.
pub fn required_str_list(opts: &GathererOptions, key: &str) -> GatherResult<Vec<String>> {
    let items = match opts.get(key) {
        None | Some(Value::Null) => return Err(GatherError::config(key, "option is required")),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(GatherError::config(
                key,
                format!("expected a list of strings, got {}", type_name(other)),
            ));
        }
    };

    if items.is_empty() {
        return Err(GatherError::config(key, "option is required"));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(s) if !s.is_empty() => Ok(s.clone()),
            Value::String(_) => Err(GatherError::config(key, format!("element {i} is empty"))),
            other => Err(GatherError::config(
                key,
                format!("element {i} must be a string, got {}", type_name(other)),
            )),
        })
        .collect()
}

/// An optional duration, given as `"500ms"`, `"5s"`, `"1m"` or a number of seconds.
pub fn optional_duration(opts: &GathererOptions, key: &str) -> GatherResult<Option<Duration>> {
    match opts.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_duration(s)
            .map(Some)
            .ok_or_else(|| GatherError::config(key, format!("invalid duration {s:?}"))),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| GatherError::config(key, format!("invalid duration {n}"))),
        Some(other) => Err(GatherError::config(
            key,
            format!("expected a duration, got {}", type_name(other)),
        )),
    }
}

/// Parse a duration string like "5s", "500ms", "1m". Overflow is `None`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a table",
    }
}
