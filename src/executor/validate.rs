//! Input validation and coercion.
//!
//! Arguments arrive as JSON-encoded strings keyed by input name. Text that is
//! not valid JSON is taken as a bare string, so callers may pass `42` or
//! `"42"` interchangeably for a string input.

use crate::error::GatewayError;
use crate::model::{Input, InputType, Query};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, Timelike, Utc};
use std::collections::{BTreeMap, HashMap};

/// Validated, typed inputs keyed by name.
pub type ValidatedInputs = BTreeMap<String, InputValue>;

/// A coerced input value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(DateTime<FixedOffset>),
}

impl InputValue {
    /// Render as a SQL literal.
    pub fn render_relational(&self) -> String {
        match self {
            InputValue::Null => "NULL".to_string(),
            InputValue::String(s) => quote_sql(s),
            InputValue::Int(v) => v.to_string(),
            InputValue::Float(v) => v.to_string(),
            InputValue::Bool(v) => v.to_string(),
            InputValue::DateTime(dt) => {
                let naive = dt.naive_local();
                if naive.time().num_seconds_from_midnight() == 0 && naive.nanosecond() == 0 {
                    quote_sql(&naive.format("%Y-%m-%d").to_string())
                } else {
                    quote_sql(&naive.format("%Y-%m-%d %H:%M:%S").to_string())
                }
            }
        }
    }

    /// Render as bare text for stores that take commands rather than SQL.
    pub fn render_raw(&self) -> String {
        match self {
            InputValue::Null => "null".to_string(),
            InputValue::String(s) => s.clone(),
            InputValue::Int(v) => v.to_string(),
            InputValue::Float(v) => v.to_string(),
            InputValue::Bool(v) => v.to_string(),
            InputValue::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }

    /// JSON form, used when advertising typed defaults.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            InputValue::Null => serde_json::Value::Null,
            InputValue::String(s) => serde_json::Value::String(s.clone()),
            InputValue::Int(v) => serde_json::Value::from(*v),
            InputValue::Float(v) => serde_json::Value::from(*v),
            InputValue::Bool(v) => serde_json::Value::Bool(*v),
            InputValue::DateTime(_) => serde_json::Value::String(self.render_raw()),
        }
    }
}

fn quote_sql(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Validate caller arguments against a query's declared inputs.
///
/// Unknown names are rejected, required inputs must be present (directly or
/// through a default), and optional inputs without a value or default resolve
/// to [`InputValue::Null`]. An explicit JSON `null` counts as absent.
pub fn validate(query: &Query, args: &HashMap<String, String>) -> Result<ValidatedInputs, GatewayError> {
    let mut unknown: Vec<&String> = args.keys().filter(|k| query.input(k).is_none()).collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(GatewayError::unknown_input(unknown[0]));
    }

    let mut validated = ValidatedInputs::new();
    for input in &query.inputs {
        let provided = args
            .get(&input.name)
            .map(|raw| decode_argument(raw))
            .filter(|value| !value.is_null());
        let value = match provided {
            Some(value) => coerce(input, &value)?,
            None => match &input.default {
                Some(default) => coerce_default(input, default)?,
                None if input.is_required() => {
                    return Err(GatewayError::missing_input(&input.name));
                }
                None => InputValue::Null,
            },
        };
        validated.insert(input.name.clone(), value);
    }

    Ok(validated)
}

/// Coerce a model-declared default (kept as text) to its input type.
pub fn coerce_default(input: &Input, default: &str) -> Result<InputValue, GatewayError> {
    coerce(input, &serde_json::Value::String(default.to_string()))
}

fn decode_argument(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Coerce one JSON value to the declared type of `input`.
pub fn coerce(input: &Input, value: &serde_json::Value) -> Result<InputValue, GatewayError> {
    use serde_json::Value as Json;

    let fail = |reason: &str| {
        GatewayError::validation(
            &input.name,
            format!("input '{}' {}", input.name, reason),
        )
    };

    if value.is_null() {
        return Ok(InputValue::Null);
    }

    match input.input_type {
        InputType::String => match value {
            Json::String(s) => Ok(InputValue::String(s.clone())),
            Json::Number(n) => Ok(InputValue::String(n.to_string())),
            Json::Bool(b) => Ok(InputValue::String(b.to_string())),
            _ => Err(fail("must be a scalar")),
        },
        InputType::Int => match value {
            Json::Number(n) => match n.as_i64() {
                Some(v) => Ok(InputValue::Int(v)),
                None => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| InputValue::Int(f as i64))
                    .ok_or_else(|| fail("must be an integer")),
            },
            Json::String(s) => s
                .trim()
                .parse::<i64>()
                .map(InputValue::Int)
                .map_err(|_| fail("must be an integer")),
            _ => Err(fail("must be an integer")),
        },
        InputType::Float => match value {
            Json::Number(n) => n
                .as_f64()
                .map(InputValue::Float)
                .ok_or_else(|| fail("must be a number")),
            Json::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(InputValue::Float)
                .ok_or_else(|| fail("must be a number")),
            _ => Err(fail("must be a number")),
        },
        InputType::Boolean => match value {
            Json::Bool(b) => Ok(InputValue::Bool(*b)),
            Json::Number(n) => Ok(InputValue::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Json::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(InputValue::Bool(true)),
                "false" => Ok(InputValue::Bool(false)),
                _ => Err(fail("must be a boolean")),
            },
            _ => Err(fail("must be a boolean")),
        },
        InputType::Datetime => match value {
            Json::String(s) => parse_datetime(s.trim())
                .map(InputValue::DateTime)
                .ok_or_else(|| fail("must be an RFC 3339 datetime or YYYY-MM-DD[ HH:MM:SS]")),
            _ => Err(fail("must be a datetime string")),
        },
        InputType::Uuid => match value {
            Json::String(s) => Ok(InputValue::String(s.clone())),
            _ => Err(fail("must be a string")),
        },
    }
}

/// Accept RFC 3339, ISO-8601 without offset, `YYYY-MM-DD HH:MM:SS` and
/// date-only forms. Values without an offset are taken as UTC.
fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().fixed_offset());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).fixed_offset())
}
