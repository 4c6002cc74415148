//! Connection-string resolution.
//!
//! Adapter connection strings and option values may reference the environment
//! through `{{ env.NAME }}`. Options are then folded into the string in the
//! dialect of the target store; parameters already present always win.

use crate::error::ConnectorError;
use crate::executor::substitute::expand_env;
use crate::model::{Adapter, ConnectorKind};
use std::collections::BTreeMap;
use url::Url;

/// Expand the environment in an adapter's connection string and options, then
/// fold the options into the string.
pub fn resolve_connection_string(adapter: &Adapter) -> Result<String, ConnectorError> {
    let conn_str = expand_env(&adapter.connection_string)
        .map_err(|e| ConnectorError::Connect(format!("adapter '{}': {}", adapter.name, e)))?;

    let mut options = BTreeMap::new();
    for (key, value) in &adapter.options {
        let value = expand_env(value).map_err(|e| {
            ConnectorError::Connect(format!(
                "adapter '{}' option '{}': {}",
                adapter.name, key, e
            ))
        })?;
        options.insert(key.clone(), value);
    }

    fold_options(adapter.kind, &conn_str, &options)
}

/// Fold driver options into a connection string without overriding keys that
/// the string already sets.
pub fn fold_options(
    kind: ConnectorKind,
    conn_str: &str,
    options: &BTreeMap<String, String>,
) -> Result<String, ConnectorError> {
    if options.is_empty() {
        return Ok(conn_str.to_string());
    }

    match kind {
        ConnectorKind::Mssql => Ok(fold_ado(conn_str, options)),
        ConnectorKind::Postgres if !conn_str.contains("://") => {
            Ok(fold_key_value(conn_str, options))
        }
        ConnectorKind::Postgres | ConnectorKind::Mongodb | ConnectorKind::Redis => {
            fold_url(conn_str, options)
        }
    }
}

/// ADO style: `key=value;` pairs, keys compared case-insensitively.
fn fold_ado(conn_str: &str, options: &BTreeMap<String, String>) -> String {
    let present: Vec<String> = conn_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, _)| k.trim().to_lowercase())
        .collect();

    let mut out = conn_str.trim_end().to_string();
    if !out.is_empty() && !out.ends_with(';') {
        out.push(';');
    }
    for (key, value) in options {
        if present.contains(&key.to_lowercase()) {
            continue;
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push(';');
    }
    out
}

/// libpq style: whitespace-separated `key=value` pairs.
fn fold_key_value(conn_str: &str, options: &BTreeMap<String, String>) -> String {
    let present: Vec<&str> = conn_str
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, _)| k.trim())
        .collect();

    let mut out = conn_str.trim().to_string();
    for (key, value) in options {
        if present.contains(&key.as_str()) {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&quote_key_value(value));
    }
    out
}

fn quote_key_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn fold_url(conn_str: &str, options: &BTreeMap<String, String>) -> Result<String, ConnectorError> {
    let mut url = Url::parse(conn_str)
        .map_err(|e| ConnectorError::Connect(format!("invalid connection URL: {e}")))?;

    let present: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    let missing: Vec<(&String, &String)> = options
        .iter()
        .filter(|(k, _)| !present.contains(k))
        .collect();

    if !missing.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in missing {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}
