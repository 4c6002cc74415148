//! Declarative model: adapters, queries and their inputs.
//!
//! The model is loaded once (YAML or JSON) and treated as immutable; a reload
//! replaces it wholesale.

use crate::constants::DEFAULT_CACHE_TTL_SECS;
use crate::error::GatewayError;
use crate::executor::validate::coerce_default;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid name regex"));

/// The full declarative configuration of a gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    /// Server name reported on MCP initialize.
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Server version reported on MCP initialize.
    #[serde(default = "default_model_version")]
    pub version: String,

    #[serde(default)]
    pub defaults: ModelDefaults,

    #[serde(default)]
    pub adapters: Vec<Adapter>,

    #[serde(default)]
    pub queries: Vec<Query>,
}

fn default_model_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_model_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Model-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDefaults {
    #[serde(default)]
    pub cache: Option<CachePolicy>,
}

/// A named binding of a connector kind to connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adapter {
    pub name: String,

    #[serde(rename = "connector")]
    pub kind: ConnectorKind,

    pub connection_string: String,

    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Supported data stores. Model files may use the aliases accepted by
/// [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ConnectorKind {
    Postgres,
    Mssql,
    Mongodb,
    Redis,
}

impl ConnectorKind {
    /// Relational stores get SQL-literal rendering of inputs.
    pub fn is_relational(&self) -> bool {
        matches!(self, ConnectorKind::Postgres | ConnectorKind::Mssql)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Postgres => "postgres",
            ConnectorKind::Mssql => "mssql",
            ConnectorKind::Mongodb => "mongodb",
            ConnectorKind::Redis => "redis",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a connector kind fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseConnectorKindError(String);

impl fmt::Display for ParseConnectorKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid connector kind: '{}'", self.0)
    }
}

impl std::error::Error for ParseConnectorKindError {}

impl FromStr for ConnectorKind {
    type Err = ParseConnectorKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(ConnectorKind::Postgres),
            "mssql" | "sqlserver" | "sql-server" => Ok(ConnectorKind::Mssql),
            "mongodb" | "mongo" => Ok(ConnectorKind::Mongodb),
            "redis" => Ok(ConnectorKind::Redis),
            _ => Err(ParseConnectorKindError(s.to_string())),
        }
    }
}

impl TryFrom<String> for ConnectorKind {
    type Error = ParseConnectorKindError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A named, parameterised statement exposed as an endpoint and a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub inputs: Vec<Input>,

    pub statement: String,

    /// Adapter names; the first is authoritative.
    #[serde(rename = "use")]
    pub uses: Vec<String>,

    #[serde(default)]
    pub cache: Option<CachePolicy>,

    /// Free-form description of the returned rows.
    #[serde(default)]
    pub data: Option<String>,
}

impl Query {
    /// The authoritative adapter name, if any.
    pub fn adapter_name(&self) -> Option<&str> {
        self.uses.first().map(String::as_str)
    }

    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// A declared query input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub name: String,

    #[serde(rename = "type")]
    pub input_type: InputType,

    #[serde(default)]
    pub optional: bool,

    /// Default value as text, parsed according to `input_type`.
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub default: Option<String>,

    #[serde(default)]
    pub description: String,
}

impl Input {
    pub fn is_required(&self) -> bool {
        !self.optional
    }
}

/// Primitive input types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Int,
    Float,
    Boolean,
    Datetime,
    Uuid,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Int => "int",
            InputType::Float => "float",
            InputType::Boolean => "boolean",
            InputType::Datetime => "datetime",
            InputType::Uuid => "uuid",
        }
    }

    /// JSON-schema type used in tool listings.
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            InputType::String | InputType::Datetime | InputType::Uuid => "string",
            InputType::Int => "integer",
            InputType::Float => "number",
            InputType::Boolean => "boolean",
        }
    }

    /// JSON-schema `format` hint, if any.
    pub fn json_schema_format(&self) -> Option<&'static str> {
        match self {
            InputType::Datetime => Some("date-time"),
            InputType::Uuid => Some("uuid"),
            _ => None,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache policy; either field may be overridden independently per query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Time-to-live in seconds.
    #[serde(default)]
    pub ttl: Option<i64>,
}

/// The policy actually applied to one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveCachePolicy {
    pub enabled: bool,
    pub ttl_seconds: i64,
}

impl EffectiveCachePolicy {
    /// Caching is active only when enabled with a positive TTL.
    pub fn is_active(&self) -> bool {
        self.enabled && self.ttl_seconds > 0
    }
}

impl Model {
    /// Load a model from a YAML or JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("failed to read model '{}': {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a model from YAML (JSON is accepted as YAML).
    pub fn from_yaml_str(text: &str) -> Result<Self, GatewayError> {
        let model: Model = serde_yaml::from_str(text)
            .map_err(|e| GatewayError::config(format!("invalid model: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn adapter(&self, name: &str) -> Option<&Adapter> {
        self.adapters.iter().find(|a| a.name == name)
    }

    /// Resolve the cache policy for a query: query-level fields override
    /// model-level ones, and absent fields fall back to disabled / default TTL.
    pub fn effective_cache_policy(&self, query: &Query) -> EffectiveCachePolicy {
        let model = self.defaults.cache.unwrap_or_default();
        let query = query.cache.unwrap_or_default();
        EffectiveCachePolicy {
            enabled: query.enabled.or(model.enabled).unwrap_or(false),
            ttl_seconds: query.ttl.or(model.ttl).unwrap_or(DEFAULT_CACHE_TTL_SECS),
        }
    }

    /// Check the structural invariants of the model.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut adapter_names = HashSet::new();
        for adapter in &self.adapters {
            check_name("adapter", &adapter.name)?;
            if !adapter_names.insert(adapter.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "duplicate adapter name '{}'",
                    adapter.name
                )));
            }
            if adapter.connection_string.trim().is_empty() {
                return Err(GatewayError::config(format!(
                    "adapter '{}' has an empty connection string",
                    adapter.name
                )));
            }
        }

        let mut query_names = HashSet::new();
        for query in &self.queries {
            check_name("query", &query.name)?;
            if !query_names.insert(query.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "duplicate query name '{}'",
                    query.name
                )));
            }

            if query.uses.is_empty() {
                return Err(GatewayError::config(format!(
                    "query '{}' does not use any adapter",
                    query.name
                )));
            }
            for used in &query.uses {
                if !adapter_names.contains(used.as_str()) {
                    return Err(GatewayError::config(format!(
                        "query '{}' uses unknown adapter '{}'",
                        query.name, used
                    )));
                }
            }
            if query.statement.trim().is_empty() {
                return Err(GatewayError::config(format!(
                    "query '{}' has an empty statement",
                    query.name
                )));
            }

            let mut input_names = HashSet::new();
            for input in &query.inputs {
                if !input_names.insert(input.name.as_str()) {
                    return Err(GatewayError::config(format!(
                        "query '{}' declares input '{}' twice",
                        query.name, input.name
                    )));
                }
                if let Some(default) = &input.default {
                    coerce_default(input, default).map_err(|e| {
                        GatewayError::config(format!(
                            "query '{}' input '{}' has an invalid default: {}",
                            query.name, input.name, e
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}

/// Accept any YAML scalar for a default and keep its textual form.
fn scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "default must be a scalar, got {other:?}"
        ))),
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), GatewayError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(GatewayError::config(format!(
            "{kind} name '{name}' must match [A-Za-z0-9_-]+"
        )))
    }
}
