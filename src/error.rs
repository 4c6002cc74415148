//! Error types for the gateway.
//!
//! Two layers are kept apart: [`ConnectorError`] is what drivers report, and
//! [`GatewayError`] is what the executor and the transports see. Driver
//! failures always reach callers as [`GatewayError::Execution`] or
//! [`GatewayError::Decode`].

use axum::http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the executor, the connector manager and the model loader.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown query or adapter.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Missing, unknown or uncoercible input.
    #[error("{message}")]
    Validation { field: String, message: String },

    /// Undefined environment variable or unresolved placeholder.
    #[error("{0}")]
    Substitution(String),

    /// Driver or transport failure while running a statement.
    #[error("{0}")]
    Execution(String),

    /// Row scan or marshalling failure.
    #[error("{0}")]
    Decode(String),

    /// One or more connectors failed to close.
    #[error("failed to close connectors: {}", errors.join("; "))]
    Close { errors: Vec<String> },

    /// Invalid model or server configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected invariant break.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a query-not-found error.
    pub fn query_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "query",
            name: name.into(),
        }
    }

    /// Create an adapter-not-found error.
    pub fn adapter_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "adapter",
            name: name.into(),
        }
    }

    /// Create a validation error for a field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create the error for a required input with neither argument nor default.
    pub fn missing_input(field: &str) -> Self {
        Self::validation(field, format!("required input '{field}' is missing"))
    }

    /// Create the error for an argument that no input declares.
    pub fn unknown_input(field: &str) -> Self {
        Self::validation(field, format!("unknown input '{field}'"))
    }

    /// Create a substitution error.
    pub fn substitution(msg: impl Into<String>) -> Self {
        Self::Substitution(msg.into())
    }

    /// Create an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status used by the query facade for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation { .. }
            | Self::Substitution(_)
            | Self::Execution(_)
            | Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Close { .. } | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the failure originated in the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Errors reported by a [`Connector`](crate::connector::Connector).
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Malformed statement for this store.
    #[error("malformed statement: {0}")]
    Parse(String),

    /// Could not establish the connection.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Driver or transport failure.
    #[error("execution failed: {0}")]
    Exec(String),

    /// Row could not be converted to the canonical value set.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Operation attempted after close.
    #[error("connector is closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,

    /// Releasing resources failed.
    #[error("close failed: {0}")]
    Close(String),
}

impl From<ConnectorError> for GatewayError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Decode(msg) => GatewayError::Decode(msg),
            other => GatewayError::Execution(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for ConnectorError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => ConnectorError::Exec(format!("{} ({})", db.message(), db.code().code())),
            None if e.is_closed() => ConnectorError::Closed,
            None => ConnectorError::Exec(e.to_string()),
        }
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for ConnectorError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match &e {
            Error::Server(token) => {
                ConnectorError::Exec(format!("{} (code {})", token.message(), token.code()))
            }
            Error::Io { .. } | Error::Tls(_) | Error::Routing { .. } => {
                ConnectorError::Connect(e.to_string())
            }
            Error::Conversion(_) | Error::Utf8 | Error::Utf16 => {
                ConnectorError::Decode(e.to_string())
            }
            _ => ConnectorError::Exec(e.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for ConnectorError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() {
            ConnectorError::Connect(e.to_string())
        } else {
            ConnectorError::Exec(e.to_string())
        }
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for ConnectorError {
    fn from(e: mongodb::error::Error) -> Self {
        ConnectorError::Exec(e.to_string())
    }
}
