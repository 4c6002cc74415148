//! Data-store connectors.
//!
//! A [`Connector`] executes one statement against one data source and returns
//! rows in the canonical [`Row`] shape. One implementation exists per
//! supported store, each behind a cargo feature:
//!
//! - `postgres`: relational, row-cursor style (`tokio-postgres`)
//! - `mssql`: relational, TDS (`tiberius`)
//! - `mongodb`: document commands
//! - `redis`: key-value commands
//!
//! The [`ConnectorManager`] owns every live connector and builds them through a
//! [`ConnectorFactory`], which lets tests substitute in-memory stores.

mod manager;
mod options;
pub mod types;

#[cfg(feature = "mongodb")]
mod mongo;
#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis_kv;

pub use manager::ConnectorManager;
pub use options::{fold_options, resolve_connection_string};
pub use types::{rows_to_json, Row, Value};

use crate::error::ConnectorError;
use crate::executor::ValidatedInputs;
use crate::model::{Adapter, ConnectorKind};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared handle to a live connector.
pub type SharedConnector = Arc<dyn Connector>;

/// Driver-facing capability: run one statement, release resources on close.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The store this connector talks to.
    fn kind(&self) -> ConnectorKind;

    /// Execute a fully substituted statement.
    ///
    /// `params` carries the validated inputs for stores that splice them
    /// themselves. The call must give up as soon as `cancel` fires.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        params: &ValidatedInputs,
    ) -> Result<Vec<Row>, ConnectorError>;

    /// Release every resource held by the connector.
    async fn close(&self) -> Result<(), ConnectorError>;
}

/// Builds connectors from adapter declarations.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self, adapter: &Adapter) -> Result<SharedConnector, ConnectorError>;
}

/// Factory backed by the real drivers compiled into this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverFactory;

#[async_trait]
impl ConnectorFactory for DriverFactory {
    async fn connect(&self, adapter: &Adapter) -> Result<SharedConnector, ConnectorError> {
        let conn_str = resolve_connection_string(adapter)?;
        info!(adapter = %adapter.name, kind = %adapter.kind, "Connecting adapter");

        match adapter.kind {
            #[cfg(feature = "postgres")]
            ConnectorKind::Postgres => Ok(Arc::new(
                postgres::PostgresConnector::connect(&conn_str).await?,
            )),
            #[cfg(feature = "mssql")]
            ConnectorKind::Mssql => Ok(Arc::new(mssql::MssqlConnector::connect(&conn_str).await?)),
            #[cfg(feature = "mongodb")]
            ConnectorKind::Mongodb => Ok(Arc::new(
                mongo::MongoConnector::connect(&conn_str).await?,
            )),
            #[cfg(feature = "redis")]
            ConnectorKind::Redis => Ok(Arc::new(redis_kv::RedisConnector::connect(&conn_str).await?)),
            #[allow(unreachable_patterns)]
            other => {
                let _ = conn_str;
                Err(ConnectorError::Connect(format!(
                    "connector '{other}' is not compiled into this build"
                )))
            }
        }
    }
}

/// Race a driver future against the caller's cancellation token.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ConnectorError>
where
    F: Future<Output = Result<T, ConnectorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
        res = fut => res,
    }
}

/// Open/closed flag shared by every connector implementation.
#[derive(Debug, Default)]
pub struct Lifecycle {
    closed: AtomicBool,
}

impl Lifecycle {
    /// Fail with [`ConnectorError::Closed`] once [`Lifecycle::close`] ran.
    pub fn ensure_open(&self) -> Result<(), ConnectorError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ConnectorError::Closed)
        } else {
            Ok(())
        }
    }

    /// Mark closed; returns false when it already was.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Truncate a statement for logging purposes.
pub(crate) fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
