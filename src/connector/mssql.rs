//! SQL Server connector over `tiberius`.
//!
//! A TDS client runs one request at a time, so the client sits behind an
//! async mutex. A cancelled request leaves the wire in an unknown state; the
//! client is discarded and the next call reconnects.

use super::{run_cancellable, Connector, Lifecycle, Row, Value};
use crate::error::ConnectorError;
use crate::executor::ValidatedInputs;
use crate::model::ConnectorKind;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type TdsClient = Client<Compat<TcpStream>>;

pub struct MssqlConnector {
    config: Config,
    client: Mutex<Option<TdsClient>>,
    lifecycle: Lifecycle,
}

impl MssqlConnector {
    /// Connect using an ADO.NET style connection string.
    pub async fn connect(conn_str: &str) -> Result<Self, ConnectorError> {
        let config = Config::from_ado_string(conn_str)
            .map_err(|e| ConnectorError::Connect(format!("invalid connection string: {e}")))?;
        let client = open(&config).await?;
        Ok(Self {
            config,
            client: Mutex::new(Some(client)),
            lifecycle: Lifecycle::default(),
        })
    }
}

async fn open(config: &Config) -> Result<TdsClient, ConnectorError> {
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| ConnectorError::Connect(e.to_string()))?;
    tcp.set_nodelay(true)
        .map_err(|e| ConnectorError::Connect(e.to_string()))?;

    let client = Client::connect(config.clone(), tcp.compat_write()).await?;
    debug!("SQL Server connection established");
    Ok(client)
}

#[async_trait]
impl Connector for MssqlConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Mssql
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        _params: &ValidatedInputs,
    ) -> Result<Vec<Row>, ConnectorError> {
        self.lifecycle.ensure_open()?;
        let mut guard = self.client.lock().await;
        self.lifecycle.ensure_open()?;

        if guard.is_none() {
            *guard = Some(run_cancellable(cancel, open(&self.config)).await?);
        }
        let client = guard.as_mut().ok_or(ConnectorError::Closed)?;

        let result = run_cancellable(cancel, async move {
            let stream = client.simple_query(statement).await?;
            let rows = stream.into_first_result().await?;
            Ok::<_, ConnectorError>(rows.iter().map(convert_row).collect::<Vec<_>>())
        })
        .await;

        if let Err(e) = &result {
            if matches!(e, ConnectorError::Cancelled | ConnectorError::Connect(_)) {
                warn!("Discarding SQL Server client after {}", e);
                *guard = None;
            }
        }
        result
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        if !self.lifecycle.close() {
            return Ok(());
        }
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client
                .close()
                .await
                .map_err(|e| ConnectorError::Close(e.to_string()))?;
        }
        debug!("SQL Server connector closed");
        Ok(())
    }
}

fn convert_row(row: &tiberius::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| (col.name().to_string(), extract_column(row, idx)))
        .collect()
}

/// Try each supported type in order of likelihood.
fn extract_column(row: &tiberius::Row, idx: usize) -> Value {
    // Strings (most common)
    if let Some(v) = row.try_get::<&str, _>(idx).ok().flatten() {
        return Value::Text(v.to_string());
    }

    // Integers
    if let Some(v) = row.try_get::<i32, _>(idx).ok().flatten() {
        return Value::Integer(v.into());
    }
    if let Some(v) = row.try_get::<i64, _>(idx).ok().flatten() {
        return Value::Integer(v);
    }
    if let Some(v) = row.try_get::<i16, _>(idx).ok().flatten() {
        return Value::Integer(v.into());
    }
    // TINYINT is unsigned in tiberius
    if let Some(v) = row.try_get::<u8, _>(idx).ok().flatten() {
        return Value::Integer(v.into());
    }

    // Floating point
    if let Some(v) = row.try_get::<f64, _>(idx).ok().flatten() {
        return Value::Float(v);
    }
    if let Some(v) = row.try_get::<f32, _>(idx).ok().flatten() {
        return Value::Float(v.into());
    }

    if let Some(v) = row.try_get::<Decimal, _>(idx).ok().flatten() {
        return Value::Text(v.to_string());
    }

    if let Some(v) = row.try_get::<bool, _>(idx).ok().flatten() {
        return Value::Bool(v);
    }

    if let Some(v) = row.try_get::<Uuid, _>(idx).ok().flatten() {
        return Value::Text(v.to_string());
    }

    // Date/Time types
    if let Some(v) = row.try_get::<NaiveDateTime, _>(idx).ok().flatten() {
        return Value::from_naive(v);
    }
    if let Some(v) = row.try_get::<DateTime<Utc>, _>(idx).ok().flatten() {
        return Value::Timestamp(v);
    }
    if let Some(v) = row.try_get::<NaiveDate, _>(idx).ok().flatten() {
        return Value::from_date(v);
    }
    if let Some(v) = row.try_get::<NaiveTime, _>(idx).ok().flatten() {
        return Value::Text(v.to_string());
    }

    // Binary
    if let Some(v) = row.try_get::<&[u8], _>(idx).ok().flatten() {
        return Value::from_bytes(v);
    }

    // NULL, or a type with no canonical form
    Value::Null
}
