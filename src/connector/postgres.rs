//! PostgreSQL connector over `tokio-postgres`.
//!
//! One pipelined client is shared by all callers. When the server drops the
//! connection the client is replaced on the next call.

use super::{run_cancellable, Connector, Lifecycle, Row, Value};
use crate::error::ConnectorError;
use crate::executor::ValidatedInputs;
use crate::model::ConnectorKind;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, NoTls, Row as PgRow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct PostgresConnector {
    conn_str: String,
    client: Mutex<Option<Arc<Client>>>,
    lifecycle: Lifecycle,
}

impl PostgresConnector {
    /// Connect using a URL or key/value connection string.
    pub async fn connect(conn_str: &str) -> Result<Self, ConnectorError> {
        let client = open(conn_str).await?;
        Ok(Self {
            conn_str: conn_str.to_string(),
            client: Mutex::new(Some(Arc::new(client))),
            lifecycle: Lifecycle::default(),
        })
    }

    /// Current client, reopened when the server has dropped the connection.
    async fn client(&self, cancel: &CancellationToken) -> Result<Arc<Client>, ConnectorError> {
        self.lifecycle.ensure_open()?;
        let mut guard = self.client.lock().await;
        self.lifecycle.ensure_open()?;

        match guard.as_ref() {
            Some(client) if !client.is_closed() => return Ok(Arc::clone(client)),
            Some(_) => warn!("Postgres connection lost, reconnecting"),
            None => {}
        }

        let client = Arc::new(run_cancellable(cancel, open(&self.conn_str)).await?);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn discard(&self, stale: &Arc<Client>) {
        let mut guard = self.client.lock().await;
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *guard = None;
        }
    }
}

async fn open(conn_str: &str) -> Result<Client, ConnectorError> {
    let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
        .await
        .map_err(|e| ConnectorError::Connect(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Postgres connection error: {}", e);
        }
    });

    debug!("Postgres connection established");
    Ok(client)
}

#[async_trait]
impl Connector for PostgresConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Postgres
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        _params: &ValidatedInputs,
    ) -> Result<Vec<Row>, ConnectorError> {
        let client = self.client(cancel).await?;

        let result = run_cancellable(cancel, async {
            let rows = client.query(statement, &[]).await?;
            rows.iter().map(convert_row).collect::<Result<Vec<_>, _>>()
        })
        .await;

        match &result {
            Err(ConnectorError::Cancelled) => {
                // Best effort: ask the server to stop the running statement.
                if let Err(e) = client.cancel_token().cancel_query(NoTls).await {
                    warn!("Failed to cancel Postgres query: {}", e);
                }
            }
            Err(ConnectorError::Closed) => self.discard(&client).await,
            _ => {}
        }
        result
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        if self.lifecycle.close() {
            // Dropping the last client handle ends the connection task.
            self.client.lock().await.take();
            debug!("Postgres connector closed");
        }
        Ok(())
    }
}

fn convert_row(row: &PgRow) -> Result<Row, ConnectorError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name(), convert_value(row, idx, column.type_())?);
    }
    Ok(out)
}

fn get<'a, T: FromSql<'a>>(row: &'a PgRow, idx: usize) -> Result<Option<T>, ConnectorError> {
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| ConnectorError::Decode(format!("column {idx}: {e}")))
}

fn map<'a, T: FromSql<'a>>(
    row: &'a PgRow,
    idx: usize,
    f: impl FnOnce(T) -> Value,
) -> Result<Value, ConnectorError> {
    Ok(get::<T>(row, idx)?.map(f).unwrap_or(Value::Null))
}

fn list<'a, T: FromSql<'a>>(
    row: &'a PgRow,
    idx: usize,
    f: impl Fn(T) -> Value,
) -> Result<Value, ConnectorError> {
    Ok(match get::<Vec<Option<T>>>(row, idx)? {
        Some(items) => Value::List(
            items
                .into_iter()
                .map(|item| item.map(&f).unwrap_or(Value::Null))
                .collect(),
        ),
        None => Value::Null,
    })
}

fn convert_value(row: &PgRow, idx: usize, ty: &Type) -> Result<Value, ConnectorError> {
    match *ty {
        Type::BOOL => map::<bool>(row, idx, Value::Bool),
        Type::INT2 => map::<i16>(row, idx, |v| Value::Integer(v.into())),
        Type::INT4 => map::<i32>(row, idx, |v| Value::Integer(v.into())),
        Type::INT8 => map::<i64>(row, idx, Value::Integer),
        Type::OID => map::<u32>(row, idx, |v| Value::Integer(v.into())),
        Type::FLOAT4 => map::<f32>(row, idx, |v| Value::Float(v.into())),
        Type::FLOAT8 => map::<f64>(row, idx, Value::Float),
        Type::NUMERIC => map::<Decimal>(row, idx, |v| Value::Text(v.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            map::<String>(row, idx, Value::Text)
        }
        Type::BYTEA => map::<Vec<u8>>(row, idx, |v| Value::from_bytes(&v)),
        Type::TIMESTAMP => map::<NaiveDateTime>(row, idx, Value::from_naive),
        Type::TIMESTAMPTZ => map::<DateTime<Utc>>(row, idx, Value::Timestamp),
        Type::DATE => map::<NaiveDate>(row, idx, Value::from_date),
        Type::TIME => map::<NaiveTime>(row, idx, |v| Value::Text(v.to_string())),
        Type::UUID => map::<Uuid>(row, idx, |v| Value::Text(v.to_string())),
        Type::JSON | Type::JSONB => map::<serde_json::Value>(row, idx, Value::from),
        Type::BOOL_ARRAY => list::<bool>(row, idx, Value::Bool),
        Type::INT4_ARRAY => list::<i32>(row, idx, |v| Value::Integer(v.into())),
        Type::INT8_ARRAY => list::<i64>(row, idx, Value::Integer),
        Type::FLOAT8_ARRAY => list::<f64>(row, idx, Value::Float),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => list::<String>(row, idx, Value::Text),
        _ => Err(ConnectorError::Decode(format!(
            "unsupported column type '{}' at index {}",
            ty.name(),
            idx
        ))),
    }
}
