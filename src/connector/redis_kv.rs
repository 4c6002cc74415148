//! Redis connector.
//!
//! A statement is one whitespace-separated command, e.g. `HGETALL user:42`.
//! The reply comes back as a single row: `{"values": [...]}` for
//! collection replies, `{"value": ...}` for everything else.

use super::{run_cancellable, Connector, Lifecycle, Row, Value};
use crate::error::ConnectorError;
use crate::executor::ValidatedInputs;
use crate::model::ConnectorKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct RedisConnector {
    conn: Mutex<Option<ConnectionManager>>,
    lifecycle: Lifecycle,
}

impl RedisConnector {
    /// Connect using a `redis://` URL.
    pub async fn connect(conn_str: &str) -> Result<Self, ConnectorError> {
        let client = redis::Client::open(conn_str)
            .map_err(|e| ConnectorError::Connect(format!("invalid connection URL: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;
        debug!("Redis connection established");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            lifecycle: Lifecycle::default(),
        })
    }
}

/// Split a command line into a redis command.
pub(crate) fn parse_command(statement: &str) -> Result<redis::Cmd, ConnectorError> {
    let mut parts = statement.split_whitespace();
    let name = parts
        .next()
        .ok_or_else(|| ConnectorError::Parse("empty command".to_string()))?;
    let mut cmd = redis::cmd(&name.to_uppercase());
    for arg in parts {
        cmd.arg(arg);
    }
    Ok(cmd)
}

#[async_trait]
impl Connector for RedisConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Redis
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        _params: &ValidatedInputs,
    ) -> Result<Vec<Row>, ConnectorError> {
        self.lifecycle.ensure_open()?;
        let cmd = parse_command(statement)?;
        let mut conn = self.conn.lock().clone().ok_or(ConnectorError::Closed)?;

        let reply = run_cancellable(cancel, async {
            let reply: redis::Value = cmd.query_async(&mut conn).await?;
            Ok(reply)
        })
        .await?;
        Ok(vec![wrap_reply(reply)])
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        if self.lifecycle.close() {
            self.conn.lock().take();
            debug!("Redis connector closed");
        }
        Ok(())
    }
}

fn wrap_reply(reply: redis::Value) -> Row {
    let mut row = Row::new();
    match reply {
        redis::Value::Array(items) | redis::Value::Set(items) => {
            row.insert("values", Value::List(items.into_iter().map(convert).collect()));
        }
        other => row.insert("value", convert(other)),
    }
    row
}

fn convert(value: redis::Value) -> Value {
    use redis::Value as R;

    match value {
        R::Nil => Value::Null,
        R::Int(v) => Value::Integer(v),
        R::Double(v) => Value::Float(v),
        R::Boolean(v) => Value::Bool(v),
        R::Okay => Value::Text("OK".to_string()),
        R::SimpleString(s) => Value::Text(s),
        R::BulkString(bytes) => Value::from_bytes(&bytes),
        R::VerbatimString { text, .. } => Value::Text(text),
        R::Array(items) | R::Set(items) => Value::List(items.into_iter().map(convert).collect()),
        R::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (convert(k).to_display_string(), convert(v)))
                .collect(),
        ),
        other => Value::Text(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let cmd = parse_command("  get   user:42 ").unwrap();
        let packed = String::from_utf8(cmd.get_packed_command()).unwrap();
        assert_eq!(packed, "*2\r\n$3\r\nGET\r\n$7\r\nuser:42\r\n");
        assert!(matches!(parse_command("   "), Err(ConnectorError::Parse(_))));
    }

    #[test]
    fn test_wrap_scalar_reply() {
        let row = wrap_reply(redis::Value::BulkString(b"alice".to_vec()));
        assert_eq!(row.get("value"), Some(&Value::from("alice")));

        let row = wrap_reply(redis::Value::Nil);
        assert_eq!(row.get("value"), Some(&Value::Null));
    }

    #[test]
    fn test_wrap_collection_reply() {
        let row = wrap_reply(redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::BulkString(b"b".to_vec()),
        ]));
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"values":[1,"b"]}"#
        );
    }

    #[test]
    fn test_map_reply() {
        let row = wrap_reply(redis::Value::Map(vec![(
            redis::Value::SimpleString("name".into()),
            redis::Value::BulkString(b"a".to_vec()),
        )]));
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"value":{"name":"a"}}"#
        );
    }
}
