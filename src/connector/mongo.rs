//! MongoDB connector.
//!
//! A statement is a JSON object `{"database": ..., "command": {...}}`. The
//! command is sent as-is through `runCommand`, so its first key names the
//! operation and key order is kept exactly as written.

use super::{run_cancellable, Connector, Lifecycle, Row, Value};
use crate::error::ConnectorError;
use crate::executor::ValidatedInputs;
use crate::model::ConnectorKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};
use mongodb::Client;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct MongoConnector {
    client: Mutex<Option<Client>>,
    lifecycle: Lifecycle,
}

/// Parsed document-store statement.
#[derive(Debug, Deserialize)]
pub(crate) struct MongoStatement {
    pub database: String,
    pub command: Document,
}

impl MongoStatement {
    pub(crate) fn parse(statement: &str) -> Result<Self, ConnectorError> {
        let parsed: MongoStatement = serde_json::from_str(statement)
            .map_err(|e| ConnectorError::Parse(format!("invalid document command: {e}")))?;
        if parsed.database.is_empty() {
            return Err(ConnectorError::Parse("'database' must not be empty".into()));
        }
        if parsed.command.is_empty() {
            return Err(ConnectorError::Parse("'command' must not be empty".into()));
        }
        Ok(parsed)
    }
}

impl MongoConnector {
    /// Connect using a `mongodb://` or `mongodb+srv://` URI.
    pub async fn connect(conn_str: &str) -> Result<Self, ConnectorError> {
        let client = Client::with_uri_str(conn_str)
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;
        debug!("MongoDB client created");
        Ok(Self {
            client: Mutex::new(Some(client)),
            lifecycle: Lifecycle::default(),
        })
    }
}

#[async_trait]
impl Connector for MongoConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Mongodb
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        _params: &ValidatedInputs,
    ) -> Result<Vec<Row>, ConnectorError> {
        self.lifecycle.ensure_open()?;
        let parsed = MongoStatement::parse(statement)?;
        let client = self.client.lock().clone().ok_or(ConnectorError::Closed)?;

        let reply = run_cancellable(cancel, async {
            let reply = client
                .database(&parsed.database)
                .run_command(parsed.command)
                .await?;
            Ok(reply)
        })
        .await?;

        Ok(reply_rows(reply))
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        if !self.lifecycle.close() {
            return Ok(());
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.shutdown().await;
        }
        debug!("MongoDB connector closed");
        Ok(())
    }
}

/// Cursor replies yield their first batch; anything else is a single row.
fn reply_rows(mut reply: Document) -> Vec<Row> {
    if let Ok(cursor) = reply.get_document_mut("cursor") {
        if let Some(Bson::Array(batch)) = cursor.remove("firstBatch") {
            return batch
                .into_iter()
                .map(|doc| match doc {
                    Bson::Document(doc) => document_to_row(doc),
                    other => [("value", convert(other))].into_iter().collect(),
                })
                .collect();
        }
    }
    vec![document_to_row(reply)]
}

fn document_to_row(doc: Document) -> Row {
    doc.into_iter().map(|(k, v)| (k, convert(v))).collect()
}

fn convert(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(v) => Value::Bool(v),
        Bson::Int32(v) => Value::Integer(v.into()),
        Bson::Int64(v) => Value::Integer(v),
        Bson::Double(v) => Value::Float(v),
        Bson::String(s) => Value::Text(s),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::Decimal128(d) => Value::Text(d.to_string()),
        Bson::Binary(bin) => Value::from_bytes(&bin.bytes),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        Bson::Document(doc) => Value::Map(document_to_row(doc)),
        Bson::Array(items) => Value::List(items.into_iter().map(convert).collect()),
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn test_parse_keeps_key_order() {
        let stmt = MongoStatement::parse(
            r#"{"database":"app","command":{"find":"users","filter":{"age":{"$gt":30}},"limit":5}}"#,
        )
        .unwrap();
        assert_eq!(stmt.database, "app");
        let keys: Vec<&str> = stmt.command.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["find", "filter", "limit"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            MongoStatement::parse("find users"),
            Err(ConnectorError::Parse(_))
        ));
        assert!(matches!(
            MongoStatement::parse(r#"{"database":"app","command":{}}"#),
            Err(ConnectorError::Parse(_))
        ));
    }

    #[test]
    fn test_cursor_reply_yields_first_batch() {
        let oid = ObjectId::new();
        let reply = doc! {
            "cursor": {
                "firstBatch": [ { "_id": oid, "name": "a" }, { "_id": 2, "name": "b" } ],
                "id": 0_i64,
                "ns": "app.users",
            },
            "ok": 1.0,
        };
        let rows = reply_rows(reply);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("_id"), Some(&Value::Text(oid.to_hex())));
        assert_eq!(rows[1].get("name"), Some(&Value::from("b")));
    }

    #[test]
    fn test_plain_reply_is_one_row() {
        let rows = reply_rows(doc! { "n": 3, "ok": 1.0 });
        assert_eq!(rows.len(), 1);
        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"n":3,"ok":1.0}"#
        );
    }
}
