//! In-memory connectors shared by the HTTP and RPC test suites.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use terse_gateway::connector::{Connector, Row, SharedConnector, Value};
use terse_gateway::error::ConnectorError;
use terse_gateway::executor::ValidatedInputs;
use terse_gateway::model::{Adapter, ConnectorKind};
use terse_gateway::{Config, Gateway, Model};
use tokio_util::sync::CancellationToken;

pub const MODEL: &str = r#"
name: test-gateway
version: 0.9.0
adapters:
  - { name: pg, connector: postgres, connection_string: "postgres://localhost/app" }
queries:
  - name: get-user-by-id
    description: Fetch a user by id
    use: [pg]
    statement: "SELECT id, name FROM users WHERE id = {{ inputs.userId }}"
    inputs:
      - { name: userId, type: string, optional: false, description: "User id" }
  - name: cached-user
    description: Cached lookup
    use: [pg]
    statement: "SELECT id, name FROM users WHERE id = {{ inputs.userId }}"
    inputs:
      - { name: userId, type: string }
    cache: { enabled: true, ttl: 60 }
  - name: failing
    use: [pg]
    statement: "FAIL"
"#;

/// Everything the fake connectors observed.
#[derive(Default)]
pub struct Recorder {
    pub calls: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
    closes: Mutex<HashMap<String, usize>>,
}

impl Recorder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_statement(&self) -> Option<String> {
        self.statements.lock().last().cloned()
    }

    pub fn closes(&self, adapter: &str) -> usize {
        self.closes.lock().get(adapter).copied().unwrap_or(0)
    }
}

struct FakeConnector {
    adapter: String,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Connector for FakeConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Postgres
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        statement: &str,
        _params: &ValidatedInputs,
    ) -> Result<Vec<Row>, ConnectorError> {
        self.recorder.calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.statements.lock().push(statement.to_string());
        tokio::task::yield_now().await;

        if statement == "FAIL" {
            return Err(ConnectorError::Exec("relation \"nope\" does not exist".into()));
        }
        Ok(vec![[("id", Value::Integer(42)), ("name", Value::from("a"))]
            .into_iter()
            .collect()])
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        *self
            .recorder
            .closes
            .lock()
            .entry(self.adapter.clone())
            .or_default() += 1;
        Ok(())
    }
}

/// Factory handing out fake connectors; adapters named `broken*` fail.
pub struct FakeFactory(pub Arc<Recorder>);

#[async_trait]
impl terse_gateway::ConnectorFactory for FakeFactory {
    async fn connect(&self, adapter: &Adapter) -> Result<SharedConnector, ConnectorError> {
        if adapter.name.starts_with("broken") {
            return Err(ConnectorError::Connect("connection refused".into()));
        }
        Ok(Arc::new(FakeConnector {
            adapter: adapter.name.clone(),
            recorder: Arc::clone(&self.0),
        }))
    }
}

pub async fn start_gateway(model: &str) -> (Gateway, Arc<Recorder>) {
    start_gateway_with(model, Config::new("model.yaml")).await
}

pub async fn start_gateway_with(model: &str, config: Config) -> (Gateway, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let gateway = Gateway::start(
        Model::from_yaml_str(model).unwrap(),
        Arc::new(FakeFactory(Arc::clone(&recorder))),
        &config,
    )
    .await
    .unwrap();
    (gateway, recorder)
}
