//! Query execution pipeline.
//!
//! One call runs, in order: query lookup, input validation, environment
//! expansion, input splicing, cache probe, connector execution and cache
//! admission.

pub mod substitute;
pub mod validate;

pub use substitute::{expand_env, splice, RenderMode};
pub use validate::{validate, InputValue, ValidatedInputs};

use crate::cache::{fingerprint, SharedCache};
use crate::connector::{truncate_for_log, ConnectorManager, Row};
use crate::constants::LOG_STATEMENT_TRUNCATE_LENGTH;
use crate::error::GatewayError;
use crate::model::Model;
use crate::telemetry::{QueryTimer, SharedMetrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Runs named queries against one model generation.
#[derive(Debug, Clone)]
pub struct Executor {
    model: Arc<Model>,
    connectors: Arc<ConnectorManager>,
    cache: SharedCache,
    metrics: SharedMetrics,
}

impl Executor {
    pub fn new(
        model: Arc<Model>,
        connectors: Arc<ConnectorManager>,
        cache: SharedCache,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            model,
            connectors,
            cache,
            metrics,
        }
    }

    /// The model this executor serves.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Execute `query_name` with JSON-encoded arguments keyed by input name.
    ///
    /// A cancelled execution never writes to the cache.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        query_name: &str,
        args: &HashMap<String, String>,
    ) -> Result<Vec<Row>, GatewayError> {
        let span = info_span!("executor.execute", tool = %query_name);
        let timer = QueryTimer::start(Arc::clone(&self.metrics), query_name);

        let result = self.run(cancel, query_name, args).instrument(span).await;

        let duration = timer.stop(result.is_ok());
        match &result {
            Ok(rows) => debug!(
                tool = %query_name,
                rows = rows.len(),
                elapsed_ms = duration.as_millis() as u64,
                "Query executed"
            ),
            Err(e) => warn!(tool = %query_name, "Query failed: {}", e),
        }
        result
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        query_name: &str,
        args: &HashMap<String, String>,
    ) -> Result<Vec<Row>, GatewayError> {
        let query = self
            .model
            .query(query_name)
            .ok_or_else(|| GatewayError::query_not_found(query_name))?;

        let validated = validate(query, args)?;

        let adapter_name = query
            .adapter_name()
            .ok_or_else(|| GatewayError::validation("use", "query does not use any adapter"))?;
        let adapter = self
            .model
            .adapter(adapter_name)
            .ok_or_else(|| GatewayError::adapter_not_found(adapter_name))?;

        let expanded = expand_env(&query.statement)?;
        let statement = splice(&expanded, &validated, RenderMode::for_kind(adapter.kind))?;
        debug!(
            statement = %truncate_for_log(&statement, LOG_STATEMENT_TRUNCATE_LENGTH),
            "Statement prepared"
        );

        let policy = self.model.effective_cache_policy(query);
        let key = policy
            .is_active()
            .then(|| fingerprint(query_name, &statement));

        if let Some(key) = &key {
            if let Some(rows) = self.cache.get(key).await {
                self.metrics.record_cache_hit();
                debug!("Cache hit");
                return Ok(rows);
            }
            self.metrics.record_cache_miss();
        }

        let connector = self
            .connectors
            .get(adapter_name)
            .ok_or_else(|| GatewayError::adapter_not_found(adapter_name))?;

        let rows = connector.execute(cancel, &statement, &validated).await?;

        if let Some(key) = key {
            if cancel.is_cancelled() {
                debug!("Execution cancelled; skipping cache admission");
            } else {
                // ttl is positive per is_active()
                let ttl = Duration::from_secs(policy.ttl_seconds.unsigned_abs());
                self.cache.set(key, &rows, ttl).await;
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::connector::{Connector, ConnectorFactory, SharedConnector, Value};
    use crate::error::ConnectorError;
    use crate::model::{Adapter, ConnectorKind};
    use crate::telemetry::new_shared_metrics;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MODEL: &str = r#"
adapters:
  - { name: pg, connector: postgres, connection_string: "postgres://localhost/app" }
queries:
  - name: get-user-by-id
    use: [pg]
    statement: "SELECT id, name FROM users WHERE id = {{ inputs.userId }}"
    inputs:
      - { name: userId, type: string }
  - name: cached-user
    use: [pg]
    statement: "SELECT id, name FROM users WHERE id = {{ inputs.userId }}"
    inputs:
      - { name: userId, type: string }
    cache: { enabled: true, ttl: 60 }
  - name: ghost
    use: [pg]
    statement: "SELECT {{ inputs.nothing }}"
"#;

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        statements: Mutex<Vec<String>>,
    }

    struct FakeConnector(Arc<Recorder>);

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
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.statements.lock().push(statement.to_string());
            tokio::task::yield_now().await;
            Ok(vec![[("id", Value::Integer(42)), ("name", Value::from("a"))]
                .into_iter()
                .collect()])
        }

        async fn close(&self) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    struct FakeFactory(Arc<Recorder>);

    #[async_trait]
    impl ConnectorFactory for FakeFactory {
        async fn connect(&self, _adapter: &Adapter) -> Result<SharedConnector, ConnectorError> {
            Ok(Arc::new(FakeConnector(Arc::clone(&self.0))))
        }
    }

    async fn executor() -> (Executor, Arc<Recorder>, SharedCache) {
        let model = Arc::new(Model::from_yaml_str(MODEL).unwrap());
        let recorder = Arc::new(Recorder::default());
        let manager = Arc::new(ConnectorManager::new(Arc::new(FakeFactory(Arc::clone(
            &recorder,
        )))));
        manager.initialize_all(&model.adapters).await.unwrap();
        let cache = Arc::new(ResultCache::new(16));
        let exec = Executor::new(model, manager, Arc::clone(&cache), new_shared_metrics());
        (exec, recorder, cache)
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_execute_splices_and_returns_rows() {
        let (exec, recorder, _) = executor().await;
        let rows = exec
            .execute(
                &CancellationToken::new(),
                "get-user-by-id",
                &args(&[("userId", "\"42\"")]),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            recorder.statements.lock()[0],
            "SELECT id, name FROM users WHERE id = '42'"
        );
    }

    #[tokio::test]
    async fn test_unknown_query() {
        let (exec, _, _) = executor().await;
        let err = exec
            .execute(&CancellationToken::new(), "nope", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_undeclared_placeholder() {
        let (exec, recorder, _) = executor().await;
        let err = exec
            .execute(&CancellationToken::new(), "ghost", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Substitution(_)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_uncached_query_never_touches_cache() {
        let (exec, recorder, cache) = executor().await;
        let a = args(&[("userId", "1")]);
        exec.execute(&CancellationToken::new(), "get-user-by-id", &a)
            .await
            .unwrap();
        exec.execute(&CancellationToken::new(), "get-user-by-id", &a)
            .await
            .unwrap();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        let stats = cache.stats();
        assert_eq!(stats.sets + stats.hits + stats.misses, 0);
    }

    #[tokio::test]
    async fn test_concurrent_cached_calls_admit_once() {
        let (exec, recorder, cache) = executor().await;
        let a = args(&[("userId", "\"42\"")]);
        let token = CancellationToken::new();

        let (r1, r2) = tokio::join!(
            exec.execute(&token, "cached-user", &a),
            exec.execute(&token, "cached-user", &a)
        );
        assert_eq!(r1.unwrap(), r2.unwrap());
        assert_eq!(cache.stats().sets, 1);

        let calls_before = recorder.calls.load(Ordering::SeqCst);
        let r3 = exec.execute(&token, "cached-user", &a).await.unwrap();
        assert_eq!(r3[0].get("id"), Some(&Value::Integer(42)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), calls_before);
        assert!(cache.stats().hits >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_execution_not_cached() {
        let (exec, _, cache) = executor().await;
        let token = CancellationToken::new();
        token.cancel();
        // The fake ignores the token; the executor must still skip admission.
        exec.execute(&token, "cached-user", &args(&[("userId", "7")]))
            .await
            .unwrap();
        assert_eq!(cache.stats().sets, 0);
    }
}
