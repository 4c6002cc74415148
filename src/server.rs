//! Gateway runtime root.
//!
//! A [`Gateway`] owns everything that outlives a single request: the current
//! [`Runtime`] (model, connectors, cache and executor), metrics, the MCP
//! session registry and the shutdown controller. The runtime is replaced as a
//! whole on reload; requests that already hold the previous one finish
//! against it.

use crate::cache::{ResultCache, SharedCache};
use crate::config::Config;
use crate::connector::{ConnectorFactory, ConnectorManager};
use crate::error::GatewayError;
use crate::executor::Executor;
use crate::mcp::jsonrpc::JsonRpcNotification;
use crate::mcp::session::SessionRegistry;
use crate::model::Model;
use crate::shutdown::{new_shutdown_controller, SharedShutdownController};
use crate::telemetry::{new_shared_metrics, SharedMetrics};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Notification sent to MCP sessions after a reload.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// One generation of the model and the resources built from it.
#[derive(Debug)]
pub struct Runtime {
    generation: u64,
    model: Arc<Model>,
    connectors: Arc<ConnectorManager>,
    cache: SharedCache,
    executor: Executor,
}

impl Runtime {
    /// Validate the model and initialize every adapter.
    ///
    /// Initialization is all-or-nothing: on failure no connector is left open.
    async fn build(
        generation: u64,
        model: Model,
        factory: Arc<dyn ConnectorFactory>,
        cache_max_cost_mb: u64,
        metrics: SharedMetrics,
    ) -> Result<Self, GatewayError> {
        model.validate()?;
        let model = Arc::new(model);

        let connectors = Arc::new(ConnectorManager::new(factory));
        connectors.initialize_all(&model.adapters).await?;

        let cache: SharedCache = Arc::new(ResultCache::new(cache_max_cost_mb));
        let executor = Executor::new(
            Arc::clone(&model),
            Arc::clone(&connectors),
            Arc::clone(&cache),
            metrics,
        );

        Ok(Self {
            generation,
            model,
            connectors,
            cache,
            executor,
        })
    }

    /// Incremented on every successful reload, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn connectors(&self) -> &Arc<ConnectorManager> {
        &self.connectors
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

struct Inner {
    runtime: RwLock<Arc<Runtime>>,
    factory: Arc<dyn ConnectorFactory>,
    metrics: SharedMetrics,
    sessions: SessionRegistry,
    shutdown: SharedShutdownController,
    cache_max_cost_mb: u64,
    sse_keepalive: Duration,
    reload_lock: tokio::sync::Mutex<()>,
}

/// Cheaply cloneable handle to the running gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Build the first runtime and return a gateway serving it.
    pub async fn start(
        model: Model,
        factory: Arc<dyn ConnectorFactory>,
        config: &Config,
    ) -> Result<Self, GatewayError> {
        let metrics = new_shared_metrics();
        let runtime = Runtime::build(
            1,
            model,
            Arc::clone(&factory),
            config.cache.max_cost_mb,
            Arc::clone(&metrics),
        )
        .await?;

        info!(
            model = %runtime.model.name,
            adapters = runtime.model.adapters.len(),
            queries = runtime.model.queries.len(),
            "Gateway started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                runtime: RwLock::new(Arc::new(runtime)),
                factory,
                metrics,
                sessions: SessionRegistry::new(),
                shutdown: new_shutdown_controller(config.shutdown.drain_timeout),
                cache_max_cost_mb: config.cache.max_cost_mb,
                sse_keepalive: config.shutdown.sse_keepalive,
                reload_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Snapshot of the current runtime.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.inner.runtime.read().clone()
    }

    pub fn executor(&self) -> Executor {
        self.runtime().executor.clone()
    }

    pub fn model(&self) -> Arc<Model> {
        Arc::clone(&self.runtime().model)
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.inner.metrics
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn shutdown(&self) -> &SharedShutdownController {
        &self.inner.shutdown
    }

    pub fn sse_keepalive(&self) -> Duration {
        self.inner.sse_keepalive
    }

    /// Replace the model.
    ///
    /// A fresh connector set and cache are built first; only once they are
    /// ready is the runtime swapped and the previous connector set closed. If
    /// the new model fails to validate or initialize, the running one stays
    /// installed and the error is returned.
    pub async fn reload(&self, model: Model) -> Result<(), GatewayError> {
        let _guard = self.inner.reload_lock.lock().await;
        let generation = self.runtime().generation + 1;

        let next = Runtime::build(
            generation,
            model,
            Arc::clone(&self.inner.factory),
            self.inner.cache_max_cost_mb,
            Arc::clone(&self.inner.metrics),
        )
        .await?;

        let previous = std::mem::replace(&mut *self.inner.runtime.write(), Arc::new(next));
        info!(generation, "Model reloaded");

        if let Err(e) = previous.connectors.close_all().await {
            warn!("Previous connectors did not close cleanly: {}", e);
        }
        previous.cache.clear().await;

        let notified = self
            .inner
            .sessions
            .broadcast(&JsonRpcNotification::new(TOOLS_LIST_CHANGED).to_value());
        info!(streams = notified, "Sent tools/list_changed");

        Ok(())
    }

    /// Load the model file at `path` and reload.
    pub async fn reload_from_path(&self, path: &Path) -> Result<(), GatewayError> {
        let model = Model::from_path(path)?;
        self.reload(model).await
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runtime = self.runtime();
        f.debug_struct("Gateway")
            .field("model", &runtime.model.name)
            .field("generation", &runtime.generation)
            .field("connectors", &runtime.connectors.count())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}
