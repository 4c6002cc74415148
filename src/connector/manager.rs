//! Connector lifecycle: parallel initialisation, lookup and parallel close.

use super::{ConnectorFactory, SharedConnector};
use crate::error::GatewayError;
use crate::model::Adapter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Owns every live connector of one model generation.
pub struct ConnectorManager {
    factory: Arc<dyn ConnectorFactory>,
    connectors: Arc<RwLock<HashMap<String, SharedConnector>>>,
}

impl ConnectorManager {
    /// Create an empty manager that builds connectors through `factory`.
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            factory,
            connectors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build one connector per adapter, concurrently.
    ///
    /// All builds run to completion. If any of them fails, every connector
    /// that did come up is closed, the map is left empty and the first
    /// failure is returned.
    pub async fn initialize_all(&self, adapters: &[Adapter]) -> Result<(), GatewayError> {
        let mut tasks = JoinSet::new();

        for adapter in adapters.iter().cloned() {
            let factory = Arc::clone(&self.factory);
            let connectors = Arc::clone(&self.connectors);
            tasks.spawn(async move {
                let connector = factory.connect(&adapter).await.map_err(|e| {
                    GatewayError::execution(format!(
                        "failed to initialize adapter '{}': {}",
                        adapter.name, e
                    ))
                })?;
                connectors.write().insert(adapter.name.clone(), connector);
                debug!(adapter = %adapter.name, "Adapter registered");
                Ok::<_, GatewayError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| GatewayError::internal(format!("adapter init task failed: {e}")))
                .and_then(|res| res);
            if let Err(e) = outcome {
                error!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                info!(count = adapters.len(), "All adapters initialized");
                Ok(())
            }
            Some(e) => {
                if let Err(close_err) = self.close_all().await {
                    warn!("Cleanup after failed initialization: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Look up the connector registered under an adapter name.
    pub fn get(&self, name: &str) -> Option<SharedConnector> {
        self.connectors.read().get(name).cloned()
    }

    /// Number of live connectors.
    pub fn count(&self) -> usize {
        self.connectors.read().len()
    }

    /// Close every live connector concurrently and clear the map.
    ///
    /// Every close runs even when siblings fail; all failures are reported
    /// together.
    pub async fn close_all(&self) -> Result<(), GatewayError> {
        let victims: Vec<(String, SharedConnector)> = self
            .connectors
            .read()
            .iter()
            .map(|(name, conn)| (name.clone(), Arc::clone(conn)))
            .collect();

        let mut tasks = JoinSet::new();
        for (name, connector) in victims {
            tasks.spawn(async move {
                connector
                    .close()
                    .await
                    .map_err(|e| format!("{name}: {e}"))
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(format!("close task failed: {e}")),
            }
        }

        self.connectors.write().clear();

        if errors.is_empty() {
            debug!("All connectors closed");
            Ok(())
        } else {
            Err(GatewayError::Close { errors })
        }
    }
}

impl std::fmt::Debug for ConnectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorManager")
            .field("connectors", &self.connectors.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, Row};
    use crate::error::ConnectorError;
    use crate::executor::ValidatedInputs;
    use crate::model::ConnectorKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Probe {
        closes: AtomicUsize,
    }

    struct ProbeConnector {
        probe: Arc<Probe>,
        fail_close: bool,
    }

    #[async_trait]
    impl Connector for ProbeConnector {
        fn kind(&self) -> ConnectorKind {
            ConnectorKind::Postgres
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _statement: &str,
            _params: &ValidatedInputs,
        ) -> Result<Vec<Row>, ConnectorError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), ConnectorError> {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(ConnectorError::Close("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct ProbeFactory {
        probes: Mutex<HashMap<String, Arc<Probe>>>,
    }

    #[async_trait]
    impl ConnectorFactory for ProbeFactory {
        async fn connect(&self, adapter: &Adapter) -> Result<SharedConnector, ConnectorError> {
            if adapter.name.starts_with("bad") {
                // Let the healthy sibling register first.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(ConnectorError::Connect("refused".into()));
            }
            let probe = Arc::new(Probe::default());
            self.probes
                .lock()
                .insert(adapter.name.clone(), Arc::clone(&probe));
            Ok(Arc::new(ProbeConnector {
                probe,
                fail_close: adapter.name.starts_with("sticky"),
            }))
        }
    }

    fn adapter(name: &str) -> Adapter {
        Adapter {
            name: name.into(),
            kind: ConnectorKind::Postgres,
            connection_string: "postgres://localhost/app".into(),
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_initialize_all_registers_every_adapter() {
        let manager = ConnectorManager::new(Arc::new(ProbeFactory::default()));
        manager
            .initialize_all(&[adapter("a"), adapter("b")])
            .await
            .unwrap();
        assert_eq!(manager.count(), 2);
        assert!(manager.get("a").is_some());
        assert!(manager.get("b").is_some());
        assert!(manager.get("c").is_none());
    }

    #[tokio::test]
    async fn test_failed_initialize_closes_registered() {
        let factory = Arc::new(ProbeFactory::default());
        let manager = ConnectorManager::new(factory.clone());

        let err = manager
            .initialize_all(&[adapter("good"), adapter("bad")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert_eq!(manager.count(), 0);

        let probe = factory.probes.lock().get("good").cloned().unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all_collects_errors() {
        let factory = Arc::new(ProbeFactory::default());
        let manager = ConnectorManager::new(factory.clone());
        manager
            .initialize_all(&[adapter("a"), adapter("sticky")])
            .await
            .unwrap();

        let err = manager.close_all().await.unwrap_err();
        assert!(matches!(err, GatewayError::Close { ref errors } if errors.len() == 1));
        assert!(err.to_string().contains("sticky"));
        assert_eq!(manager.count(), 0);

        for probe in factory.probes.lock().values() {
            assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_close_all_empty() {
        let manager = ConnectorManager::new(Arc::new(ProbeFactory::default()));
        assert!(manager.close_all().await.is_ok());
    }
}
