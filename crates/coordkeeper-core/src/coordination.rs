//! `CoordinationClient`: re-resolves the ensemble before each operation and
//! retries indefinitely against transient backend failures, per spec.md
//! §4.1 and §7.

use crate::discovery::EnsembleDiscovery;
use crate::error::{CoreError, Result};
use crate::retry::RetryPolicy;
use crate::store::{CoordinationBackend, LockGuard, NodeStat};
use std::sync::Arc;
use tracing::{info, warn};

/// Factory for building a fresh backend connection against a resolved
/// connection string. A real deployment's factory dials the coordination
/// service; tests pass one that hands back a fixed in-memory backend.
pub trait BackendFactory: Send + Sync {
    /// Open a new backend session against `connection_string`.
    fn connect(&self, connection_string: &str) -> Arc<dyn CoordinationBackend>;
}

/// Wraps a [`CoordinationBackend`] with ensemble discovery and an infinite
/// retry policy, so callers never have to handle transient backend failures
/// themselves (spec.md §7: these never become an `Err` here).
pub struct CoordinationClient {
    discovery: EnsembleDiscovery,
    factory: Arc<dyn BackendFactory>,
    backend: Arc<dyn CoordinationBackend>,
    retry_policy: RetryPolicy,
}

impl CoordinationClient {
    /// Open a client, resolving the initial connection string from
    /// `discovery` and dialing it through `factory`.
    pub async fn connect(mut discovery: EnsembleDiscovery, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        discovery.resolve().await.ok();
        let backend = factory.connect(discovery.current());
        Ok(CoordinationClient {
            discovery,
            factory,
            backend,
            retry_policy: RetryPolicy::unbounded(),
        })
    }

    /// Re-resolve the ensemble, reopening the backend session if the
    /// connection string changed. Called before every operation.
    async fn resync(&mut self) -> Result<()> {
        match self.discovery.resolve().await {
            Ok(true) => {
                info!(connection = %self.discovery.current(), "reopening coordination session against new ensemble");
                self.backend = self.factory.connect(self.discovery.current());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "ensemble re-resolution failed; continuing with current session");
            }
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&mut self, op_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut(Arc<dyn CoordinationBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.resync().await?;
        let mut attempt = 0u32;
        loop {
            match f(Arc::clone(&self.backend)).await {
                Ok(v) => return Ok(v),
                Err(CoreError::NodeAbsent(p)) => return Err(CoreError::NodeAbsent(p)),
                Err(CoreError::NodeExists(p)) => return Err(CoreError::NodeExists(p)),
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt) {
                        return Err(e);
                    }
                    warn!(op = op_name, attempt, error = %e, "coordination op failed, retrying");
                    tokio::time::sleep(self.retry_policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Read a node's value, retrying transient failures forever.
    pub async fn get(&mut self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        let path = path.to_string();
        self.with_retry("get", move |b| {
            let path = path.clone();
            async move { b.get(&path).await }
        })
        .await
    }

    /// Overwrite a node's value, retrying transient failures forever.
    pub async fn set(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = path.to_string();
        self.with_retry("set", move |b| {
            let path = path.clone();
            let data = data.clone();
            async move { b.set(&path, data).await }
        })
        .await
    }

    /// Atomically create a node, retrying transient failures forever. A
    /// genuine `NodeExists` race is returned immediately, never retried.
    pub async fn create(&mut self, path: &str, data: Vec<u8>, ephemeral: bool, makepath: bool) -> Result<()> {
        let path = path.to_string();
        self.with_retry("create", move |b| {
            let path = path.clone();
            let data = data.clone();
            async move { b.create(&path, data, ephemeral, makepath).await }
        })
        .await
    }

    /// Delete a node, retrying transient failures forever.
    pub async fn delete(&mut self, path: &str, recursive: bool) -> Result<()> {
        let path = path.to_string();
        self.with_retry("delete", move |b| {
            let path = path.clone();
            async move { b.delete(&path, recursive).await }
        })
        .await
    }

    /// List a node's children, retrying transient failures forever.
    pub async fn get_children(&mut self, path: &str) -> Result<Vec<String>> {
        let path = path.to_string();
        self.with_retry("get_children", move |b| {
            let path = path.clone();
            async move { b.get_children(&path).await }
        })
        .await
    }

    /// Acquire the advisory lock at `path`.
    pub async fn acquire_lock(&mut self, path: &str) -> Result<Box<dyn LockGuard>> {
        self.resync().await?;
        self.backend.acquire_lock(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;
    use std::time::Duration;

    struct FixedFactory {
        backend: Arc<dyn CoordinationBackend>,
    }

    impl BackendFactory for FixedFactory {
        fn connect(&self, _connection_string: &str) -> Arc<dyn CoordinationBackend> {
            Arc::clone(&self.backend)
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_through_client() {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryBackend::new());
        let factory = Arc::new(FixedFactory { backend });
        let discovery = EnsembleDiscovery::new(vec![], 8181, "/status", Duration::from_secs(30));
        let mut client = CoordinationClient::connect(discovery, factory).await.unwrap();

        client.create("/brokers/ids/1", b"host:1".to_vec(), true, true).await.unwrap();
        let (data, _stat) = client.get("/brokers/ids/1").await.unwrap();
        assert_eq!(data, b"host:1");
    }

    #[tokio::test]
    async fn node_exists_is_not_retried_away() {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryBackend::new());
        let factory = Arc::new(FixedFactory { backend });
        let discovery = EnsembleDiscovery::new(vec![], 8181, "/status", Duration::from_secs(30));
        let mut client = CoordinationClient::connect(discovery, factory).await.unwrap();

        client.create("/admin/reassign_partitions", b"{}".to_vec(), false, false).await.unwrap();
        let err = client
            .create("/admin/reassign_partitions", b"{}".to_vec(), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NodeExists(_)));
    }
}
