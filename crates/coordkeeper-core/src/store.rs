//! `CoordinationBackend`: the trait boundary between coordkeeper's own
//! protocol logic (path layout, retry, ephemeral semantics, CAS-on-create)
//! and the actual coordination service that stores the data. A production
//! backend wiring this trait to a real coordination service is an external
//! collaborator (spec.md §6); this crate ships only the in-memory backend
//! used by its own tests and by `coordkeeper-scheduler`'s tests.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// A node's stored value and a monotonically increasing modification
/// counter (the store's "stat" — callers here only ever need existence and
/// value, never the counter itself, but it's threaded through for parity
/// with the get/set API named in spec.md §4.1).
#[derive(Debug, Clone)]
pub struct NodeStat {
    /// Number of times this path has been set since creation.
    pub version: u64,
}

/// Abstraction over the coordination store's primitive operations, as
/// specified in spec.md §4.1.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Read a node's value. Errors with `NodeAbsent` if it does not exist.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, NodeStat)>;

    /// Overwrite a node's value. Errors with `NodeAbsent` if it does not
    /// exist.
    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Atomically create a node. Errors with `NodeExists` if it is already
    /// present. `makepath` creates missing parent path components; `ephemeral`
    /// ties the node's lifetime to this backend connection/session.
    async fn create(&self, path: &str, data: Vec<u8>, ephemeral: bool, makepath: bool) -> Result<()>;

    /// Delete a node. `recursive` also deletes all descendants. Deleting a
    /// node that does not exist is a no-op, matching the original's
    /// `delete(..., recursive=True)` semantics used only for cleanup paths
    /// the caller already knows exist.
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    /// List immediate child names of `path`. Returns the empty list, not an
    /// error, if `path` does not exist (spec.md §4.1).
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Acquire the advisory lock at `path`, blocking until it is available.
    /// The returned guard releases the lock on drop.
    async fn acquire_lock(&self, path: &str) -> Result<Box<dyn LockGuard>>;

    /// Tear down this backend's session (simulates the supervisor losing
    /// its coordination-store connection), causing every ephemeral node it
    /// owns to disappear. Used by tests exercising `BrokerLifecycle::stop`'s
    /// wait for id-absence and similar session-expiry behavior.
    async fn expire_session(&self);
}

/// RAII guard for an acquired advisory lock.
pub trait LockGuard: Send {}

struct InMemoryLockGuard {
    path: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockGuard for InMemoryLockGuard {}

impl Drop for InMemoryLockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.path);
    }
}

struct Node {
    data: Vec<u8>,
    ephemeral: bool,
    version: u64,
}

/// In-memory `CoordinationBackend`, suitable for unit and integration tests.
/// Not a production backend — it has no persistence and no cross-process
/// sharing.
pub struct InMemoryBackend {
    nodes: Arc<Mutex<HashMap<String, Node>>>,
    locks_held: Arc<Mutex<HashSet<String>>>,
    lock_gate: Arc<AsyncMutex<()>>,
}

impl InMemoryBackend {
    /// Create a fresh, empty backend.
    pub fn new() -> Self {
        InMemoryBackend {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            locks_held: Arc::new(Mutex::new(HashSet::new())),
            lock_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    fn normalize(path: &str) -> String {
        path.trim_end_matches('/').to_string()
    }

    fn parents_of(path: &str) -> Vec<String> {
        let mut parents = Vec::new();
        let mut acc = String::new();
        for segment in path.trim_start_matches('/').split('/') {
            if segment.is_empty() {
                continue;
            }
            acc.push('/');
            acc.push_str(segment);
            parents.push(acc.clone());
        }
        if !parents.is_empty() {
            parents.pop();
        }
        parents
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryBackend {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        let path = Self::normalize(path);
        let nodes = self.nodes.lock();
        nodes
            .get(&path)
            .map(|n| (n.data.clone(), NodeStat { version: n.version }))
            .ok_or_else(|| CoreError::NodeAbsent(path.clone()))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&path) {
            Some(n) => {
                n.data = data;
                n.version += 1;
                Ok(())
            }
            None => Err(CoreError::NodeAbsent(path)),
        }
    }

    async fn create(&self, path: &str, data: Vec<u8>, ephemeral: bool, makepath: bool) -> Result<()> {
        let path = Self::normalize(path);
        if makepath {
            let parents = Self::parents_of(&path);
            let mut nodes = self.nodes.lock();
            for parent in parents {
                nodes.entry(parent).or_insert_with(|| Node {
                    data: Vec::new(),
                    ephemeral: false,
                    version: 0,
                });
            }
        }
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&path) {
            return Err(CoreError::NodeExists(path));
        }
        nodes.insert(
            path,
            Node {
                data,
                ephemeral,
                version: 0,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock();
        nodes.remove(&path);
        if recursive {
            let prefix = format!("{}/", path);
            nodes.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let path = Self::normalize(path);
        let prefix = format!("{}/", path);
        let nodes = self.nodes.lock();
        let mut children: Vec<String> = nodes
            .keys()
            .filter_map(|k| {
                k.strip_prefix(&prefix).and_then(|rest| {
                    if rest.is_empty() || rest.contains('/') {
                        None
                    } else {
                        Some(rest.to_string())
                    }
                })
            })
            .collect();
        children.sort();
        Ok(children)
    }

    async fn acquire_lock(&self, path: &str) -> Result<Box<dyn LockGuard>> {
        let path = Self::normalize(path);
        loop {
            let _gate = self.lock_gate.lock().await;
            let mut held = self.locks_held.lock();
            if !held.contains(&path) {
                held.insert(path.clone());
                drop(held);
                return Ok(Box::new(InMemoryLockGuard {
                    path,
                    held: Arc::clone(&self.locks_held),
                }));
            }
            drop(held);
            drop(_gate);
            tokio::task::yield_now().await;
        }
    }

    async fn expire_session(&self) {
        let mut nodes = self.nodes.lock();
        nodes.retain(|_, n| !n.ephemeral);
    }
}
