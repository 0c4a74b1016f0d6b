//! `ClusterView`: the domain-shaped facade over [`CoordinationClient`] that
//! the scheduler crate programs against. Translates between raw coordination
//! paths/JSON blobs and the wire types in [`crate::model`], per spec.md §3
//! and §4.2.

use crate::coordination::CoordinationClient;
use crate::error::{CoreError, Result};
use crate::model::{BrokerId, DiskStats, PartitionState, ReassignmentPlan, TopicAssignment};
use crate::store::LockGuard;
use std::collections::HashMap;

const BROKERS_IDS: &str = "/brokers/ids";
const BROKERS_TOPICS: &str = "/brokers/topics";
const ADMIN_REASSIGN: &str = "/admin/reassign_partitions";
const SIZE_STATS: &str = "/coordkeeper/size_stats";
const LOCKS: &str = "/coordkeeper/locks";
const CHANGES: &str = "/coordkeeper/changes";

/// Cluster-wide view over the coordination store, scoped to the broker
/// namespaces this supervisor needs to read and write.
pub struct ClusterView {
    client: CoordinationClient,
}

impl ClusterView {
    /// Wrap an already-connected [`CoordinationClient`].
    pub fn new(client: CoordinationClient) -> Self {
        ClusterView { client }
    }

    fn parse_json<T: serde::de::DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|source| CoreError::Malformed {
            path: path.to_string(),
            source,
        })
    }

    /// All registered broker ids, sorted ascending.
    pub async fn broker_ids(&mut self) -> Result<Vec<BrokerId>> {
        let mut ids: Vec<BrokerId> = self
            .client
            .get_children(BROKERS_IDS)
            .await?
            .into_iter()
            .map(BrokerId::new)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Whether `id` currently has a live ephemeral registration node.
    pub async fn is_broker_registered(&mut self, id: &BrokerId) -> Result<bool> {
        let path = format!("{}/{}", BROKERS_IDS, id);
        match self.client.get(&path).await {
            Ok(_) => Ok(true),
            Err(CoreError::NodeAbsent(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All known topic names.
    pub async fn topics(&mut self) -> Result<Vec<String>> {
        self.client.get_children(BROKERS_TOPICS).await
    }

    /// Partition-to-replica-list assignment for `topic`.
    pub async fn partition_assignment(&mut self, topic: &str) -> Result<TopicAssignment> {
        let path = format!("{}/{}", BROKERS_TOPICS, topic);
        let (bytes, _) = self.client.get(&path).await?;
        Self::parse_json(&path, &bytes)
    }

    /// Current leader/ISR state of one partition.
    pub async fn partition_state(&mut self, topic: &str, partition: u32) -> Result<PartitionState> {
        let path = format!("{}/{}/partitions/{}/state", BROKERS_TOPICS, topic, partition);
        let (bytes, _) = self.client.get(&path).await?;
        Self::parse_json(&path, &bytes)
    }

    /// Whether a reassignment is currently in flight.
    pub async fn is_rebalancing(&mut self) -> Result<bool> {
        match self.client.get(ADMIN_REASSIGN).await {
            Ok(_) => Ok(true),
            Err(CoreError::NodeAbsent(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Submit a reassignment plan. Returns `false`, without error, if one is
    /// already running — a race against another node losing to the atomic
    /// create is a normal outcome here, not a failure, matching
    /// [`Self::register_change`]'s pattern.
    pub async fn submit_reassignment(&mut self, plan: ReassignmentPlan) -> Result<bool> {
        let data = serde_json::to_vec(&plan).expect("ReassignmentPlan always serializes");
        match self.client.create(ADMIN_REASSIGN, data, false, false).await {
            Ok(()) => Ok(true),
            Err(CoreError::NodeExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Publish this broker's disk usage snapshot as an ephemeral node.
    pub async fn publish_disk_stats(&mut self, id: &BrokerId, stats: &DiskStats) -> Result<()> {
        let path = format!("{}/{}", SIZE_STATS, id);
        let data = serde_json::to_vec(stats).expect("DiskStats always serializes");
        match self.client.create(&path, data.clone(), true, true).await {
            Ok(()) => Ok(()),
            Err(CoreError::NodeExists(_)) => self.client.set(&path, data).await,
            Err(e) => Err(e),
        }
    }

    /// Every currently published disk-stats snapshot, keyed by broker id.
    pub async fn all_disk_stats(&mut self) -> Result<HashMap<BrokerId, DiskStats>> {
        let mut out = HashMap::new();
        for name in self.client.get_children(SIZE_STATS).await? {
            let path = format!("{}/{}", SIZE_STATS, name);
            let (bytes, _) = self.client.get(&path).await?;
            out.insert(BrokerId::new(name), Self::parse_json(&path, &bytes)?);
        }
        Ok(out)
    }

    /// Acquire a named advisory lock shared cluster-wide.
    pub async fn lock(&mut self, name: &str) -> Result<Box<dyn LockGuard>> {
        let path = format!("{}/{}", LOCKS, name);
        self.client.acquire_lock(&path).await
    }

    /// Register a named `Change` as currently running. Returns `false`,
    /// without error, if it was already registered by this or another node —
    /// the scheduler treats that as "someone else already owns this Change".
    pub async fn register_change(&mut self, name: &str) -> Result<bool> {
        let path = format!("{}/{}", CHANGES, name);
        match self.client.create(&path, Vec::new(), true, true).await {
            Ok(()) => Ok(true),
            Err(CoreError::NodeExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release a previously registered Change.
    pub async fn unregister_change(&mut self, name: &str) -> Result<()> {
        let path = format!("{}/{}", CHANGES, name);
        self.client.delete(&path, false).await
    }

    /// Names of all Changes currently registered as running, cluster-wide.
    pub async fn running_changes(&mut self) -> Result<Vec<String>> {
        self.client.get_children(CHANGES).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::BackendFactory;
    use crate::discovery::EnsembleDiscovery;
    use crate::model::DiskUsage;
    use crate::store::{CoordinationBackend, InMemoryBackend};
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedFactory {
        backend: Arc<dyn CoordinationBackend>,
    }

    impl BackendFactory for FixedFactory {
        fn connect(&self, _connection_string: &str) -> Arc<dyn CoordinationBackend> {
            Arc::clone(&self.backend)
        }
    }

    async fn view_over_empty_store() -> ClusterView {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryBackend::new());
        let factory = Arc::new(FixedFactory { backend });
        let discovery = EnsembleDiscovery::new(vec![], 8181, "/status", Duration::from_secs(30));
        let client = CoordinationClient::connect(discovery, factory).await.unwrap();
        ClusterView::new(client)
    }

    #[tokio::test]
    async fn no_brokers_registered_is_empty_not_error() {
        let mut view = view_over_empty_store().await;
        assert!(view.broker_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registering_a_change_twice_reports_already_owned() {
        let mut view = view_over_empty_store().await;
        assert!(view.register_change("disk_imbalance").await.unwrap());
        assert!(!view.register_change("disk_imbalance").await.unwrap());
        view.unregister_change("disk_imbalance").await.unwrap();
        assert!(view.register_change("disk_imbalance").await.unwrap());
    }

    #[tokio::test]
    async fn submitting_second_reassignment_while_one_running_fails() {
        let mut view = view_over_empty_store().await;
        let plan = ReassignmentPlan::new(vec![("t".into(), 0, vec![1, 2])]);
        assert!(view.submit_reassignment(plan.clone()).await.unwrap());
        assert!(view.is_rebalancing().await.unwrap());
        assert!(!view.submit_reassignment(plan).await.unwrap());
    }

    #[tokio::test]
    async fn publish_disk_stats_then_update_overwrites_existing() {
        let mut view = view_over_empty_store().await;
        let id = BrokerId::new("1");
        let stats = DiskStats {
            disk: DiskUsage { free_kb: 100, used_kb: 50 },
            topics: Default::default(),
        };
        view.publish_disk_stats(&id, &stats).await.unwrap();
        let mut updated = stats.clone();
        updated.disk.free_kb = 10;
        view.publish_disk_stats(&id, &updated).await.unwrap();

        let all = view.all_disk_stats().await.unwrap();
        assert_eq!(all.get(&id).unwrap().disk.free_kb, 10);
    }
}
