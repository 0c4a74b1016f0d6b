//! Check/Change scheduling, broker lifecycle management, and disk-imbalance
//! rebalancing for coordkeeper.

pub mod change;
pub mod controller;
pub mod disk_imbalance;
pub mod error;
pub mod lifecycle;

pub use change::{Change, Check, StepResult};
pub use controller::Controller;
pub use disk_imbalance::{select_swap_candidate, DiskImbalanceCheck, SwapCandidate, SwapPartitionsChange};
pub use error::{Result, SchedulerError};
pub use lifecycle::{BrokerLifecycle, BrokerProcess, BrokerProperties, LifecycleState};

#[cfg(test)]
mod end_to_end_tests {
    use super::*;
    use coordkeeper_core::{
        BackendFactory, BrokerId, ClusterView, CoordinationBackend, CoordinationClient, DiskStats, DiskUsage,
        EnsembleDiscovery, InMemoryBackend, ReassignmentPlan,
    };
    use std::collections::HashMap;
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

    async fn seeded_view(backend: Arc<dyn CoordinationBackend>) -> ClusterView {
        let factory = Arc::new(FixedFactory { backend });
        let discovery = EnsembleDiscovery::new(vec![], 8181, "/status", Duration::from_secs(30));
        let client = CoordinationClient::connect(discovery, factory).await.unwrap();
        ClusterView::new(client)
    }

    /// Disk imbalance past threshold drives a full Controller pass through
    /// Check → queue → register → step → reassignment submission, ending
    /// with the swap reflected in `/admin/reassign_partitions`.
    #[tokio::test]
    async fn disk_imbalance_check_drives_a_full_swap_through_the_controller() {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryBackend::new());

        backend
            .create(
                "/brokers/topics/orders",
                serde_json::to_vec(&serde_json::json!({"partitions": {"0": [1, 3]}})).unwrap(),
                false,
                true,
            )
            .await
            .unwrap();
        backend
            .create(
                "/brokers/topics/clicks",
                serde_json::to_vec(&serde_json::json!({"partitions": {"0": [2, 3]}})).unwrap(),
                false,
                true,
            )
            .await
            .unwrap();

        let mut fat_topics = HashMap::new();
        fat_topics.insert("orders".to_string(), HashMap::from([(0u32, 100u64)]));
        let fat_stats = DiskStats {
            disk: DiskUsage { free_kb: 1_000, used_kb: 9_000 },
            topics: fat_topics,
        };
        let mut slim_topics = HashMap::new();
        slim_topics.insert("clicks".to_string(), HashMap::from([(0u32, 20u64)]));
        let slim_stats = DiskStats {
            disk: DiskUsage { free_kb: 9_000, used_kb: 1_000 },
            topics: slim_topics,
        };

        let mut view = seeded_view(Arc::clone(&backend)).await;
        view.publish_disk_stats(&BrokerId::new("1"), &fat_stats).await.unwrap();
        view.publish_disk_stats(&BrokerId::new("2"), &slim_stats).await.unwrap();

        let checks: Vec<Box<dyn Check>> = vec![Box::new(DiskImbalanceCheck::new(1_000, Duration::from_secs(0)))];
        let mut controller = Controller::new(view, checks, Duration::from_millis(10));

        // One pass queues the swap, a second drains it to completion.
        controller.make_step().await.unwrap();
        controller.make_step().await.unwrap();

        let (data, _) = backend.get("/admin/reassign_partitions").await.unwrap();
        let plan: ReassignmentPlan = serde_json::from_slice(&data).unwrap();
        assert_eq!(plan.partitions.len(), 2);
    }

    /// Two nodes racing to register the same Change: only the first wins,
    /// the second must back off rather than running a duplicate.
    #[tokio::test]
    async fn concurrent_change_registration_is_exclusive_cluster_wide() {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryBackend::new());
        let mut view_a = seeded_view(Arc::clone(&backend)).await;
        let mut view_b = seeded_view(Arc::clone(&backend)).await;

        assert!(view_a.register_change("rebalance").await.unwrap());
        assert!(!view_b.register_change("rebalance").await.unwrap());

        view_a.unregister_change("rebalance").await.unwrap();
        assert!(view_b.register_change("rebalance").await.unwrap());
    }
}
