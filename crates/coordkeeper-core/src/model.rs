//! Wire data model: the JSON shapes the coordination store holds at the
//! paths listed in spec.md §6. These must serialize bit-for-bit compatibly
//! with what the broker cluster itself reads and writes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier of a broker in the cluster.
///
/// Assigned before start; visible to others via an ephemeral node at
/// `ids/<id>` under the broker namespace while the local subprocess is
/// running and healthy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(pub String);

impl BrokerId {
    /// Build a `BrokerId` from anything that converts to a `String`.
    pub fn new(id: impl Into<String>) -> Self {
        BrokerId(id.into())
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerId {
    fn from(s: &str) -> Self {
        BrokerId(s.to_string())
    }
}

/// Identity of a single (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition index (non-negative by invariant, hence `u32`).
    pub partition: u32,
}

impl TopicPartition {
    /// Construct a topic/partition pair.
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

/// Wire shape of `topics/<topic>` — partition index to ordered replica list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicAssignment {
    /// Partition index (as a string key on the wire) to ordered replica ids.
    pub partitions: HashMap<String, Vec<u32>>,
}

/// Wire shape of `topics/<topic>/partitions/<p>/state`.
///
/// `leader` is `None` when the wire value is absent or `-1`, which happens
/// during an in-flight election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionState {
    /// Current leader broker id, numeric on the wire.
    #[serde(default)]
    pub leader: Option<i64>,
    /// In-sync replica set, numeric broker ids.
    #[serde(default)]
    pub isr: Vec<i64>,
}

impl PartitionState {
    /// True if `broker_id` is currently the leader of this partition.
    pub fn is_leader(&self, broker_id: &BrokerId) -> bool {
        self.leader
            .map(|l| l.to_string() == broker_id.0)
            .unwrap_or(false)
    }

    /// True if `broker_id` currently appears in the in-sync replica set.
    pub fn in_isr(&self, broker_id: &BrokerId) -> bool {
        self.isr.iter().any(|r| r.to_string() == broker_id.0)
    }
}

/// Per-broker disk usage summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Free disk space, in kilobytes.
    pub free_kb: u64,
    /// Used disk space, in kilobytes.
    pub used_kb: u64,
}

/// Per-broker disk stats record, published as the ephemeral node
/// `/<prefix>/size_stats/<broker_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStats {
    /// Aggregate disk usage of the broker's data directory.
    pub disk: DiskUsage,
    /// Per-topic, per-partition size in kilobytes.
    pub topics: HashMap<String, HashMap<u32, u64>>,
}

/// A single reassignment entry inside a `ReassignmentPlan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignmentEntry {
    /// Topic name.
    pub topic: String,
    /// Partition index.
    pub partition: u32,
    /// New ordered replica list for this partition.
    pub replicas: Vec<u32>,
}

/// Wire shape of `/admin/reassign_partitions`. At most one of these may
/// exist in the coordination store at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignmentPlan {
    /// Always `"1"` — the only reassignment wire version the broker
    /// cluster understands.
    pub version: String,
    /// Partitions to move, each with a freshly assigned replica list.
    pub partitions: Vec<ReassignmentEntry>,
}

impl ReassignmentPlan {
    /// Build a plan from a set of (topic, partition, replicas) triples.
    pub fn new(entries: Vec<(String, u32, Vec<u32>)>) -> Self {
        ReassignmentPlan {
            version: "1".to_string(),
            partitions: entries
                .into_iter()
                .map(|(topic, partition, replicas)| ReassignmentEntry {
                    topic,
                    partition,
                    replicas,
                })
                .collect(),
        }
    }
}
