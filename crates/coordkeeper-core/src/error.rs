//! Error types for coordination-store access and the cluster domain facade.

use thiserror::Error;

/// Result type used throughout `coordkeeper-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced at the CoordinationClient / ClusterView boundary.
///
/// `NodeAbsent` and `NodeExists` are kept as distinct variants rather than
/// folded into a generic store error because callers switch on them: a
/// missing node is routed differently than a lost CAS race (spec.md §7).
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested path does not exist in the coordination store.
    #[error("node absent: {0}")]
    NodeAbsent(String),

    /// An atomic create lost the race against an existing node.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The coordination backend reported a failure that is not one of the
    /// two structured cases above (connection loss, malformed response).
    /// These are retried internally by `CoordinationClient` and should
    /// rarely escape to a caller.
    #[error("coordination backend error: {0}")]
    Backend(String),

    /// EnsembleDiscovery's HTTP poll failed against every configured host.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// A value stored at a path could not be parsed as the expected JSON
    /// shape.
    #[error("malformed wire value at {path}: {source}")]
    Malformed {
        /// Store path whose value failed to parse.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Discovery(err.to_string())
    }
}
