//! Error type for the scheduler crate.

use thiserror::Error;

/// Result type used throughout `coordkeeper-scheduler`.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by `Check`/`Change` execution, the lifecycle state
/// machine, and disk-imbalance rebalancing.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A coordination-store operation failed in a way the scheduler cannot
    /// recover from on its own (most transient failures are already
    /// absorbed by `CoordinationClient`'s own retry loop).
    #[error("coordination error: {0}")]
    Coordination(#[from] coordkeeper_core::CoreError),

    /// The broker subprocess could not be started or stopped.
    #[error("broker process error: {0}")]
    Process(String),

    /// The broker properties file could not be read or written.
    #[error("broker properties error: {0}")]
    Properties(String),
}
