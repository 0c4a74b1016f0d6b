//! `Check`/`Change`: the scheduler's unit of periodic observation and the
//! unit of cluster-wide mutually-exclusive work it can produce, per
//! spec.md §4.4.

use async_trait::async_trait;
use coordkeeper_core::ClusterView;
use std::time::Duration;

use crate::error::Result;

/// Outcome of one `Change::step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The Change has finished; the scheduler releases its registration.
    Done,
    /// The Change wants another turn on its next scheduling pass.
    RunAgain,
}

/// A unit of cluster-wide, mutually-exclusive work. Changes are identified
/// by [`Change::name`]; only one instance of a given name may be registered
/// as running across the whole cluster at a time (enforced by
/// `ClusterView::register_change`'s atomic create).
#[async_trait]
pub trait Change: Send + Sync {
    /// Stable identity of this Change, used as the cluster-wide dedup key
    /// and the per-name FIFO queue key.
    fn name(&self) -> &str;

    /// Run one step of this Change's work. A Change that cannot complete in
    /// a single step (e.g. waiting for a reassignment to finish propagating)
    /// returns [`StepResult::RunAgain`] and is re-queued for the next pass.
    async fn step(&mut self, view: &mut ClusterView) -> Result<StepResult>;

    /// Whether this Change may register and start running given the names
    /// of Changes already registered cluster-wide (`peers`, with this
    /// Change's own name already filtered out). Lets a family of Changes
    /// that conflict with each other — but not with unrelated work — refuse
    /// to run concurrently even though they register under distinct names.
    /// Defaults to always allowed.
    fn can_run(&self, peers: &[String]) -> bool {
        let _ = peers;
        true
    }

    /// Whether this Change is safe to let run to completion during
    /// supervisor shutdown. `false` means it must be abandoned immediately
    /// — its registration released via [`Self::on_remove`] without another
    /// `step` call. Defaults to safe to finish.
    fn can_run_at_exit(&self) -> bool {
        true
    }

    /// Called once when this Change finishes, errors, or is abandoned
    /// during shutdown, before its registration is released. Defaults to a
    /// no-op.
    fn on_remove(&mut self) {}
}

/// A periodic observation that may produce a [`Change`] to queue.
#[async_trait]
pub trait Check: Send + Sync {
    /// Stable identity of this Check, used for scheduling bookkeeping and
    /// log correlation.
    fn name(&self) -> &str;

    /// How often the scheduler should re-run this Check.
    fn check_interval(&self) -> Duration;

    /// Inspect cluster state and optionally produce a `Change` to queue. A
    /// Check's own name is not itself a uniqueness key — it is the
    /// produced Change's name that governs single-running-instance dedup.
    async fn check(&self, view: &mut ClusterView) -> Result<Option<Box<dyn Change>>>;
}
