//! `Controller`: the cooperative, single-threaded step loop that runs due
//! Checks, queues the Changes they produce per-name FIFO, and executes them
//! under cluster-wide mutual exclusion, per spec.md §4.4 and §5.
//!
//! The loop itself is a single `async fn run` awaiting each phase in turn —
//! no per-Change task spawning — so step ordering stays deterministic even
//! though the process as a whole runs on a multi-threaded tokio runtime for
//! its IO.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coordkeeper_core::ClusterView;
use tracing::{debug, info, warn};

use crate::change::{Change, Check, StepResult};
use crate::error::Result;

/// Name of the cluster-wide advisory lock guarding the register phase: the
/// peer-conflict check (`running_changes` minus self, passed to
/// `Change::can_run`) and the atomic `register_change` must happen as one
/// critical section, or two nodes can both pass `can_run` against a stale
/// peer list and then both register distinct, mutually-conflicting Changes.
const GLOBAL_LOCK: &str = "controller";

/// Drives the Check/Change scheduling loop against one [`ClusterView`].
pub struct Controller {
    view: ClusterView,
    checks: Vec<Box<dyn Check>>,
    last_run: HashMap<String, Instant>,
    queues: HashMap<String, VecDeque<Box<dyn Change>>>,
    running: HashSet<String>,
    idle_sleep: Duration,
}

impl Controller {
    /// Build a controller over `view`, running `checks` on their own
    /// intervals and sleeping `idle_sleep` between passes that find no work.
    pub fn new(view: ClusterView, checks: Vec<Box<dyn Check>>, idle_sleep: Duration) -> Self {
        Controller {
            view,
            checks,
            last_run: HashMap::new(),
            queues: HashMap::new(),
            running: HashSet::new(),
            idle_sleep,
        }
    }

    /// A shared flag the caller can flip to ask [`Self::run`] to exit after
    /// its current step.
    pub fn stop_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    /// Run the step loop until `stop` is set. With no Checks configured at
    /// all, falls back to a 60s idle sleep between passes rather than
    /// busy-looping.
    pub async fn run(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        let idle = if self.checks.is_empty() {
            Duration::from_secs(60)
        } else {
            self.idle_sleep
        };
        while !stop.load(Ordering::Relaxed) {
            let did_work = self.make_step().await?;
            if !did_work {
                tokio::time::sleep(idle).await;
            }
        }
        self.drain_for_shutdown().await
    }

    /// Called once after the main loop exits. Abandons any queued Change
    /// that isn't safe to run to completion during shutdown
    /// (`can_run_at_exit() == false`) without ever registering or stepping
    /// it, then drains everything else to completion.
    async fn drain_for_shutdown(&mut self) -> Result<()> {
        for queue in self.queues.values_mut() {
            let mut keep = VecDeque::new();
            while let Some(mut change) = queue.pop_front() {
                if change.can_run_at_exit() {
                    keep.push_back(change);
                } else {
                    info!(change = %change.name(), "abandoning change at shutdown");
                    change.on_remove();
                }
            }
            *queue = keep;
        }
        self.queues.retain(|_, q| !q.is_empty());

        while self.drain_queues().await? {}
        Ok(())
    }

    /// One pass: run due Checks, then drain whatever is queued. Returns
    /// whether any work actually happened, so [`Self::run`] knows whether to
    /// sleep before the next pass.
    pub async fn make_step(&mut self) -> Result<bool> {
        let ran_checks = self.run_due_checks().await?;
        let drained = self.drain_queues().await?;
        Ok(ran_checks || drained)
    }

    async fn run_due_checks(&mut self) -> Result<bool> {
        let mut did_work = false;
        let now = Instant::now();
        for idx in 0..self.checks.len() {
            let name = self.checks[idx].name().to_string();
            let interval = self.checks[idx].check_interval();
            let due = self
                .last_run
                .get(&name)
                .map(|last| now.duration_since(*last) >= interval)
                .unwrap_or(true);
            if !due {
                continue;
            }
            self.last_run.insert(name.clone(), now);
            debug!(check = %name, "running check");
            if let Some(change) = self.checks[idx].check(&mut self.view).await? {
                info!(change = %change.name(), check = %name, "check produced change");
                self.queues
                    .entry(change.name().to_string())
                    .or_default()
                    .push_back(change);
                did_work = true;
            }
        }
        Ok(did_work)
    }

    async fn drain_queues(&mut self) -> Result<bool> {
        let mut did_work = false;
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            if self.running.contains(&name) {
                continue;
            }
            if self.queues.get(&name).map_or(true, |q| q.is_empty()) {
                continue;
            }

            // The peer-conflict check and the atomic register must happen
            // as one critical section under the global lock: otherwise two
            // nodes can both evaluate `can_run` against a stale peer list
            // and register two Changes that were never meant to run
            // together (e.g. two swaps from the same family).
            let lock = self.view.lock(GLOBAL_LOCK).await?;
            let peers: Vec<String> = self
                .view
                .running_changes()
                .await?
                .into_iter()
                .filter(|n| n != &name)
                .collect();
            let can_run = self
                .queues
                .get(&name)
                .and_then(|q| q.front())
                .map(|c| c.can_run(&peers))
                .unwrap_or(false);
            if !can_run {
                drop(lock);
                debug!(change = %name, "a conflicting change is running elsewhere, deferring");
                continue;
            }
            let registered = self.view.register_change(&name).await?;
            drop(lock);
            if !registered {
                debug!(change = %name, "change already owned elsewhere in the cluster, dropping local attempt");
                continue;
            }

            let mut change = match self.queues.get_mut(&name).and_then(|q| q.pop_front()) {
                Some(c) => c,
                None => continue,
            };
            if self.queues.get(&name).map_or(true, |q| q.is_empty()) {
                self.queues.remove(&name);
            }

            self.running.insert(name.clone());
            let outcome = change.step(&mut self.view).await;
            self.running.remove(&name);

            match outcome {
                Ok(StepResult::Done) => {
                    change.on_remove();
                    self.view.unregister_change(&name).await?;
                    did_work = true;
                }
                Ok(StepResult::RunAgain) => {
                    self.view.unregister_change(&name).await?;
                    self.queues.entry(name).or_default().push_back(change);
                    did_work = true;
                }
                Err(e) => {
                    change.on_remove();
                    if let Err(release_err) = self.view.unregister_change(&name).await {
                        warn!(change = %name, error = %release_err, "failed to release change registration after error");
                    }
                    return Err(e);
                }
            }
        }
        Ok(did_work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coordkeeper_core::{
        BackendFactory, ClusterView, CoordinationBackend, CoordinationClient, EnsembleDiscovery,
        InMemoryBackend,
    };
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct FixedFactory {
        backend: Arc<dyn CoordinationBackend>,
    }

    impl BackendFactory for FixedFactory {
        fn connect(&self, _connection_string: &str) -> Arc<dyn CoordinationBackend> {
            Arc::clone(&self.backend)
        }
    }

    async fn test_view() -> ClusterView {
        let backend: Arc<dyn CoordinationBackend> = Arc::new(InMemoryBackend::new());
        let factory = Arc::new(FixedFactory { backend });
        let discovery = EnsembleDiscovery::new(vec![], 8181, "/status", Duration::from_secs(30));
        let client = CoordinationClient::connect(discovery, factory).await.unwrap();
        ClusterView::new(client)
    }

    struct CountingChange {
        name: String,
        steps_remaining: u32,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Change for CountingChange {
        fn name(&self) -> &str {
            &self.name
        }

        async fn step(&mut self, _view: &mut ClusterView) -> Result<StepResult> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.steps_remaining == 0 {
                Ok(StepResult::Done)
            } else {
                self.steps_remaining -= 1;
                Ok(StepResult::RunAgain)
            }
        }
    }

    struct AlwaysFiresCheck {
        name: String,
        fired: Arc<StdMutex<bool>>,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Check for AlwaysFiresCheck {
        fn name(&self) -> &str {
            &self.name
        }

        fn check_interval(&self) -> Duration {
            Duration::from_secs(0)
        }

        async fn check(&self, _view: &mut ClusterView) -> Result<Option<Box<dyn Change>>> {
            let mut fired = self.fired.lock().unwrap();
            if *fired {
                return Ok(None);
            }
            *fired = true;
            Ok(Some(Box::new(CountingChange {
                name: "test-change".to_string(),
                steps_remaining: 2,
                counter: Arc::clone(&self.counter),
            })))
        }
    }

    #[tokio::test]
    async fn change_runs_to_completion_across_multiple_steps() {
        let view = test_view().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let check = AlwaysFiresCheck {
            name: "always".to_string(),
            fired: Arc::new(StdMutex::new(false)),
            counter: Arc::clone(&counter),
        };
        let mut controller = Controller::new(view, vec![Box::new(check)], Duration::from_millis(10));

        // First step: check fires, queues the change, but doesn't run it yet
        // because drain_queues runs after run_due_checks within the same
        // make_step call — so it *does* run on this first call.
        controller.make_step().await.unwrap();
        // Drain remaining queued re-runs.
        while controller.make_step().await.unwrap() {}

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn change_already_registered_elsewhere_is_skipped() {
        let mut view = test_view().await;
        assert!(view.register_change("test-change").await.unwrap());

        let counter = Arc::new(AtomicUsize::new(0));
        let change = CountingChange {
            name: "test-change".to_string(),
            steps_remaining: 0,
            counter: Arc::clone(&counter),
        };
        let mut controller = Controller::new(view, vec![], Duration::from_millis(10));
        controller
            .queues
            .entry("test-change".to_string())
            .or_default()
            .push_back(Box::new(change));

        controller.make_step().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0, "change owned elsewhere must not run locally");
    }

    struct FamilyExclusiveChange {
        name: String,
        family_prefix: &'static str,
        ran: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Change for FamilyExclusiveChange {
        fn name(&self) -> &str {
            &self.name
        }

        fn can_run(&self, peers: &[String]) -> bool {
            !peers.iter().any(|p| p.starts_with(self.family_prefix))
        }

        async fn step(&mut self, _view: &mut ClusterView) -> Result<StepResult> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::Done)
        }
    }

    #[tokio::test]
    async fn can_run_refuses_to_register_alongside_a_conflicting_peer() {
        let mut view = test_view().await;
        assert!(view.register_change("swap::other-node").await.unwrap());

        let ran = Arc::new(AtomicUsize::new(0));
        let change = FamilyExclusiveChange {
            name: "swap::this-node".to_string(),
            family_prefix: "swap::",
            ran: Arc::clone(&ran),
        };
        let mut controller = Controller::new(view, vec![], Duration::from_millis(10));
        controller
            .queues
            .entry("swap::this-node".to_string())
            .or_default()
            .push_back(Box::new(change));

        controller.make_step().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0, "conflicting family member elsewhere must block registration");
    }

    struct AbandonAtExitChange {
        name: String,
        removed: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl Change for AbandonAtExitChange {
        fn name(&self) -> &str {
            &self.name
        }

        fn can_run_at_exit(&self) -> bool {
            false
        }

        fn on_remove(&mut self) {
            *self.removed.lock().unwrap() = true;
        }

        async fn step(&mut self, _view: &mut ClusterView) -> Result<StepResult> {
            Ok(StepResult::RunAgain)
        }
    }

    #[tokio::test]
    async fn shutdown_abandons_changes_unsafe_to_run_at_exit() {
        let view = test_view().await;
        let removed = Arc::new(StdMutex::new(false));
        let change = AbandonAtExitChange {
            name: "unsafe-at-exit".to_string(),
            removed: Arc::clone(&removed),
        };
        let mut controller = Controller::new(view, vec![], Duration::from_millis(10));
        controller
            .queues
            .entry("unsafe-at-exit".to_string())
            .or_default()
            .push_back(Box::new(change));

        controller.drain_for_shutdown().await.unwrap();
        assert!(*removed.lock().unwrap(), "change must be abandoned via on_remove, never registered or stepped");
        assert!(controller.queues.is_empty());
    }
}
