//! `BrokerLifecycle`: the local broker subprocess state machine, gated by
//! leader/ISR safety checks and the clean-election configuration invariant,
//! per spec.md §4.3.

use std::time::Duration;

use coordkeeper_core::{BrokerId, ClusterView};
use tracing::{info, warn};

use crate::error::Result;

/// Local lifecycle state of the broker subprocess this supervisor owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// The broker subprocess has never been started by this supervisor
    /// instance.
    NotStarted,
    /// The broker subprocess is running.
    Running,
    /// The broker subprocess was stopped by this supervisor.
    Stopped,
}

/// External collaborator: the broker subprocess itself. A production
/// implementation wraps an actual child process handle; this trait is the
/// seam tests substitute with a fake.
pub trait BrokerProcess: Send + Sync {
    /// Whether the subprocess is currently alive.
    fn is_running(&self) -> bool;

    /// Launch the subprocess. Idempotent if already running.
    fn start(&mut self) -> Result<()>;

    /// Send the subprocess a graceful shutdown signal. Idempotent if not
    /// running.
    fn stop(&mut self) -> Result<()>;
}

/// External collaborator: the broker's on-disk properties file. The
/// supervisor reads `unclean.leader.election.enable` out of it to gate
/// leader/ISR safety checks, and writes `broker.id`/`zookeeper.connect`
/// into it before every start (spec.md §6).
pub trait BrokerProperties: Send + Sync {
    /// Read a single property's raw string value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a property in memory. Not visible on disk until [`Self::dump`].
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove a property in memory. Not visible on disk until
    /// [`Self::dump`].
    fn delete(&mut self, key: &str) -> Result<()>;

    /// Flush pending `set`/`delete` edits to durable storage.
    fn dump(&mut self) -> Result<()>;
}

/// Drives one broker subprocess through NOT_STARTED → RUNNING → STOPPED.
pub struct BrokerLifecycle<P, Pr> {
    id: BrokerId,
    process: P,
    properties: Pr,
    state: LifecycleState,
    poll_interval: Duration,
}

impl<P, Pr> BrokerLifecycle<P, Pr>
where
    P: BrokerProcess,
    Pr: BrokerProperties,
{
    /// Build a lifecycle controller for broker `id`, in
    /// [`LifecycleState::NotStarted`].
    pub fn new(id: BrokerId, process: P, properties: Pr) -> Self {
        BrokerLifecycle {
            id,
            process,
            properties,
            state: LifecycleState::NotStarted,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Current local lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether the clean-election gate named in spec.md §4.3 is active:
    /// `unclean.leader.election.enable` is explicitly `"false"`, so a
    /// remaining in-sync replica is guaranteed to be chosen as the next
    /// leader rather than a stale out-of-sync one. When the gate is
    /// inactive, unclean elections are permitted and the leader/ISR safety
    /// scans below are skipped entirely — there is nothing unsafe to guard
    /// against.
    fn clean_election_gate_active(&self) -> Result<bool> {
        let value = self.properties.get("unclean.leader.election.enable")?;
        Ok(value.as_deref() == Some("false"))
    }

    /// Whether this broker is both running locally and still has a live
    /// registration node in the coordination store.
    pub async fn is_running_and_registered(&mut self, view: &mut ClusterView) -> Result<bool> {
        Ok(self.process.is_running() && view.is_broker_registered(&self.id).await?)
    }

    /// Scan every partition for an election still settling elsewhere: any
    /// partition whose leader or ISR references a broker id that is not
    /// currently active. Only meaningful when the clean-election gate is
    /// active; returns `true` unconditionally when it is not.
    async fn election_elsewhere_in_progress(&mut self, view: &mut ClusterView) -> Result<bool> {
        if !self.clean_election_gate_active()? {
            return Ok(false);
        }
        let active: std::collections::HashSet<String> =
            view.broker_ids().await?.into_iter().map(|id| id.0).collect();
        for topic in view.topics().await? {
            let assignment = view.partition_assignment(&topic).await?;
            for partition_key in assignment.partitions.keys() {
                let partition: u32 = match partition_key.parse() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let state = view.partition_state(&topic, partition).await?;
                let leader_active = state.leader.map(|l| active.contains(&l.to_string())).unwrap_or(false);
                let isr_active = state.isr.iter().all(|r| active.contains(&r.to_string()));
                if !leader_active || !isr_active {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Scan every partition for this broker currently being the leader or
    /// an in-sync replica. Only meaningful when the clean-election gate is
    /// active; returns `true` (safe, gate inactive, no scan performed)
    /// unconditionally otherwise.
    async fn safe_to_stop(&mut self, view: &mut ClusterView) -> Result<bool> {
        if !self.clean_election_gate_active()? {
            return Ok(true);
        }
        for topic in view.topics().await? {
            let assignment = view.partition_assignment(&topic).await?;
            for partition_key in assignment.partitions.keys() {
                let partition: u32 = match partition_key.parse() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let state = view.partition_state(&topic, partition).await?;
                if state.is_leader(&self.id) || state.in_isr(&self.id) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Start the broker subprocess and wait for it to register itself with
    /// the coordination store. Before starting, if the clean-election gate
    /// is active, waits out any election still settling elsewhere in the
    /// cluster rather than risk starting into an unstable topology
    /// (spec.md §4.3, scenario S6); returns `Ok(false)` without starting in
    /// that case, leaving the caller to retry later.
    ///
    /// `conn_str` is written into the broker's properties file as
    /// `zookeeper.connect` alongside `broker.id`, then flushed, before the
    /// subprocess is launched (spec.md §6).
    pub async fn start(&mut self, view: &mut ClusterView, conn_str: &str, timeout: Duration) -> Result<bool> {
        if self.state == LifecycleState::Running {
            return Ok(true);
        }

        if self.election_elsewhere_in_progress(view).await? {
            warn!(broker = %self.id, "an election is still settling elsewhere, deferring start");
            return Ok(false);
        }

        self.properties.set("broker.id", &self.id.0)?;
        self.properties.set("zookeeper.connect", conn_str)?;
        self.properties.dump()?;

        self.process.start()?;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if view.is_broker_registered(&self.id).await? {
                self.state = LifecycleState::Running;
                info!(broker = %self.id, "broker registered after start");
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                warn!(broker = %self.id, "broker did not register before timeout");
                self.state = LifecycleState::Running;
                return Ok(true);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop the broker subprocess and wait for its registration node to
    /// disappear from the coordination store. Always terminates the
    /// subprocess regardless of the clean-election gate; the gate only
    /// controls whether the leader/ISR safety scan runs beforehand.
    /// Returns `false` (subprocess still stopped) if the scan found this
    /// broker still leading or in the ISR of some partition when the gate
    /// was active, so the caller knows the stop was not a clean one.
    pub async fn stop(&mut self, view: &mut ClusterView, timeout: Duration) -> Result<bool> {
        if self.state != LifecycleState::Running {
            self.state = LifecycleState::Stopped;
            return Ok(true);
        }

        let safe = self.safe_to_stop(view).await?;
        if !safe {
            warn!(broker = %self.id, "stopping while still leading or in-sync somewhere");
        }

        self.process.stop()?;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if !view.is_broker_registered(&self.id).await? {
                self.state = LifecycleState::Stopped;
                info!(broker = %self.id, "broker deregistered after stop");
                return Ok(safe);
            }
            if std::time::Instant::now() >= deadline {
                warn!(broker = %self.id, "broker registration outlived stop timeout");
                self.state = LifecycleState::Stopped;
                return Ok(safe);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
