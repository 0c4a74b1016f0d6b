//! Per-node supervisor daemon: wires the coordination client, cluster view,
//! broker lifecycle, and Check/Change scheduler together and runs them
//! until shutdown.
//!
//! Everything beyond this wiring — CLI argument parsing, a health-check
//! HTTP endpoint, broker id auto-provisioning from the environment — is out
//! of scope; this binary exists to drive the library crates, not to grow
//! its own surface.

mod config;
mod logging;
mod process;

use std::sync::Arc;
use std::time::Duration;

use coordkeeper_core::{
    BackendFactory, ClusterView, CoordinationBackend, CoordinationClient, EnsembleDiscovery, InMemoryBackend,
};
use coordkeeper_scheduler::{BrokerLifecycle, Check, Controller, DiskImbalanceCheck};
use tracing::{error, info};

use crate::config::AppConfig;
use crate::process::{FileBrokerProperties, SubprocessBrokerProcess};

/// Hands back a single shared in-memory backend regardless of the
/// connection string it's asked to dial.
///
/// A real deployment supplies a [`BackendFactory`] that dials its actual
/// coordination service; no such client crate is available to link against
/// here, so the daemon runs against this backend as a deliberately visible
/// stand-in rather than fabricating a fake client dependency.
struct InMemoryBackendFactory {
    backend: Arc<dyn CoordinationBackend>,
}

impl BackendFactory for InMemoryBackendFactory {
    fn connect(&self, _connection_string: &str) -> Arc<dyn CoordinationBackend> {
        Arc::clone(&self.backend)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("COORDKEEPER_CONFIG").unwrap_or_else(|_| "coordkeeperd".to_string());
    let config = AppConfig::from_file(&config_path)?;
    logging::init(&config.logging);

    info!(broker_id = %config.broker_id, "starting coordkeeperd");

    let mut discovery = EnsembleDiscovery::new(
        config.discovery.hosts.clone(),
        config.discovery.port,
        config.discovery.uri_path.clone(),
        Duration::from_secs(config.discovery.poll_interval_secs),
    );
    discovery.resolve().await.ok();
    let conn_str = discovery.current().to_string();

    let factory = Arc::new(InMemoryBackendFactory {
        backend: Arc::new(InMemoryBackend::new()),
    });
    let client = CoordinationClient::connect(discovery, factory).await?;
    let mut view = ClusterView::new(client);

    let process = SubprocessBrokerProcess::new("kafka-server-start.sh", vec![config.broker_properties_path.clone()]);
    let properties = FileBrokerProperties::open(&config.broker_properties_path)?;
    let broker_id = coordkeeper_core::BrokerId::new(config.broker_id.clone());
    let mut lifecycle = BrokerLifecycle::new(broker_id, process, properties);

    lifecycle.start(&mut view, &conn_str, Duration::from_secs(60)).await?;

    let checks: Vec<Box<dyn Check>> = vec![Box::new(DiskImbalanceCheck::new(
        config.disk_imbalance.threshold_kb,
        Duration::from_secs(config.disk_imbalance.interval_secs),
    ))];
    let mut controller = Controller::new(view, checks, Duration::from_secs(5));
    let stop = Controller::stop_flag();

    let run_stop = Arc::clone(&stop);
    tokio::select! {
        result = controller.run(run_stop) => {
            if let Err(e) = result {
                error!(error = %e, "controller loop exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    Ok(())
}
