//! Ensemble discovery: finds the current coordination-store connection
//! string by polling a discovery endpoint (an Exhibitor-style REST API) over
//! a shuffled host list, as described in spec.md §4.1.

use crate::error::{CoreError, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_FALLBACK: &str = "localhost:2181";
const REQUEST_TIMEOUT: Duration = Duration::from_millis(3100);

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    servers: Vec<String>,
    port: u16,
}

/// Polls a discovery endpoint for the current set of coordination-store
/// hosts and builds the connection string the backend should use.
///
/// `master_hosts` is the originally supplied, immutable fallback host list.
/// `poll_hosts` starts out equal to it but, after a successful poll, is
/// replaced with the server list the endpoint itself returned — mirroring
/// how an Exhibitor-style ensemble grows and shrinks over time. If every
/// host in `poll_hosts` fails, resolution falls back to polling
/// `master_hosts` instead of giving up, per spec.md §4.1.
///
/// An empty `master_hosts` list (the sentinel for "no discovery endpoint
/// configured") short-circuits straight to [`DEFAULT_FALLBACK`], matching
/// the original's behavior of falling back to a local single-node store
/// when no ensemble is configured.
pub struct EnsembleDiscovery {
    master_hosts: Vec<String>,
    poll_hosts: Vec<String>,
    port: u16,
    uri_path: String,
    poll_interval: Duration,
    client: reqwest::Client,
    last_poll: Option<Instant>,
    current: String,
}

impl EnsembleDiscovery {
    /// Build a discovery poller. `hosts` is the master/fallback list of
    /// discovery endpoint hosts to try (shuffled on every poll); an empty
    /// list means "no discovery configured", and [`DEFAULT_FALLBACK`] is
    /// always used. `port` is the port every discovery host is queried on.
    pub fn new(hosts: Vec<String>, port: u16, uri_path: impl Into<String>, poll_interval: Duration) -> Self {
        EnsembleDiscovery {
            master_hosts: hosts.clone(),
            poll_hosts: hosts,
            port,
            uri_path: uri_path.into(),
            poll_interval,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client with a fixed timeout always builds"),
            last_poll: None,
            current: DEFAULT_FALLBACK.to_string(),
        }
    }

    /// The connection string last resolved by [`Self::resolve`], without
    /// triggering a new poll.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// Re-poll the discovery endpoint if `poll_interval` has elapsed since
    /// the last poll, and return whether the resolved connection string
    /// changed as a result. Does not mutate `current` if the poll interval
    /// has not yet elapsed, or if every host failed.
    pub async fn resolve(&mut self) -> Result<bool> {
        if self.master_hosts.is_empty() {
            let changed = self.current != DEFAULT_FALLBACK;
            self.current = DEFAULT_FALLBACK.to_string();
            return Ok(changed);
        }

        if let Some(last) = self.last_poll {
            if last.elapsed() < self.poll_interval {
                return Ok(false);
            }
        }

        match self.poll_shuffled(&self.poll_hosts.clone()).await {
            Some((conn_string, servers)) => {
                self.last_poll = Some(Instant::now());
                let changed = conn_string != self.current;
                if changed {
                    debug!(previous = %self.current, next = %conn_string, "coordination ensemble changed");
                }
                self.current = conn_string;
                self.poll_hosts = servers;
                return Ok(changed);
            }
            None => {
                warn!("every configured discovery host failed, falling back to the master host list");
            }
        }

        match self.poll_shuffled(&self.master_hosts.clone()).await {
            Some((conn_string, servers)) => {
                self.last_poll = Some(Instant::now());
                let changed = conn_string != self.current;
                self.current = conn_string;
                self.poll_hosts = servers;
                Ok(changed)
            }
            None => Err(CoreError::Discovery("no discovery host responded".into())),
        }
    }

    /// Try each host in a shuffled copy of `hosts` until one answers.
    /// Returns the resolved connection string and the raw server list the
    /// response carried (used to refresh `poll_hosts`).
    async fn poll_shuffled(&self, hosts: &[String]) -> Option<(String, Vec<String>)> {
        let mut shuffled = hosts.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        for host in &shuffled {
            match self.poll_one(host).await {
                Ok(result) => return Some(result),
                Err(e) => warn!(host = %host, error = %e, "discovery endpoint unreachable"),
            }
        }
        None
    }

    async fn poll_one(&self, host: &str) -> Result<(String, Vec<String>)> {
        let url = format!("http://{}:{}{}", host, self.port, self.uri_path);
        let resp: DiscoveryResponse = self.client.get(&url).send().await?.json().await?;
        if resp.servers.is_empty() {
            return Err(CoreError::Discovery(format!("{} returned no servers", host)));
        }
        let joined = resp
            .servers
            .iter()
            .map(|s| format!("{}:{}", s, resp.port))
            .collect::<Vec<_>>()
            .join(",");
        Ok((joined, resp.servers))
    }
}
