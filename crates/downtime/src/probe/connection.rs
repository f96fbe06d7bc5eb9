//! Per-host choice between a persistent keep-alive pool and one-shot
//! connections, driven by how often the host is probed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Client;
use reqwest::redirect::Policy;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::config::ProbeConfig;
use crate::error::ProbeError;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub hot_threshold: u32,
    pub hot_window: Duration,
    pub keep_alive: Duration,
    pub max_idle_per_host: usize,
}

impl From<&ProbeConfig> for ConnectionSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            hot_threshold: config.host_hot_threshold.max(1),
            hot_window: config.host_hot_window(),
            keep_alive: config.keep_alive(),
            max_idle_per_host: config.max_idle_per_host,
        }
    }
}

/// Requests seen for one host in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostActivity {
    pub count: u32,
    pub window_start: Instant,
}

impl HostActivity {
    /// Count a request at `now`, starting a fresh window once the old one
    /// has fully elapsed.
    fn record(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_start) >= window {
            self.count = 1;
            self.window_start = now;
        } else {
            self.count = self.count.saturating_add(1);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    tls: bool,
}

#[derive(Default)]
struct ManagerState {
    activity: HashMap<String, HostActivity>,
    pools: HashMap<PoolKey, Client>,
    shut_down: bool,
}

/// The client to use for one request.
#[derive(Debug, Clone)]
pub struct Lease {
    pub client: Client,
    pub pooled: bool,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    one_shot: Client,
    state: Mutex<ManagerState>,
}

fn client_builder(settings: &ConnectionSettings) -> reqwest::ClientBuilder {
    Client::builder().connect_timeout(settings.connect_timeout).redirect(Policy::none())
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Result<Self, ProbeError> {
        let one_shot = client_builder(&settings)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        Ok(Self { settings, one_shot, state: Mutex::new(ManagerState::default()) })
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pooled_client(&self) -> Result<Client, ProbeError> {
        client_builder(&self.settings)
            .pool_max_idle_per_host(self.settings.max_idle_per_host)
            .pool_idle_timeout(self.settings.keep_alive)
            .tcp_keepalive(self.settings.keep_alive)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))
    }

    pub fn lease(&self, url: &Url) -> Result<Lease, ProbeError> {
        self.lease_at(url, Instant::now())
    }

    /// Count the request and pick a client. A host that reached the
    /// threshold inside its window gets a pool, and keeps it for the life of
    /// the manager even after its activity drops.
    pub fn lease_at(&self, url: &Url, now: Instant) -> Result<Lease, ProbeError> {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let key = PoolKey { host: host.clone(), tls: url.scheme() == "https" };

        let count = {
            let mut state = self.state();
            let count = Self::record(&mut state, &host, now, self.settings.hot_window);

            if let Some(client) = state.pools.get(&key) {
                return Ok(Lease { client: client.clone(), pooled: true });
            }
            if state.shut_down {
                return Ok(Lease { client: self.one_shot.clone(), pooled: false });
            }

            let host_has_pool = state.pools.keys().any(|existing| existing.host == host);
            if count < self.settings.hot_threshold && !host_has_pool {
                debug!(host = %host, requests = count, "Using one-shot connection");
                return Ok(Lease { client: self.one_shot.clone(), pooled: false });
            }
            count
        };

        // Client construction sets up TLS, so it runs outside the lock
        let built = self.pooled_client()?;

        let mut state = self.state();
        if state.shut_down {
            return Ok(Lease { client: self.one_shot.clone(), pooled: false });
        }
        let mut created = false;
        let client = state
            .pools
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                built
            })
            .clone();
        if created {
            info!(host = %host, tls = key.tls, requests = count, "Host is hot, created connection pool");
        }
        Ok(Lease { client, pooled: true })
    }

    fn record(state: &mut ManagerState, host: &str, now: Instant, window: Duration) -> u32 {
        let activity = state
            .activity
            .entry(host.to_string())
            .or_insert(HostActivity { count: 0, window_start: now });
        activity.record(now, window);
        activity.count
    }

    /// Count a request without leasing a client
    pub fn record_request(&self, host: &str, now: Instant) -> u32 {
        let mut state = self.state();
        Self::record(&mut state, &host.to_ascii_lowercase(), now, self.settings.hot_window)
    }

    pub fn activity(&self, host: &str) -> Option<HostActivity> {
        self.state().activity.get(&host.to_ascii_lowercase()).copied()
    }

    pub fn is_pooled(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.state().pools.keys().any(|key| key.host == host)
    }

    pub fn pool_count(&self) -> usize {
        self.state().pools.len()
    }

    /// Drop every pool. Requests already holding a client finish on it;
    /// later requests use one-shot connections.
    pub fn shutdown(&self) {
        let mut state = self.state();
        let pools = state.pools.len();
        state.pools.clear();
        state.shut_down = true;
        info!(pools, "Connection pools closed");
    }
}
