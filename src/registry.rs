//! Shared registry of open device proxies.
//!
//! Connecting a [`Chassis`] is expensive (one TCP connect per populated
//! site plus the status feed), so applications that address the same
//! appliance from several places share one proxy through a registry keyed
//! by host address. The registry is an explicit value the application owns
//! and passes around, not process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chassis::Chassis;
use crate::config::ChassisConfig;
use crate::error::ChassisResult;

/// Keeps at most one live [`Chassis`] per host address.
#[derive(Default)]
pub struct ChassisRegistry {
    config: ChassisConfig,
    open: Mutex<HashMap<String, Arc<Chassis>>>,
}

impl ChassisRegistry {
    /// A registry whose proxies connect with `config`.
    pub fn new(config: ChassisConfig) -> Self {
        ChassisRegistry {
            config,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The proxy for `host`, connecting one if none is open yet.
    ///
    /// The registry lock is not held across the connect, so a slow appliance
    /// does not block lookups of other hosts. If two callers race to open the
    /// same host, the first proxy registered wins and the loser's is dropped.
    pub async fn open(&self, host: &str) -> ChassisResult<Arc<Chassis>> {
        if let Some(existing) = self.open.lock().await.get(host) {
            return Ok(Arc::clone(existing));
        }

        let fresh = Arc::new(Chassis::connect(host, self.config.clone()).await?);

        let mut open = self.open.lock().await;
        if let Some(existing) = open.get(host) {
            debug!(host, "lost open race, reusing existing proxy");
            return Ok(Arc::clone(existing));
        }
        info!(host, "chassis registered");
        open.insert(host.to_string(), Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Open proxies for every host in `hosts`, concurrently. Fails if any
    /// single open fails; proxies opened before the failure stay registered.
    pub async fn open_many(&self, hosts: &[&str]) -> ChassisResult<Vec<Arc<Chassis>>> {
        try_join_all(hosts.iter().map(|host| self.open(host))).await
    }

    /// The proxy for `host`, if one is open.
    pub async fn get(&self, host: &str) -> Option<Arc<Chassis>> {
        self.open.lock().await.get(host).map(Arc::clone)
    }

    /// Drop the proxy for `host` from the registry. Outstanding handles stay
    /// usable; the proxy itself closes once the last one is dropped.
    pub async fn close(&self, host: &str) -> bool {
        let removed = self.open.lock().await.remove(host).is_some();
        if removed {
            info!(host, "chassis deregistered");
        }
        removed
    }

    /// Hosts with an open proxy.
    pub async fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.open.lock().await.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}
