//! Forwarder discovery.
//!
//! Locating a forwarder for an identity is an external service; the library
//! only needs the [`Discovery`] trait. [`StaticDiscovery`] serves the
//! forwarder list from the config and keeps announcements in memory, which
//! is enough when every peer shares one config.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::config::NatConfig;
use crate::error::NatError;

pub trait Discovery: Send + Sync {
    /// Forwarders through which `id` may be reachable, best first.
    fn lookup_server<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<SocketAddr>, NatError>>;

    /// Forwarders a server may register with, best first.
    fn lookup_forwarders(&self) -> BoxFuture<'_, Result<Vec<SocketAddr>, NatError>>;

    /// Advertise that `id` is served through `forwarder`.
    fn announce<'a>(&'a self, id: &'a str, forwarder: SocketAddr) -> BoxFuture<'a, Result<(), NatError>>;

    /// Withdraw an earlier announcement.
    fn withdraw<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), NatError>>;
}

pub struct StaticDiscovery {
    forwarders: Vec<String>,
    announced: Mutex<HashMap<String, SocketAddr>>,
}

impl StaticDiscovery {
    pub fn new(forwarders: Vec<String>) -> Self {
        Self {
            forwarders,
            announced: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &NatConfig) -> Self {
        Self::new(config.forwarders.clone())
    }

    async fn resolve_all(&self) -> Result<Vec<SocketAddr>, NatError> {
        let mut addrs = Vec::new();
        for entry in &self.forwarders {
            match tokio::net::lookup_host(entry.as_str()).await {
                Ok(resolved) => addrs.extend(resolved),
                Err(e) => warn!(forwarder = %entry, "Cannot resolve forwarder: {e}"),
            }
        }
        if addrs.is_empty() {
            return Err(NatError::Discovery("no forwarders configured".to_string()));
        }
        Ok(addrs)
    }

    fn announced(&self) -> MutexGuard<'_, HashMap<String, SocketAddr>> {
        self.announced.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Discovery for StaticDiscovery {
    fn lookup_server<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<SocketAddr>, NatError>> {
        async move {
            let announced = self.announced().get(id).copied();
            if let Some(addr) = announced {
                return Ok(vec![addr]);
            }
            self.resolve_all().await
        }
        .boxed()
    }

    fn lookup_forwarders(&self) -> BoxFuture<'_, Result<Vec<SocketAddr>, NatError>> {
        self.resolve_all().boxed()
    }

    fn announce<'a>(&'a self, id: &'a str, forwarder: SocketAddr) -> BoxFuture<'a, Result<(), NatError>> {
        async move {
            debug!(id, %forwarder, "Announced");
            self.announced().insert(id.to_string(), forwarder);
            Ok(())
        }
        .boxed()
    }

    fn withdraw<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), NatError>> {
        async move {
            self.announced().remove(id);
            Ok(())
        }
        .boxed()
    }
}
