//! Route cluster: virtual host → upstream address

use dashmap::DashMap;
use tracing::debug;

/// Concurrent mapping from virtual host to the upstream `host:port` the
/// public proxy should dial for it.
///
/// At most one upstream per host at any instant; [`Cluster::set`] overwrites
/// an existing entry.
#[derive(Debug, Default)]
pub struct Cluster {
    routes: DashMap<String, String>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream address for the given host, if a live forward claimed it.
    pub fn get(&self, host: &str) -> Option<String> {
        self.routes.get(host).map(|entry| entry.value().clone())
    }

    /// Route the host to the upstream address.
    pub fn set(&self, host: impl Into<String>, upstream: impl Into<String>) {
        let host = host.into();
        let upstream = upstream.into();
        debug!(%host, %upstream, "route installed");
        self.routes.insert(host, upstream);
    }

    /// Remove the host's route, if any.
    pub fn remove(&self, host: &str) {
        if self.routes.remove(host).is_some() {
            debug!(%host, "route removed");
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.routes.contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
