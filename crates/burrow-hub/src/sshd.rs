//! Secure-shell server for agent sessions
//!
//! Authenticates each agent with a password credential carrying the
//! principal's bearer token and hands the connection to an
//! [`AgentSession`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_db::Store;
use burrow_router::Cluster;
use russh::server::{Config as SshConfig, Server};
use russh::MethodSet;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::HubConfig;
use crate::keys::{self, HostKeyError};
use crate::session::AgentSession;

#[derive(Debug, Error)]
pub enum SshdError {
    #[error("ensure host keys: {0}")]
    Keys(#[from] HostKeyError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The hub's secure-shell listener.
pub struct HubServer {
    config: Arc<HubConfig>,
    store: Store,
    cluster: Arc<Cluster>,
}

impl HubServer {
    pub fn new(config: Arc<HubConfig>, store: Store, cluster: Arc<Cluster>) -> Self {
        Self {
            config,
            store,
            cluster,
        }
    }

    /// Ensure host keys, then accept agent sessions until failure.
    pub async fn run(mut self) -> Result<(), SshdError> {
        let signers =
            keys::ensure_host_keys(&self.store, &self.config.sshd.host_key_algorithms).await?;

        let ssh_config = Arc::new(SshConfig {
            methods: MethodSet::PASSWORD,
            keys: signers,
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let address = format!("0.0.0.0:{}", self.config.sshd.port);
        info!(%address, "sshd started");
        self.run_on_address(ssh_config, address).await?;
        Ok(())
    }
}

impl Server for HubServer {
    type Handler = AgentSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> AgentSession {
        debug!(?peer, "handshaking");
        AgentSession::new(
            self.store.clone(),
            self.cluster.clone(),
            self.config.proxy.clone(),
            self.config.tcp.clone(),
            peer,
        )
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!(%error, "agent session ended with error");
    }
}
