//! Agent session: the per-connection state machine on the hub
//!
//! After the handshake authenticates a principal, the session answers the
//! agent's control requests (`hint`, `server-info`) and its reverse-forward
//! request. A `tcpip-forward` allocates an ingress listener, installs the
//! route (HTTP), and runs an acceptor that splices every ingress connection
//! to a fresh `forwarded-tcpip` channel. One cancellation token scopes the
//! whole session: firing it stops the acceptor, closes the listener, and
//! removes the route.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_conn::splice;
use burrow_db::{principal, Store};
use burrow_proto::{encode_line, ControlReply, ControlRequest, LineBuffer, Protocol};
use burrow_router::Cluster;
use rand::Rng;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocator::{self, PortRange, HTTP_INGRESS_RANGE};
use crate::config::{ProxyConfig, TcpConfig};

/// Collision-fallback attempts for an HTTP host.
const SUBDOMAIN_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("encode control reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-connection hub-side state for one agent.
pub struct AgentSession {
    store: Store,
    cluster: Arc<Cluster>,
    proxy: ProxyConfig,
    tcp: TcpConfig,
    peer: Option<SocketAddr>,

    principal: Option<principal::Model>,
    protocol: Protocol,
    /// Assigned virtual host (HTTP). Starts as `<subdomain>.<proxy domain>`
    /// and may gain a collision suffix when the forward is established.
    host: String,
    /// Port allocated for a TCP forward in this session.
    tcp_port: Option<u16>,

    control_channel: Option<ChannelId>,
    control_buf: LineBuffer,

    /// Released exactly once, after the HTTP route is installed.
    host_ready_tx: watch::Sender<Option<String>>,
    host_ready_rx: watch::Receiver<Option<String>>,

    cancel: CancellationToken,
}

impl AgentSession {
    pub fn new(
        store: Store,
        cluster: Arc<Cluster>,
        proxy: ProxyConfig,
        tcp: TcpConfig,
        peer: Option<SocketAddr>,
    ) -> Self {
        let (host_ready_tx, host_ready_rx) = watch::channel(None);
        Self {
            store,
            cluster,
            proxy,
            tcp,
            peer,
            principal: None,
            protocol: Protocol::Http,
            host: String::new(),
            tcp_port: None,
            control_channel: None,
            control_buf: LineBuffer::new(),
            host_ready_tx,
            host_ready_rx,
            cancel: CancellationToken::new(),
        }
    }

    fn reply(
        &self,
        session: &mut Session,
        channel: ChannelId,
        reply: &ControlReply,
    ) -> Result<(), SessionError> {
        let line = encode_line(reply)?;
        session.data(channel, CryptoVec::from(line))?;
        Ok(())
    }

    async fn handle_control_line(
        &mut self,
        channel: ChannelId,
        line: &str,
        session: &mut Session,
    ) -> Result<(), SessionError> {
        let request = match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => request,
            Err(_) => {
                let kind = serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
                let reply = match kind {
                    Some(kind) => ControlReply::err(format!("unknown request: {kind}")),
                    None => ControlReply::err("malformed control request"),
                };
                return self.reply(session, channel, &reply);
            }
        };

        match request {
            ControlRequest::Hint { protocol } => {
                let reply = match protocol.parse::<Protocol>() {
                    Ok(protocol) => {
                        debug!(peer = ?self.peer, %protocol, "protocol hint");
                        self.protocol = protocol;
                        ControlReply::ok()
                    }
                    Err(err) => ControlReply::err(err.to_string()),
                };
                self.reply(session, channel, &reply)
            }
            ControlRequest::ServerInfo { protocol } => {
                if let Some(raw) = protocol {
                    match raw.parse::<Protocol>() {
                        Ok(protocol) => self.protocol = protocol,
                        Err(err) => {
                            return self.reply(session, channel, &ControlReply::err(err.to_string()))
                        }
                    }
                }
                self.server_info(channel, session)
            }
        }
    }

    /// Answer `server-info`. TCP answers immediately; HTTP awaits the
    /// host-ready latch so the reply never precedes the route.
    fn server_info(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), SessionError> {
        match self.protocol {
            Protocol::Tcp => {
                let port = self
                    .tcp_port
                    .map(i32::from)
                    .or_else(|| self.principal.as_ref().map(|p| p.last_tcp_port))
                    .unwrap_or(0);
                let domain = if self.tcp.domain.is_empty() {
                    self.proxy.domain.as_str()
                } else {
                    self.tcp.domain.as_str()
                };
                let host = domain.split(':').next().unwrap_or(domain);
                let reply = ControlReply::host_url(format!("tcp://{host}:{port}"));
                self.reply(session, channel, &reply)
            }
            Protocol::Http => {
                let mut rx = self.host_ready_rx.clone();
                let scheme = self.proxy.scheme.clone();
                let handle = session.handle();
                tokio::spawn(async move {
                    let host = match rx.wait_for(|host| host.is_some()).await {
                        Ok(guard) => match guard.clone() {
                            Some(host) => host,
                            None => return,
                        },
                        Err(_) => return,
                    };
                    let reply = ControlReply::host_url(format!("{scheme}://{host}"));
                    let Ok(line) = encode_line(&reply) else { return };
                    let _ = handle.data(channel, CryptoVec::from(line)).await;
                });
                Ok(())
            }
        }
    }
}

#[async_trait]
impl russh::server::Handler for AgentSession {
    type Error = SessionError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.store.principal_by_token(password).await {
            Ok(Some(principal)) => {
                debug!(user, principal = principal.id, peer = ?self.peer, "agent authenticated");
                self.host = format!("{}.{}", principal.subdomain, self.proxy.domain);
                self.principal = Some(principal);
                Ok(Auth::Accept)
            }
            Ok(None) => {
                debug!(user, peer = ?self.peer, "rejected unknown token");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
            Err(err) => {
                error!(error = %err, "failed to look up principal by token");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    /// The first session channel becomes the control channel.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.control_channel.is_some() {
            debug!(peer = ?self.peer, "rejected extra session channel");
            return Ok(false);
        }
        debug!(id = ?channel.id(), "control channel opened");
        self.control_channel = Some(channel.id());
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.control_channel != Some(channel) {
            return Ok(());
        }
        let lines = self.control_buf.push(data);
        for line in lines {
            self.handle_control_line(channel, &line, session).await?;
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // The hub chooses the port; a caller-chosen one is rejected.
        if *port != 0 {
            debug!(peer = ?self.peer, requested = *port, "rejected forward with non-zero port");
            return Ok(false);
        }
        let Some(principal) = self.principal.clone() else {
            return Ok(false);
        };

        let acquired = match self.protocol {
            Protocol::Tcp => {
                let hint = u16::try_from(principal.last_tcp_port)
                    .ok()
                    .filter(|hint| *hint != 0);
                allocator::acquire_with_hint(
                    hint,
                    PortRange::new(self.tcp.port_start, self.tcp.port_end),
                )
                .await
            }
            Protocol::Http => allocator::acquire(HTTP_INGRESS_RANGE).await,
        };
        let (listener, allocated) = match acquired {
            Ok(acquired) => acquired,
            Err(err) => {
                error!(peer = ?self.peer, error = %err, "failed to find an available port");
                return Ok(false);
            }
        };
        let upstream = format!("127.0.0.1:{allocated}");
        info!(peer = ?self.peer, forward_to = %upstream, "reverse tunnel server started");
        *port = u32::from(allocated);

        if self.protocol == Protocol::Tcp {
            self.tcp_port = Some(allocated);
            if principal.last_tcp_port != i32::from(allocated) {
                // Save the used port for the next time; best effort.
                let store = self.store.clone();
                let id = principal.id;
                tokio::spawn(async move {
                    if let Err(err) = store.update_last_tcp_port(id, i32::from(allocated)).await {
                        error!(principal = id, error = %err, "failed to update principal last TCP port");
                    }
                });
            }
        }

        let route_host = if self.protocol == Protocol::Http {
            let (host, exhausted) = resolve_host(&self.cluster, &self.host);
            if exhausted {
                warn!(%host, retries = SUBDOMAIN_RETRIES, "no unused subdomain; keeping the last candidate");
            }
            self.host = host.clone();
            self.cluster.set(host.clone(), upstream);
            let _ = self.host_ready_tx.send(Some(host.clone()));
            Some(host)
        } else {
            None
        };

        tokio::spawn(accept_loop(
            listener,
            session.handle(),
            self.cancel.clone(),
            self.cluster.clone(),
            route_host,
            address.to_string(),
            allocated,
        ));
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = ?self.peer, "forward cancel request");
        self.cancel.cancel();
        Ok(true)
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        // Connection gone; tear down the forward and its route.
        self.cancel.cancel();
    }
}

/// Accept ingress connections and splice each onto a fresh
/// `forwarded-tcpip` channel until the session is cancelled.
async fn accept_loop(
    listener: TcpListener,
    handle: Handle,
    cancel: CancellationToken,
    cluster: Arc<Cluster>,
    route_host: Option<String>,
    bind_addr: String,
    port: u16,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (ingress, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        if !cancel.is_cancelled() {
                            error!(error = %err, "failed to accept incoming tunnel connection");
                        }
                        break;
                    }
                };
                debug!(%peer, "tunneling connection");
                let handle = handle.clone();
                let cancel = cancel.clone();
                let bind_addr = bind_addr.clone();
                tokio::spawn(async move {
                    let channel = match handle
                        .channel_open_forwarded_tcpip(
                            bind_addr,
                            u32::from(port),
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await
                    {
                        Ok(channel) => channel,
                        Err(err) => {
                            error!(%peer, error = %err, "failed to open tunneling channel");
                            return;
                        }
                    };
                    splice(channel.into_stream(), ingress, cancel.child_token()).await;
                    debug!(%peer, "tunneling connection closed");
                });
            }
        }
    }
    drop(listener);
    if let Some(host) = route_host {
        cluster.remove(&host);
    }
    info!("reverse tunnel server stopped");
}

/// Resolve the final host for an HTTP forward. When the base host is taken,
/// up to [`SUBDOMAIN_RETRIES`] candidates of the form `hex8(rand)-<host>`
/// are tried; if every candidate collides the last one is kept anyway and
/// the second value is true.
fn resolve_host(cluster: &Cluster, base: &str) -> (String, bool) {
    if !cluster.contains(base) {
        return (base.to_string(), false);
    }
    let mut candidate = base.to_string();
    for _ in 0..SUBDOMAIN_RETRIES {
        candidate = format!("{}-{}", random_hex(8), base);
        if !cluster.contains(&candidate) {
            return (candidate, false);
        }
    }
    (candidate, true)
}

fn random_hex(chars: usize) -> String {
    let mut bytes = vec![0u8; chars.div_ceil(2)];
    rand::thread_rng().fill(&mut bytes[..]);
    let mut out = hex::encode(bytes);
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_shape() {
        let value = random_hex(8);
        assert_eq!(value.len(), 8);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(random_hex(5).len(), 5);
    }

    #[test]
    fn test_resolve_host_free_base() {
        let cluster = Cluster::new();
        let (host, exhausted) = resolve_host(&cluster, "unknwon.localhost:3000");
        assert_eq!(host, "unknwon.localhost:3000");
        assert!(!exhausted);
    }

    #[test]
    fn test_resolve_host_collision_gets_suffix() {
        let cluster = Cluster::new();
        cluster.set("unknwon.localhost:3000", "127.0.0.1:15001");

        let (host, exhausted) = resolve_host(&cluster, "unknwon.localhost:3000");
        assert!(!exhausted);
        let (prefix, rest) = host.split_once('-').unwrap();
        assert_eq!(prefix.len(), 8);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "unknwon.localhost:3000");
    }
}
