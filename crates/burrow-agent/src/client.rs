//! Hub client session
//!
//! Establishes one tunnel: dial the hub, authenticate with the bearer
//! token, open the reverse forward, exchange `hint` and `server-info` over
//! the control channel, then splice every forwarded channel onto a fresh
//! dial of the local forward address.

use std::sync::Arc;

use async_trait::async_trait;
use burrow_conn::splice;
use burrow_proto::{encode_line, ControlReply, ControlRequest, LineBuffer, Protocol, SSH_USER};
use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("secure channel: {0}")]
    Ssh(#[from] russh::Error),

    /// Password auth was rejected; the wording matches what an exhausted
    /// auth negotiation reports so callers can spot it by substring.
    #[error("authentication failed: no supported methods remain")]
    AuthRejected,

    #[error("control request rejected: {0}")]
    Rejected(String),

    #[error("malformed control reply: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed by the hub")]
    Disconnected,
}

/// What one tunnel needs to come up.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Hub secure-shell endpoint, e.g. "example.com:2222".
    pub remote_addr: String,
    /// Local address forwarded connections are spliced to.
    pub forward_addr: String,
    pub token: String,
    pub protocol: Protocol,
}

/// An established tunnel. Dropping it tears the session down.
pub struct Tunnel {
    handle: client::Handle<AgentHandler>,
    control: Channel<Msg>,
    control_buf: LineBuffer,
    host_url: String,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Dial the hub and bring the tunnel up.
    pub async fn establish(opts: &TunnelOptions) -> Result<Self, AgentError> {
        let cancel = CancellationToken::new();
        let handler = AgentHandler {
            forward_addr: opts.forward_addr.clone(),
            cancel: cancel.clone(),
        };

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, opts.remote_addr.as_str(), handler).await?;

        let authenticated = handle.authenticate_password(SSH_USER, &opts.token).await?;
        if !authenticated {
            return Err(AgentError::AuthRejected);
        }

        let mut control = handle.channel_open_session().await?;
        let mut control_buf = LineBuffer::new();

        let hint = ControlRequest::Hint {
            protocol: opts.protocol.to_string(),
        };
        send_request(&mut control, &hint).await?;
        let reply = read_reply(&mut control, &mut control_buf).await?;
        if !reply.ok {
            return Err(AgentError::Rejected(reply.error.unwrap_or_default()));
        }

        // Open the remote listener; rport 0 lets the hub choose the port.
        handle.tcpip_forward("127.0.0.1", 0).await?;

        send_request(&mut control, &ControlRequest::ServerInfo { protocol: None }).await?;
        let reply = read_reply(&mut control, &mut control_buf).await?;
        let host_url = match (reply.ok, reply.host_url) {
            (true, Some(url)) => url,
            (_, _) => return Err(AgentError::Rejected(reply.error.unwrap_or_default())),
        };

        info!(remote = %opts.remote_addr, %host_url, "tunneling connection established");
        Ok(Self {
            handle,
            control,
            control_buf,
            host_url,
            cancel,
        })
    }

    /// Public URL the hub assigned to this tunnel.
    pub fn host_url(&self) -> &str {
        &self.host_url
    }

    /// Pump the control channel until the session dies; forwarded channels
    /// keep being served meanwhile. Returns the terminating error.
    pub async fn closed(mut self) -> AgentError {
        loop {
            match self.control.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    // Nothing is expected here outside a request/reply
                    // exchange; drain so the buffer stays consistent.
                    let _ = self.control_buf.push(&data);
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                    self.cancel.cancel();
                    return AgentError::Disconnected;
                }
                Some(_) => {}
            }
        }
    }

    /// Tear the tunnel down and disconnect from the hub.
    pub async fn close(mut self) -> Result<(), AgentError> {
        self.cancel.cancel();
        self.handle
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await?;
        Ok(())
    }
}

async fn send_request(
    control: &mut Channel<Msg>,
    request: &ControlRequest,
) -> Result<(), AgentError> {
    let line = encode_line(request)?;
    control.data(&line[..]).await?;
    Ok(())
}

async fn read_reply(
    control: &mut Channel<Msg>,
    buf: &mut LineBuffer,
) -> Result<ControlReply, AgentError> {
    loop {
        match control.wait().await {
            Some(ChannelMsg::Data { data }) => {
                if let Some(line) = buf.push(&data).into_iter().next() {
                    return Ok(serde_json::from_str(&line)?);
                }
            }
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                return Err(AgentError::Disconnected)
            }
            Some(_) => {}
        }
    }
}

/// Client-side handler: accepts any host key (the operator pins elsewhere
/// or fronts the hub with TLS) and splices forwarded channels to the local
/// service.
struct AgentHandler {
    forward_addr: String,
    cancel: CancellationToken,
}

#[async_trait]
impl client::Handler for AgentHandler {
    type Error = AgentError;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            origin = %format!("{originator_address}:{originator_port}"),
            forward_to = %self.forward_addr,
            "forwarding connection"
        );
        let forward_addr = self.forward_addr.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let local = match TcpStream::connect(&forward_addr).await {
                Ok(local) => local,
                Err(err) => {
                    error!(error = %err, %forward_addr, "failed to dial local forward");
                    return;
                }
            };
            splice(channel.into_stream(), local, cancel.child_token()).await;
            debug!("forwarding connection closed");
        });
        Ok(())
    }
}
