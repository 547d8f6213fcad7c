//! Burrow hub: the publicly reachable half of the tunnel
//!
//! Accepts agent sessions over secure shell, allocates ingress endpoints
//! (TCP ports and HTTP virtual hosts), and routes public traffic back
//! through each agent's channel.

pub mod allocator;
pub mod config;
pub mod keys;
pub mod proxy;
pub mod session;
pub mod sshd;
pub mod web;

pub use config::{DatabaseConfig, HubConfig, ProxyConfig, SshdConfig, TcpConfig, WebConfig};
pub use session::AgentSession;
pub use sshd::HubServer;
