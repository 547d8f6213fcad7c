//! Burrow agent: the tenant-run half of the tunnel
//!
//! Dials the hub over secure shell, requests a reverse forward, and splices
//! every forwarded channel onto a fresh dial of the local service. HTTP mode
//! first builds an in-process dispatching handler so dynamic forward rules
//! can fan requests out to several local upstreams.

pub mod addr;
pub mod client;
pub mod config;
pub mod dynamic;
pub mod reconnect;

pub use addr::{derive_http_forward_address, derive_tcp_forward_address};
pub use client::{AgentError, Tunnel, TunnelOptions};
pub use config::{coalesce, AgentConfig};
pub use dynamic::{parse_rules, Dispatcher, DynamicForwardError, ForwardRule};
pub use reconnect::{backoff, run_with_reconnect, FATAL_AUTH_MARKER};
