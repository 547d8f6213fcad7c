//! Control-plane protocol for the burrow tunnel
//!
//! The reverse forward itself rides the standard secure-shell requests
//! (`tcpip-forward`, `cancel-tcpip-forward`, `forwarded-tcpip`). The named
//! control requests the hub answers (`hint`, `server-info`) ride a dedicated
//! session channel as line-delimited JSON, defined here.

pub mod messages;

pub use messages::{encode_line, ControlReply, ControlRequest, LineBuffer, Protocol, ProtocolError};

/// User name the agent authenticates as; the password carries the token.
pub const SSH_USER: &str = "burrow";
