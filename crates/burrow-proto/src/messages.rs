//! Control channel messages
//!
//! One JSON object per line in each direction. The agent drives the channel
//! in lockstep: it sends a request and reads exactly one reply before the
//! next request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tunnel protocol requested by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
}

#[derive(Debug, Error)]
#[error("unsupported protocol: {0}")]
pub struct ProtocolError(pub String);

impl FromStr for Protocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "http" => Ok(Protocol::Http),
            other => Err(ProtocolError(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// Agent-to-hub control request.
///
/// The protocol field of `hint` is carried as a plain string so the hub can
/// name an unknown protocol in its negative reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlRequest {
    Hint {
        protocol: String,
    },
    /// `protocol` is an optional override kept for legacy flows that never
    /// send a `hint`.
    ServerInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
}

/// Hub-to-agent control reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_url: Option<String>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            host_url: None,
        }
    }

    pub fn host_url(url: impl Into<String>) -> Self {
        Self {
            ok: true,
            error: None,
            host_url: Some(url.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            host_url: None,
        }
    }
}

/// Serialize a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Accumulates raw channel bytes and yields complete lines.
///
/// Channel data arrives in arbitrary chunks; a control message is only
/// complete once its trailing newline has been seen.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line completed by it, without the
    /// newline. Non-UTF-8 lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if let Ok(text) = String::from_utf8(line) {
                lines.push(text);
            }
        }
        lines
    }
}
