//! Agent configuration

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Address of the hub's secure-shell endpoint, e.g. "example.com:2222".
    #[serde(default)]
    pub remote_addr: String,
    /// Address requests are forwarded to.
    #[serde(default)]
    pub forward_addr: String,
    /// Bearer token the agent authenticates with.
    #[serde(default)]
    pub token: String,
    /// Newline-separated `"<prefix> <url>"` rules; `forward_addr` is the
    /// catch-all.
    #[serde(default)]
    pub dynamic_forwards: String,
}

/// Load the agent config from the given YAML file.
pub fn load(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// First non-empty value, or empty when all are.
pub fn coalesce<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values
        .into_iter()
        .map(Into::into)
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}
