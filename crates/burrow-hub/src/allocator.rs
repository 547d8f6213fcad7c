//! Port allocator
//!
//! Binds a listener on a random free port in a half-open range. TCP tunnels
//! pass the principal's sticky hint, which is tried before the randomized
//! search.

use rand::Rng;
use thiserror::Error;
use tokio::net::TcpListener;

/// Attempts before an allocation is declared exhausted.
const MAX_ATTEMPTS: u32 = 100;

/// Half-open port range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }
}

/// Ephemeral range HTTP ingress listeners draw from. Public clients never
/// see these ports; they reach the hub's proxy port instead.
pub const HTTP_INGRESS_RANGE: PortRange = PortRange::new(15000, 20000);

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("no free port in [{start}, {end}) after {attempts} attempts")]
    Exhausted { start: u16, end: u16, attempts: u32 },
}

/// Bind a listener on a random free port in the range.
pub async fn acquire(range: PortRange) -> Result<(TcpListener, u16), AllocatorError> {
    for _ in 0..MAX_ATTEMPTS {
        let port = rand::thread_rng().gen_range(range.start..range.end);
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok((listener, port));
        }
    }
    Err(AllocatorError::Exhausted {
        start: range.start,
        end: range.end,
        attempts: MAX_ATTEMPTS,
    })
}

/// Like [`acquire`], but tries the sticky hint first when it lies in range.
/// A taken hint falls back to the randomized search rather than failing.
pub async fn acquire_with_hint(
    hint: Option<u16>,
    range: PortRange,
) -> Result<(TcpListener, u16), AllocatorError> {
    if let Some(port) = hint.filter(|port| range.contains(*port)) {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok((listener, port));
        }
    }
    acquire(range).await
}
