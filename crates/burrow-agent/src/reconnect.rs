//! Reconnect loop
//!
//! Re-dials the hub forever with exponential backoff. A connection that
//! lives past one minute since the last failure resets the failure counter.
//! A rejected token is fatal: the loop returns so the caller can exit.

use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::client::{AgentError, Tunnel, TunnelOptions};

/// Error substring that marks authentication as unrecoverable.
pub const FATAL_AUTH_MARKER: &str = "no supported methods remain";

/// Uninterrupted connection time after which the failure counter resets.
const COOL_DOWN: Duration = Duration::from_secs(60);

/// Saturation for the backoff exponent; keeps the delay around a quarter
/// hour on an endless failure streak.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// `2^(failed/3 + 1)` seconds.
pub fn backoff(failed: u32) -> Duration {
    let exponent = (failed / 3 + 1).min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(1u64 << exponent)
}

/// Keep the tunnel up until authentication fails for good.
pub async fn run_with_reconnect(opts: TunnelOptions) -> AgentError {
    let mut failed: u32 = 0;
    let mut cooldown_after = Instant::now() + COOL_DOWN;
    loop {
        let err = match Tunnel::establish(&opts).await {
            Ok(tunnel) => {
                info!(host_url = %tunnel.host_url(), "tunnel is ready");
                tunnel.closed().await
            }
            Err(err) => err,
        };

        if Instant::now() > cooldown_after {
            failed = 0;
        }
        let delay = backoff(failed);
        error!(
            error = %err,
            "failed to connect to server, will reconnect in {}s",
            delay.as_secs()
        );
        if err.to_string().contains(FATAL_AUTH_MARKER) {
            return err;
        }

        tokio::time::sleep(delay).await;
        cooldown_after = Instant::now() + COOL_DOWN;
        failed += 1;
    }
}
