//! Connection splicing
//!
//! Carries bytes both ways between two streams until either side finishes.
//! The first copier to return (end of stream, error, or reset) fires a shared
//! one-shot signal; both endpoints are then shut down so the peer copier is
//! released by a short read.

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bytes moved in each direction by [`splice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceSummary {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
}

/// Copy bytes between `a` and `b` in both directions until one side closes
/// or `cancel` fires.
///
/// I/O errors are swallowed and treated as end-of-stream. Cancelling the
/// token stops both copiers and shuts the write halves down, which unblocks
/// any in-flight read on the peer.
pub async fn splice<A, B>(a: A, b: B, cancel: CancellationToken) -> SpliceSummary
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_a, mut write_a) = io::split(a);
    let (mut read_b, mut write_b) = io::split(b);

    let done = cancel.child_token();

    let forward = {
        let done = done.clone();
        tokio::spawn(async move {
            let copied = tokio::select! {
                copied = io::copy(&mut read_a, &mut write_b) => copied.unwrap_or(0),
                _ = done.cancelled() => 0,
            };
            done.cancel();
            let _ = write_b.shutdown().await;
            copied
        })
    };

    let backward = {
        let done = done.clone();
        tokio::spawn(async move {
            let copied = tokio::select! {
                copied = io::copy(&mut read_b, &mut write_a) => copied.unwrap_or(0),
                _ = done.cancelled() => 0,
            };
            done.cancel();
            let _ = write_a.shutdown().await;
            copied
        })
    };

    let (a_to_b, b_to_a) = tokio::join!(forward, backward);
    let summary = SpliceSummary {
        a_to_b: a_to_b.unwrap_or(0),
        b_to_a: b_to_a.unwrap_or(0),
    };
    trace!(a_to_b = summary.a_to_b, b_to_a = summary.b_to_a, "splice finished");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_splice_moves_bytes_both_ways() {
        let (client_a, server_a) = tokio::io::duplex(64);
        let (client_b, server_b) = tokio::io::duplex(64);

        let task = tokio::spawn(splice(server_a, server_b, CancellationToken::new()));

        let (mut read_a, mut write_a) = tokio::io::split(client_a);
        let (mut read_b, mut write_b) = tokio::io::split(client_b);

        write_a.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        read_b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        write_b.write_all(b"pong!").await.unwrap();
        let mut got = [0u8; 5];
        read_a.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong!");

        // Closing one side ends the splice and closes the other.
        drop(write_a);
        drop(read_a);
        let summary = task.await.unwrap();
        assert_eq!(summary.a_to_b, 4);

        let mut rest = Vec::new();
        read_b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_splice_stops_on_cancel() {
        let (_client_a, server_a) = tokio::io::duplex(64);
        let (_client_b, server_b) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(splice(server_a, server_b, cancel.clone()));

        cancel.cancel();
        let summary = task.await.unwrap();
        assert_eq!(summary, SpliceSummary::default());
    }

    #[tokio::test]
    async fn test_splice_large_transfer_is_lossless() {
        let (client_a, server_a) = tokio::io::duplex(1024);
        let (client_b, server_b) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(server_a, server_b, CancellationToken::new()));

        let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let (_read, mut write) = tokio::io::split(client_a);
            write.write_all(&payload).await.unwrap();
            write.shutdown().await.unwrap();
        });

        let (mut read_b, _write_b) = tokio::io::split(client_b);
        let mut received = Vec::new();
        read_b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        let summary = task.await.unwrap();
        assert_eq!(summary.a_to_b, expected.len() as u64);
    }
}
