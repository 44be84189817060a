//! Bidirectional byte relay with joint-close semantics.
//!
//! Both directions run as their own task. The first direction to finish
//! (EOF or error) cancels the other, after which both streams are shut down
//! and dropped. Copy errors are logged and never returned to the caller.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Byte counts for a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
}

/// Relay `a` and `b` until either side finishes.
///
/// Returns immediately; the returned handle resolves once both streams are
/// closed. Callers that do not care about the outcome may drop it.
pub fn relay<A, B>(a: A, b: B, label: impl Into<String>) -> JoinHandle<RelayStats>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let label = label.into();
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let done = CancellationToken::new();

    let forward = tokio::spawn(pipe(a_read, b_write, done.clone(), label.clone(), "a->b"));
    let backward = tokio::spawn(pipe(b_read, a_write, done, label.clone(), "b->a"));

    tokio::spawn(async move {
        let a_to_b = forward.await.unwrap_or_default();
        let b_to_a = backward.await.unwrap_or_default();
        tracing::debug!(relay = %label, a_to_b, b_to_a, "Relay closed");
        RelayStats { a_to_b, b_to_a }
    })
}

const BUFFER_SIZE: usize = 16 * 1024;

async fn pipe<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    done: CancellationToken,
    label: String,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Send,
    W: AsyncWrite + Send,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(relay = %label, direction, error = %e, "Relay read error");
                    break;
                }
            },
            _ = done.cancelled() => break,
        };

        let written = tokio::select! {
            result = writer.write_all(&buf[..n]) => result,
            _ = done.cancelled() => break,
        };
        if let Err(e) = written {
            tracing::debug!(relay = %label, direction, error = %e, "Relay write error");
            break;
        }
        copied += n as u64;
    }

    // Single-fire: whichever direction gets here first closes both sides.
    done.cancel();

    if let Err(e) = writer.shutdown().await {
        tracing::trace!(relay = %label, direction, error = %e, "Shutdown after relay");
    }

    copied
}
