//! Bidirectional relay between two streams.
//!
//! Each direction copies independently until its source reaches EOF, then
//! propagates the EOF as a write-side shutdown (TCP half-close) so the
//! opposite direction can keep draining. The first I/O error aborts both
//! directions and tears the pair down.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Matches the original relay buffer of 2^13 bytes.
const BUF_SIZE: usize = 8192;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes forwarded by a completed relay pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

async fn copy_half<R, W>(mut reader: R, mut writer: W) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    // Source EOF: half-close the destination, leave the other direction
    // running.
    writer.shutdown().await?;
    Ok(total)
}

/// Copy bytes between `a` and `b` until both directions have closed.
///
/// Returns the byte counts on clean completion. On error the pair is torn
/// down immediately; in-flight data in the other direction is not drained.
pub async fn relay<A, B>(a: A, b: B) -> Result<RelayStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::try_join!(
        copy_half(a_read, b_write),
        copy_half(b_read, a_write),
    )?;

    let stats = RelayStats { a_to_b, b_to_a };
    debug!(?stats, "Relay pair finished");
    Ok(stats)
}
