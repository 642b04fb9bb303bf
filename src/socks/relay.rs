//! Bidirectional relay between two channels
//!
//! Two directional pumps run concurrently. The relay ends as soon as either
//! of them ends, whatever the reason, and both channels are closed before it
//! returns. The idle timeout is shared: it only fires when no bytes moved in
//! either direction for the whole window.

use crate::channel::Channel;
use crate::error::ProxyError;
use crate::socks::consts::DEFAULT_BUFFER_SIZE;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Last time any byte moved, shared by both pumps
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Activity {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

/// Relay bytes between `client` and `target` until one side finishes
///
/// Returns `Ok` on an orderly end of stream, [`ProxyError::IdleTimeout`]
/// when nothing moved for `idle_timeout`, and [`ProxyError::Cancelled`]
/// when `cancel` fires.
pub async fn relay(
    client: Channel,
    target: Channel,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let client_addr = client.remote_addr();
    let target_addr = target.remote_addr();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);
    let activity = Activity::new();

    let result = tokio::select! {
        result = pump(&mut client_read, &mut target_write, &activity, idle_timeout) => {
            result.map(|bytes| debug!("{} -> {} finished: {} bytes", client_addr, target_addr, bytes))
        }
        result = pump(&mut target_read, &mut client_write, &activity, idle_timeout) => {
            result.map(|bytes| debug!("{} -> {} finished: {} bytes", target_addr, client_addr, bytes))
        }
        _ = cancel.cancelled() => Err(ProxyError::Cancelled.into()),
    };

    let mut client = client_read.unsplit(client_write);
    let mut target = target_read.unsplit(target_write);
    client.close().await;
    target.close().await;

    result
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    idle_timeout: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = loop {
            let remaining = idle_timeout.saturating_sub(activity.idle_for());
            if remaining.is_zero() {
                return Err(ProxyError::IdleTimeout(idle_timeout).into());
            }
            // On expiry re-check: the other direction may have been active
            if let Ok(read) = tokio::time::timeout(remaining, reader.read(&mut buf)).await {
                break read?;
            }
        };

        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        activity.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
