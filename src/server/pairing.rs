//! Split-port connection pairing
//!
//! In split channel mode a client opens one connection to the listener's
//! read port and one to its write port. Whichever arrives first waits here,
//! keyed by remote IP, until its partner shows up. Waiting sockets older than
//! the pairing window are evicted by a periodic sweep and closed.

use crate::channel::{Channel, SplitPortStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How long a half waits for its partner
pub const PAIRING_WINDOW: Duration = Duration::from_secs(5);

/// How often stale halves are evicted
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Which split port a socket arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSide {
    /// Carries client-to-server bytes
    Read,
    /// Carries server-to-client bytes
    Write,
}

#[derive(Debug)]
struct Waiting {
    stream: TcpStream,
    since: Instant,
}

#[derive(Debug, Default)]
struct Halves {
    read: HashMap<IpAddr, Waiting>,
    write: HashMap<IpAddr, Waiting>,
}

impl SplitSide {
    fn other(self) -> SplitSide {
        match self {
            SplitSide::Read => SplitSide::Write,
            SplitSide::Write => SplitSide::Read,
        }
    }
}

impl Halves {
    fn side(&mut self, side: SplitSide) -> &mut HashMap<IpAddr, Waiting> {
        match side {
            SplitSide::Read => &mut self.read,
            SplitSide::Write => &mut self.write,
        }
    }
}

/// Pairs read-port and write-port sockets from the same remote IP
#[derive(Debug)]
pub struct ConnectionPairing {
    halves: Mutex<Halves>,
    window: Duration,
}

impl Default for ConnectionPairing {
    fn default() -> Self {
        ConnectionPairing::new(PAIRING_WINDOW)
    }
}

impl ConnectionPairing {
    /// Create a pairing service with the given window
    pub fn new(window: Duration) -> Self {
        ConnectionPairing {
            halves: Mutex::new(Halves::default()),
            window,
        }
    }

    /// Offer a newly accepted socket
    ///
    /// Returns the composed channel when the partner was already waiting,
    /// `None` when this socket is now the one waiting.
    pub fn try_pair(&self, stream: TcpStream, side: SplitSide) -> io::Result<Option<Channel>> {
        let ip = stream.peer_addr()?.ip().to_canonical();

        let mut halves = self.halves.lock();
        let partner = halves.side(side.other()).remove(&ip);
        match partner {
            Some(waiting) if waiting.since.elapsed() <= self.window => {
                drop(halves);
                let (reader, writer) = match side {
                    SplitSide::Read => (stream, waiting.stream),
                    SplitSide::Write => (waiting.stream, stream),
                };
                debug!("Paired split connection from {}", ip);
                Channel::split(SplitPortStream::new(reader, writer)).map(Some)
            }
            expired => {
                let previous = halves.side(side).insert(
                    ip,
                    Waiting {
                        stream,
                        since: Instant::now(),
                    },
                );
                drop(halves);

                if expired.is_some() {
                    trace!("Dropped expired {:?} half from {}", side.other(), ip);
                }
                if previous.is_some() {
                    trace!("Replaced waiting {:?} half from {}", side, ip);
                }
                trace!("{:?} half from {} waiting for its partner", side, ip);
                Ok(None)
            }
        }
    }

    /// Close halves that waited longer than the window, returning how many
    pub fn sweep(&self) -> usize {
        let window = self.window;
        let evicted: Vec<Waiting> = {
            let mut guard = self.halves.lock();
            let halves = &mut *guard;
            let mut evicted = Vec::new();
            for map in [&mut halves.read, &mut halves.write] {
                let stale: Vec<IpAddr> = map
                    .iter()
                    .filter(|(_, w)| w.since.elapsed() > window)
                    .map(|(ip, _)| *ip)
                    .collect();
                evicted.extend(stale.iter().filter_map(|ip| map.remove(ip)));
            }
            evicted
        };

        if !evicted.is_empty() {
            debug!("Evicted {} unpaired split connections", evicted.len());
        }
        evicted.len()
    }

    /// Number of halves waiting on the read and write ports
    pub fn pending(&self) -> (usize, usize) {
        let halves = self.halves.lock();
        (halves.read.len(), halves.write.len())
    }

    /// Sweep every `interval` until `cancel` fires
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Connect to a fresh listener, returning (client side, accepted side)
    async fn connection() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pair_read_first() {
        let pairing = ConnectionPairing::default();
        let (mut upstream, read_half) = connection().await;
        let (mut downstream, write_half) = connection().await;

        assert!(pairing.try_pair(read_half, SplitSide::Read).unwrap().is_none());
        assert_eq!(pairing.pending(), (1, 0));

        let mut channel = pairing
            .try_pair(write_half, SplitSide::Write)
            .unwrap()
            .expect("paired");
        assert_eq!(pairing.pending(), (0, 0));

        upstream.write_all(b"up").await.unwrap();
        let mut buf = [0u8; 2];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up");

        channel.write_all(b"down").await.unwrap();
        let mut buf = [0u8; 4];
        downstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"down");
    }

    #[tokio::test]
    async fn test_pair_write_first() {
        let pairing = ConnectionPairing::default();
        let (_upstream, read_half) = connection().await;
        let (_downstream, write_half) = connection().await;

        assert!(pairing.try_pair(write_half, SplitSide::Write).unwrap().is_none());
        assert_eq!(pairing.pending(), (0, 1));
        assert!(pairing.try_pair(read_half, SplitSide::Read).unwrap().is_some());
        assert_eq!(pairing.pending(), (0, 0));
    }

    #[tokio::test]
    async fn test_same_side_does_not_pair() {
        let pairing = ConnectionPairing::default();
        let (_a, first) = connection().await;
        let (_b, second) = connection().await;

        assert!(pairing.try_pair(first, SplitSide::Read).unwrap().is_none());
        assert!(pairing.try_pair(second, SplitSide::Read).unwrap().is_none());
        assert_eq!(pairing.pending(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_halves() {
        let pairing = ConnectionPairing::default();
        let (mut client, read_half) = connection().await;
        let (_other, write_half) = connection().await;

        assert!(pairing.try_pair(read_half, SplitSide::Read).unwrap().is_none());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(pairing.sweep(), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(pairing.sweep(), 1);
        assert_eq!(pairing.pending(), (0, 0));

        // The evicted socket was closed
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        // A late partner finds nothing and waits itself
        assert!(pairing.try_pair(write_half, SplitSide::Write).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_partner_not_used() {
        let pairing = ConnectionPairing::default();
        let (_a, read_half) = connection().await;
        let (_b, write_half) = connection().await;

        assert!(pairing.try_pair(read_half, SplitSide::Read).unwrap().is_none());
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(pairing.try_pair(write_half, SplitSide::Write).unwrap().is_none());
        assert_eq!(pairing.pending(), (0, 1));
    }
}
