//! Per-listener connection limiter
//!
//! Admission never waits: when the listener is saturated the new connection
//! is refused immediately so the accept loop keeps running.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counts live connections of one listener
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    semaphore: Option<Arc<Semaphore>>,
    max: usize,
}

/// Held for the lifetime of an admitted connection
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionLimiter {
    /// Allow at most `max` concurrent connections, 0 for unlimited
    pub fn new(max: usize) -> Self {
        let semaphore = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        ConnectionLimiter { semaphore, max }
    }

    /// Admit one connection if there is room
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        match &self.semaphore {
            None => Some(ConnectionPermit { _permit: None }),
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| ConnectionPermit {
                    _permit: Some(permit),
                }),
        }
    }

    /// Configured maximum, 0 when unlimited
    pub fn max(&self) -> usize {
        self.max
    }

    /// Free slots, `None` when unlimited
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}
