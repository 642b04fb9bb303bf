//! No authentication handler

use super::AuthOutcome;
use crate::channel::Channel;

/// The "no authentication required" method
///
/// Always succeeds, hands the channel back untouched and reports no user.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl NoAuth {
    /// Accept the client without any sub-negotiation
    pub async fn authenticate(&self, channel: Channel) -> AuthOutcome {
        AuthOutcome::accepted(channel, None)
    }
}
