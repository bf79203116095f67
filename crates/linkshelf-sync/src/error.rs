//! Mirror and session error types.

use thiserror::Error;

use crate::feed::FeedError;
use crate::gateway::GatewayError;
use crate::record::DraftError;

/// Failure of one mirror operation. Mirror state is unchanged when returned.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid draft: {0}")]
    InvalidDraft(#[from] DraftError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("session ended before the operation completed")]
    SessionEnded,

    #[error("mirror is not attached to a session")]
    Inactive,
}

/// Session lifecycle error type.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no signed-in session")]
    NotSignedIn,

    #[error("initial fetch failed: {0}")]
    Fetch(GatewayError),

    #[error("feed subscription failed: {0}")]
    Subscribe(#[from] FeedError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}
