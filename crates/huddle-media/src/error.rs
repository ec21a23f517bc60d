use thiserror::Error;

use huddle_net::TransportError;
use huddle_shared::types::{PeerId, SessionId};

use crate::tracks::MediaError;

/// Errors returned by [`SessionHandle`](crate::manager::SessionHandle) calls
/// and carried by `SessionEvent::FatalSessionError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Peer {peer} did not connect in time")]
    NegotiationTimeout { peer: PeerId },

    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Peer link to {peer} failed: {reason}")]
    PeerLinkFailure { peer: PeerId, reason: String },

    #[error("Not joined to a session")]
    NotJoined,

    #[error("Already joined to session {0}")]
    AlreadyJoined(SessionId),

    #[error("No connected peers")]
    NoConnectedPeers,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Session manager stopped")]
    Stopped,
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<MediaError> for SessionError {
    fn from(e: MediaError) -> Self {
        SessionError::MediaAcquisition(e.to_string())
    }
}
