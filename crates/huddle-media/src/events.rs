use huddle_shared::protocol::{ChatMessage, PresentationSnapshot};
use huddle_shared::types::{MediaKind, PeerId};

use crate::error::SessionError;
use crate::focus::FocusTarget;
use crate::tracks::TrackSet;

/// Notifications from the session loop to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerConnected(PeerId),
    PeerPresentationChanged(PeerId, PresentationSnapshot),
    /// Exactly once per peer that reached `PeerConnected`
    PeerDisconnected(PeerId),
    ChatMessage(ChatMessage),
    LocalMediaReady(TrackSet),
    RemoteTrack {
        peer: PeerId,
        kind: MediaKind,
        track_id: String,
    },
    MediaPermissionRequired(String),
    ScreenShareChanged(bool),
    FocusChanged(Option<FocusTarget>),
    TrackReplacementFailed {
        peer: PeerId,
        kind: MediaKind,
    },
    /// The session was torn down; no further events follow for it
    FatalSessionError(SessionError),
}
