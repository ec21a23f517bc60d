//! The platform peer-connection seam.
//!
//! A [`PeerLink`](crate::peer_link::PeerLink) drives one [`RtcPeer`] and
//! consumes its [`RtcEvent`]s. `webrtc_peer` realizes it with webrtc-rs,
//! `loopback` in memory.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use huddle_shared::types::{MediaKind, PeerId};

use crate::tracks::{LocalTrack, TrackSet};

#[derive(Error, Debug)]
pub enum RtcError {
    #[error("WebRTC error: {0}")]
    Platform(String),

    #[error("Remote description not set")]
    NoRemoteDescription,

    #[error("No outgoing {0} sender")]
    NoSender(MediaKind),

    #[error("Data channel not open: {0}")]
    ChannelNotOpen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Transport-level connection state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl RtcConnectionState {
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            RtcConnectionState::Disconnected | RtcConnectionState::Failed | RtcConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtcEvent {
    /// A local ICE candidate, JSON-encoded candidate init
    LocalCandidate(String),
    GatheringComplete,
    ConnectionState(RtcConnectionState),
    ChannelOpen(String),
    ChannelMessage { label: String, payload: String },
    RemoteTrack { kind: MediaKind, track_id: String },
}

#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Create and apply the local offer.
    async fn create_offer(&self) -> Result<String, RtcError>;

    /// Create and apply the local answer. Requires the remote offer.
    async fn create_answer(&self) -> Result<String, RtcError>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), RtcError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), RtcError>;

    /// Swap the track on the existing sender of `track.kind`, no renegotiation.
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), RtcError>;

    async fn send_text(&self, label: &str, payload: String) -> Result<(), RtcError>;

    async fn close(&self) -> Result<(), RtcError>;
}

#[async_trait]
pub trait RtcFactory: Send + Sync {
    /// Build a connection toward `remote` with one sender per track in
    /// `tracks`. The initiator also opens the `meta` and `chat` channels.
    async fn create_peer(
        &self,
        remote: &PeerId,
        role: Role,
        tracks: &TrackSet,
        events: mpsc::Sender<RtcEvent>,
    ) -> Result<Arc<dyn RtcPeer>, RtcError>;
}
