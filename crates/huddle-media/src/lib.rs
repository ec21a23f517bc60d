// Peer-to-peer session orchestration: one negotiated link per remote peer,
// per-link metadata and chat channels, and local capture switching.

pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod focus;
mod link_task;
pub mod loopback;
pub mod manager;
pub mod metadata;
pub mod peer_link;
pub mod rtc;
pub mod signaling;
pub mod tracks;
pub mod webrtc_peer;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::{IceMode, SessionConfig, Topology};
pub use error::SessionError;
pub use events::SessionEvent;
pub use focus::FocusTarget;
pub use manager::{ConnectionManager, PeerSummary, SessionHandle};
pub use peer_link::{CloseReason, LinkState};
pub use rtc::{RtcFactory, RtcPeer, Role};
pub use tracks::{LocalMediaSource, LocalTrack, MediaError, TrackSet, VideoSource};
pub use webrtc_peer::WebRtcFactory;

/// Install the default log subscriber for embedders that have none.
/// `RUST_LOG` overrides the filter. A second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("huddle_media=info,huddle_net=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}
