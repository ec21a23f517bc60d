/// Relay topic prefix for a session
pub const SESSION_TOPIC_PREFIX: &str = "session:";

/// Data channel carrying presentation snapshots
pub const META_CHANNEL_LABEL: &str = "meta";

/// Data channel carrying chat messages
pub const CHAT_CHANNEL_LABEL: &str = "chat";

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// ICE candidate pool size
pub const DEFAULT_ICE_CANDIDATE_POOL_SIZE: u8 = 10;

/// Time an unconnected link is given before it is abandoned (milliseconds)
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 2_000;

/// Upper bound on waiting for camera/screen permission (milliseconds)
pub const DEFAULT_MEDIA_TIMEOUT_MS: u64 = 15_000;

/// Chat transcript length kept per session
pub const DEFAULT_MAX_TRANSCRIPT_LEN: usize = 500;

/// Buffered signaling messages per member before new ones are dropped
pub const SIGNAL_QUEUE_DEPTH: usize = 256;

/// Maximum signaling frame size in bytes (64 KiB)
pub const MAX_SIGNAL_FRAME_BYTES: usize = 64 * 1024;

/// Default HTTP port of the signaling relay
pub const DEFAULT_RELAY_PORT: u16 = 8080;
