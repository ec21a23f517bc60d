//! The signaling transport contract.
//!
//! A transport joins a session, fans broadcasts out to every current member
//! and hands back a stream of [`WireMessage`]s. Delivery is at-most-once,
//! unordered across senders and ordered per sender. There is no history: a
//! member only sees what was sent after it joined.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use huddle_shared::error::ProtocolError;
use huddle_shared::protocol::WireMessage;
use huddle_shared::types::{PeerId, SessionId};

/// Stream of membership and negotiation messages for one joined session.
pub type MembershipEvents = mpsc::Receiver<WireMessage>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Signaling transport unreachable: {0}")]
    Unreachable(String),

    #[error("Not joined to session {0}")]
    NotJoined(SessionId),

    #[error("Session {0} is full")]
    SessionFull(SessionId),

    #[error("Signaling transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Identity this transport announces and filters by.
    fn local_peer(&self) -> &PeerId;

    /// Subscribe to `session`. Joining again replaces the previous
    /// subscription and its stream.
    async fn join(&self, session: &SessionId) -> Result<MembershipEvents, TransportError>;

    /// Deliver `message` to every current member of `session`.
    async fn broadcast(&self, session: &SessionId, message: WireMessage)
        -> Result<(), TransportError>;

    /// Best-effort unsubscribe.
    async fn leave(&self, session: &SessionId) -> Result<(), TransportError>;
}
