use std::sync::Arc;

use tracing::debug;

use huddle_net::{SignalingTransport, TransportError};
use huddle_shared::protocol::{SignalMessage, SignalType, WireMessage};
use huddle_shared::types::{PeerId, SessionId};

/// Outbound negotiation traffic of one directed link.
#[derive(Clone)]
pub struct SignalSink {
    transport: Arc<dyn SignalingTransport>,
    session: SessionId,
    local: PeerId,
    remote: PeerId,
}

impl SignalSink {
    pub fn new(transport: Arc<dyn SignalingTransport>, session: SessionId, remote: PeerId) -> Self {
        let local = transport.local_peer().clone();
        Self {
            transport,
            session,
            local,
            remote,
        }
    }

    pub fn message(&self, signal: SignalType) -> WireMessage {
        WireMessage::Signal(SignalMessage {
            sender: self.local.clone(),
            target: self.remote.clone(),
            session: self.session.clone(),
            signal,
        })
    }

    pub async fn send(&self, signal: SignalType) -> Result<(), TransportError> {
        debug!(
            remote = %self.remote.short(),
            signal = signal.name(),
            "Sending signal"
        );
        self.transport
            .broadcast(&self.session, self.message(signal))
            .await
    }
}
