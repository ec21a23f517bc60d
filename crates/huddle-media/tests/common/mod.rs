//! Participants driven through a `ConnectionManager` over loopback links.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use huddle_media::loopback::{LoopbackMedia, LoopbackNetwork};
use huddle_media::{ConnectionManager, SessionConfig, SessionEvent, SessionHandle};
use huddle_net::{LocalHub, SignalingTransport};
use huddle_shared::types::PeerId;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Participant {
    pub id: PeerId,
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
    pub media: Arc<LoopbackMedia>,
}

impl Participant {
    pub fn start(hub: &LocalHub, net: &LoopbackNetwork, id: &str, config: SessionConfig) -> Self {
        let transport = Arc::new(hub.transport(PeerId::from(id)));
        Self::with_transport(transport, net, config)
    }

    pub fn with_transport(
        transport: Arc<dyn SignalingTransport>,
        net: &LoopbackNetwork,
        config: SessionConfig,
    ) -> Self {
        let id = transport.local_peer().clone();
        let media = Arc::new(LoopbackMedia::new());
        let (handle, events) =
            ConnectionManager::new(config, transport, Arc::new(net.factory(id.clone())), media.clone())
                .start();
        Self {
            id,
            handle,
            events,
            media,
        }
    }

    pub async fn wait_for(&mut self, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    pub async fn wait_connected(&mut self, peer: &PeerId) {
        self.wait_for(|e| matches!(e, SessionEvent::PeerConnected(p) if p == peer))
            .await;
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        liveness_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

pub fn disturbed(events: &[SessionEvent]) -> bool {
    events.iter().any(|e| {
        matches!(
            e,
            SessionEvent::PeerDisconnected(_) | SessionEvent::FatalSessionError(_)
        )
    })
}
