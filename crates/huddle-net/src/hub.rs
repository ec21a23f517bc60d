//! In-process relayed broadcast.
//!
//! Every session is a topic with a list of member inboxes. A broadcast is
//! copied into each inbox, the sender's included; a full inbox drops the
//! message rather than blocking the sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use huddle_shared::constants::SIGNAL_QUEUE_DEPTH;
use huddle_shared::protocol::WireMessage;
use huddle_shared::types::{PeerId, SessionId};

use crate::transport::{MembershipEvents, SignalingTransport, TransportError};

struct Member {
    peer: PeerId,
    inbox: mpsc::Sender<WireMessage>,
}

/// Shared topic table. Clones refer to the same hub.
#[derive(Clone, Default)]
pub struct LocalHub {
    topics: Arc<Mutex<HashMap<String, Vec<Member>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle for one participant.
    pub fn transport(&self, local: PeerId) -> HubTransport {
        HubTransport {
            hub: self.clone(),
            local,
        }
    }

    /// Drop every subscription of `peer` without telling anyone, as if its
    /// process had vanished.
    pub fn disconnect(&self, peer: &PeerId) {
        if let Ok(mut topics) = self.topics.lock() {
            for members in topics.values_mut() {
                members.retain(|m| &m.peer != peer);
            }
            topics.retain(|_, members| !members.is_empty());
        }
        debug!(peer = %peer.short(), "Disconnected from hub");
    }

    pub fn member_count(&self, session: &SessionId) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(&session.to_topic()).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn subscribe(&self, session: &SessionId, peer: &PeerId) -> Result<MembershipEvents, TransportError> {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| TransportError::Unreachable("hub lock poisoned".to_string()))?;
        let members = topics.entry(session.to_topic()).or_default();
        members.retain(|m| &m.peer != peer);
        members.push(Member {
            peer: peer.clone(),
            inbox: tx,
        });
        Ok(rx)
    }

    fn publish(
        &self,
        session: &SessionId,
        sender: &PeerId,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let topics = self
            .topics
            .lock()
            .map_err(|_| TransportError::Unreachable("hub lock poisoned".to_string()))?;
        let members = topics
            .get(&session.to_topic())
            .filter(|members| members.iter().any(|m| &m.peer == sender))
            .ok_or_else(|| TransportError::NotJoined(session.clone()))?;

        for member in members {
            if member.inbox.try_send(message.clone()).is_err() {
                warn!(
                    session = %session,
                    target = %member.peer.short(),
                    "Dropping signal for slow or closed member"
                );
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, session: &SessionId, peer: &PeerId) {
        if let Ok(mut topics) = self.topics.lock() {
            let topic = session.to_topic();
            if let Some(members) = topics.get_mut(&topic) {
                members.retain(|m| &m.peer != peer);
                if members.is_empty() {
                    topics.remove(&topic);
                }
            }
        }
    }
}

/// One participant's view of a [`LocalHub`].
#[derive(Clone)]
pub struct HubTransport {
    hub: LocalHub,
    local: PeerId,
}

#[async_trait]
impl SignalingTransport for HubTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn join(&self, session: &SessionId) -> Result<MembershipEvents, TransportError> {
        debug!(session = %session, peer = %self.local.short(), "Joining hub topic");
        self.hub.subscribe(session, &self.local)
    }

    async fn broadcast(
        &self,
        session: &SessionId,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        self.hub.publish(session, &self.local, message)
    }

    async fn leave(&self, session: &SessionId) -> Result<(), TransportError> {
        debug!(session = %session, peer = %self.local.short(), "Leaving hub topic");
        self.hub.unsubscribe(session, &self.local);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_members_including_sender() {
        let hub = LocalHub::new();
        let session = SessionId::from("room-1");
        let a = hub.transport(PeerId::from("a"));
        let b = hub.transport(PeerId::from("b"));

        let mut rx_a = a.join(&session).await.unwrap();
        let mut rx_b = b.join(&session).await.unwrap();

        a.broadcast(&session, WireMessage::Join(PeerId::from("a")))
            .await
            .unwrap();

        assert_eq!(rx_b.recv().await, Some(WireMessage::Join(PeerId::from("a"))));
        let echoed = rx_a.recv().await.unwrap();
        assert!(!echoed.is_for(a.local_peer()));
    }

    #[tokio::test]
    async fn test_no_history_for_late_joiners() {
        let hub = LocalHub::new();
        let session = SessionId::from("room-1");
        let a = hub.transport(PeerId::from("a"));
        let b = hub.transport(PeerId::from("b"));

        let _rx_a = a.join(&session).await.unwrap();
        a.broadcast(&session, WireMessage::Join(PeerId::from("a")))
            .await
            .unwrap();

        let mut rx_b = b.join(&session).await.unwrap();
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_requires_membership() {
        let hub = LocalHub::new();
        let session = SessionId::from("room-1");
        let a = hub.transport(PeerId::from("a"));

        let result = a
            .broadcast(&session, WireMessage::Join(PeerId::from("a")))
            .await;
        assert!(matches!(result, Err(TransportError::NotJoined(_))));
    }

    #[tokio::test]
    async fn test_leave_and_disconnect_remove_members() {
        let hub = LocalHub::new();
        let session = SessionId::from("room-1");
        let a = hub.transport(PeerId::from("a"));
        let b = hub.transport(PeerId::from("b"));
        let _rx_a = a.join(&session).await.unwrap();
        let _rx_b = b.join(&session).await.unwrap();
        assert_eq!(hub.member_count(&session), 2);

        a.leave(&session).await.unwrap();
        assert_eq!(hub.member_count(&session), 1);

        hub.disconnect(&PeerId::from("b"));
        assert_eq!(hub.member_count(&session), 0);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_stream() {
        let hub = LocalHub::new();
        let session = SessionId::from("room-1");
        let a = hub.transport(PeerId::from("a"));
        let b = hub.transport(PeerId::from("b"));
        let mut first = a.join(&session).await.unwrap();
        let mut second = a.join(&session).await.unwrap();
        let _rx_b = b.join(&session).await.unwrap();
        assert_eq!(hub.member_count(&session), 2);

        b.broadcast(&session, WireMessage::Join(PeerId::from("b")))
            .await
            .unwrap();
        assert!(second.recv().await.is_some());
        assert!(first.recv().await.is_none());
    }
}
