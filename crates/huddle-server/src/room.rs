use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info};

use huddle_shared::constants::SIGNAL_QUEUE_DEPTH;

use crate::error::ServerError;

/// Connection-scoped member id. Peer ids are only known once a client
/// announces itself, so the relay keys members by socket.
pub type MemberId = u64;

/// A session's members and their outbound frame queues.
struct Room {
    members: HashMap<MemberId, mpsc::Sender<String>>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
        }
    }

    /// Forward a frame to everyone except the sender. Members whose socket
    /// task is gone are pruned here.
    fn fan_out(&mut self, session: &str, from: MemberId, frame: &str) {
        self.members.retain(|member, tx| {
            if *member == from {
                return true;
            }
            match tx.try_send(frame.to_string()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(session, member, "Dropping frame for slow member");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Every live session on this relay. Clones share the same table.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    next_member: Arc<AtomicU64>,
    max_members: usize,
}

impl RoomRegistry {
    /// `max_members == 0` means unlimited.
    pub fn new(max_members: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            next_member: Arc::new(AtomicU64::new(1)),
            max_members,
        }
    }

    /// Join a session (created if missing). Returns the member id and its
    /// frame receiver.
    pub async fn join(&self, session: &str) -> Result<(MemberId, mpsc::Receiver<String>), ServerError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(session.to_string()).or_insert_with(Room::new);
        if self.max_members > 0 && room.members.len() >= self.max_members {
            return Err(ServerError::SessionFull(session.to_string()));
        }

        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        room.members.insert(member, tx);
        info!(
            session,
            member,
            members = room.members.len(),
            "Member joined session"
        );
        Ok((member, rx))
    }

    /// Leave a session. Auto-deletes the session if it becomes empty.
    pub async fn leave(&self, session: &str, member: MemberId) {
        let mut rooms = self.rooms.write().await;
        let should_remove = match rooms.get_mut(session) {
            Some(room) => {
                room.members.remove(&member);
                info!(
                    session,
                    member,
                    members = room.members.len(),
                    "Member left session"
                );
                room.members.is_empty()
            }
            None => false,
        };

        if should_remove {
            rooms.remove(session);
            debug!(session, "Removed empty session");
        }
    }

    pub async fn publish(&self, session: &str, from: MemberId, frame: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(session) {
            room.fan_out(session, from, frame);
        }
    }

    pub async fn member_count(&self, session: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(session)
            .map_or(0, |room| room.members.len())
    }

    pub async fn session_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_leave_removes_empty_session() {
        let rooms = RoomRegistry::new(16);
        let (member, _rx) = rooms.join("room-1").await.unwrap();
        assert_eq!(rooms.member_count("room-1").await, 1);

        rooms.leave("room-1", member).await;
        assert_eq!(rooms.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let rooms = RoomRegistry::new(16);
        let (a, mut a_rx) = rooms.join("room-1").await.unwrap();
        let (_b, mut b_rx) = rooms.join("room-1").await.unwrap();
        let (_c, mut c_rx) = rooms.join("room-2").await.unwrap();

        rooms.publish("room-1", a, "hello").await;

        assert_eq!(b_rx.try_recv().unwrap(), "hello");
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_member_cap() {
        let rooms = RoomRegistry::new(2);
        let _a = rooms.join("room-1").await.unwrap();
        let _b = rooms.join("room-1").await.unwrap();
        assert!(matches!(
            rooms.join("room-1").await,
            Err(ServerError::SessionFull(_))
        ));
        assert!(rooms.join("room-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_members_pruned_on_publish() {
        let rooms = RoomRegistry::new(16);
        let (a, _a_rx) = rooms.join("room-1").await.unwrap();
        let (_b, b_rx) = rooms.join("room-1").await.unwrap();
        drop(b_rx);

        rooms.publish("room-1", a, "hello").await;
        assert_eq!(rooms.member_count("room-1").await, 1);
    }
}
