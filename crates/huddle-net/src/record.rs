//! Shared-record signaling: one mutable row per session holding the offer,
//! the answer and each side's ICE candidates, with change notification.
//!
//! This is the two-party special case of the broadcast contract. Joining
//! claims the caller slot, else the callee slot. Field changes are turned back
//! into [`WireMessage`]s by an observer task, so the rest of the stack cannot
//! tell this transport from a broadcast relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use huddle_shared::constants::SIGNAL_QUEUE_DEPTH;
use huddle_shared::protocol::{SignalMessage, SignalType, WireMessage};
use huddle_shared::types::{PeerId, SessionId};

use crate::transport::{MembershipEvents, SignalingTransport, TransportError};

/// The shared row of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub caller: Option<PeerId>,
    pub callee: Option<PeerId>,
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub caller_ice: Vec<String>,
    pub callee_ice: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Caller,
    Callee,
}

impl SessionRecord {
    fn slot_of(&self, peer: &PeerId) -> Option<Slot> {
        if self.caller.as_ref() == Some(peer) {
            Some(Slot::Caller)
        } else if self.callee.as_ref() == Some(peer) {
            Some(Slot::Callee)
        } else {
            None
        }
    }

    fn vacate(&mut self, slot: Slot) {
        match slot {
            // the caller owns the offer, so its departure resets the row
            Slot::Caller => *self = SessionRecord::default(),
            Slot::Callee => {
                self.callee = None;
                self.answer = None;
                self.callee_ice.clear();
            }
        }
    }
}

/// Table of session rows. Clones refer to the same store.
#[derive(Clone, Default)]
pub struct RecordStore {
    rows: Arc<Mutex<HashMap<SessionId, watch::Sender<SessionRecord>>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, local: PeerId) -> RecordTransport {
        RecordTransport {
            store: self.clone(),
            local,
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Current contents of a session row.
    pub fn get(&self, session: &SessionId) -> SessionRecord {
        self.rows
            .lock()
            .ok()
            .and_then(|rows| rows.get(session).map(|tx| tx.borrow().clone()))
            .unwrap_or_default()
    }

    /// Apply `f` to the row and notify observers if anything changed.
    pub fn update<R>(
        &self,
        session: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<R, TransportError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| TransportError::Unreachable("record lock poisoned".to_string()))?;
        let tx = rows
            .entry(session.clone())
            .or_insert_with(|| watch::channel(SessionRecord::default()).0);

        let mut result = None;
        tx.send_if_modified(|record| {
            let before = record.clone();
            result = Some(f(record));
            *record != before
        });
        result.ok_or_else(|| TransportError::Unreachable("record update skipped".to_string()))
    }

    fn subscribe(&self, session: &SessionId) -> Result<watch::Receiver<SessionRecord>, TransportError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| TransportError::Unreachable("record lock poisoned".to_string()))?;
        Ok(rows
            .entry(session.clone())
            .or_insert_with(|| watch::channel(SessionRecord::default()).0)
            .subscribe())
    }
}

/// One participant's view of a [`RecordStore`].
pub struct RecordTransport {
    store: RecordStore,
    local: PeerId,
    observers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
}

impl RecordTransport {
    fn stop_observer(&self, session: &SessionId) {
        if let Ok(mut observers) = self.observers.lock() {
            if let Some(handle) = observers.remove(session) {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for RecordTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn join(&self, session: &SessionId) -> Result<MembershipEvents, TransportError> {
        let local = self.local.clone();
        let slot = self.store.update(session, |record| {
            if let Some(slot) = record.slot_of(&local) {
                return Some(slot);
            }
            if record.caller.is_none() {
                record.caller = Some(local.clone());
                Some(Slot::Caller)
            } else if record.callee.is_none() {
                record.callee = Some(local.clone());
                Some(Slot::Callee)
            } else {
                None
            }
        })?;
        let slot = slot.ok_or_else(|| TransportError::SessionFull(session.clone()))?;
        info!(session = %session, peer = %self.local.short(), slot = ?slot, "Claimed session record slot");

        let mut watch_rx = self.store.subscribe(session)?;
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let session_name = session.clone();
        let local = self.local.clone();

        let observer = tokio::spawn(async move {
            // Start from an empty view so fields written before we joined are
            // delivered once.
            let mut seen = SessionRecord::default();
            loop {
                let current = watch_rx.borrow_and_update().clone();
                for message in diff(&seen, &current, slot, &local, &session_name) {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                seen = current;
                if watch_rx.changed().await.is_err() {
                    break;
                }
            }
            debug!(session = %session_name, "Record observer terminated");
        });

        if let Ok(mut observers) = self.observers.lock() {
            if let Some(previous) = observers.insert(session.clone(), observer) {
                previous.abort();
            }
        }

        Ok(rx)
    }

    async fn broadcast(
        &self,
        session: &SessionId,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let local = self.local.clone();
        let joined = self.store.update(session, |record| {
            let Some(slot) = record.slot_of(&local) else {
                return false;
            };
            match message {
                // presence is implied by holding a slot
                WireMessage::Join(_) => {}
                WireMessage::Leave(_) => record.vacate(slot),
                WireMessage::Signal(signal) => match (slot, signal.signal) {
                    (Slot::Caller, SignalType::Offer(sdp)) => record.offer = Some(sdp),
                    (Slot::Callee, SignalType::Answer(sdp)) => record.answer = Some(sdp),
                    (Slot::Caller, SignalType::IceCandidate(c)) => record.caller_ice.push(c),
                    (Slot::Callee, SignalType::IceCandidate(c)) => record.callee_ice.push(c),
                    (Slot::Caller, SignalType::IceBatch(cs)) => record.caller_ice.extend(cs),
                    (Slot::Callee, SignalType::IceBatch(cs)) => record.callee_ice.extend(cs),
                    (_, SignalType::Hangup) => record.vacate(slot),
                    (slot, other) => {
                        debug!(slot = ?slot, signal = other.name(), "Signal has no record field");
                    }
                },
            }
            true
        })?;

        if joined {
            Ok(())
        } else {
            Err(TransportError::NotJoined(session.clone()))
        }
    }

    async fn leave(&self, session: &SessionId) -> Result<(), TransportError> {
        self.stop_observer(session);
        let local = self.local.clone();
        self.store.update(session, |record| {
            if let Some(slot) = record.slot_of(&local) {
                record.vacate(slot);
            }
        })?;
        debug!(session = %session, peer = %self.local.short(), "Released session record slot");
        Ok(())
    }
}

impl Drop for RecordTransport {
    fn drop(&mut self) {
        if let Ok(mut observers) = self.observers.lock() {
            for (_, handle) in observers.drain() {
                handle.abort();
            }
        }
    }
}

/// Messages a member in `slot` should see for the change `before -> after`.
fn diff(
    before: &SessionRecord,
    after: &SessionRecord,
    slot: Slot,
    local: &PeerId,
    session: &SessionId,
) -> Vec<WireMessage> {
    let mut out = Vec::new();
    let signal = |sender: &PeerId, signal: SignalType| {
        WireMessage::Signal(SignalMessage {
            sender: sender.clone(),
            target: local.clone(),
            session: session.clone(),
            signal,
        })
    };

    match slot {
        Slot::Caller => {
            if before.callee != after.callee {
                if let Some(gone) = &before.callee {
                    out.push(WireMessage::Leave(gone.clone()));
                }
                if let Some(callee) = &after.callee {
                    out.push(WireMessage::Join(callee.clone()));
                }
            }
            let Some(callee) = &after.callee else {
                return out;
            };
            if after.answer.is_some() && before.answer != after.answer {
                if let Some(sdp) = &after.answer {
                    out.push(signal(callee, SignalType::Answer(sdp.clone())));
                }
            }
            let fresh = new_entries(&before.callee_ice, &after.callee_ice);
            if !fresh.is_empty() {
                out.push(signal(callee, SignalType::IceBatch(fresh)));
            }
        }
        Slot::Callee => {
            if before.caller.is_some() && before.caller != after.caller {
                if let Some(gone) = &before.caller {
                    out.push(WireMessage::Leave(gone.clone()));
                }
            }
            let Some(caller) = &after.caller else {
                return out;
            };
            if after.offer.is_some() && before.offer != after.offer {
                if let Some(sdp) = &after.offer {
                    out.push(signal(caller, SignalType::Offer(sdp.clone())));
                }
            }
            let fresh = new_entries(&before.caller_ice, &after.caller_ice);
            if !fresh.is_empty() {
                out.push(signal(caller, SignalType::IceBatch(fresh)));
            }
        }
    }
    out
}

fn new_entries(before: &[String], after: &[String]) -> Vec<String> {
    if after.starts_with(before) {
        after[before.len()..].to_vec()
    } else {
        after.to_vec()
    }
}
