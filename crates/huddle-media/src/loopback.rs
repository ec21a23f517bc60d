//! In-memory peer connections and capture devices.
//!
//! `LoopbackNetwork` pairs the endpoints two processes create toward each
//! other and "connects" them once both have applied local and remote
//! descriptions and received at least one candidate. Media is only track
//! identity; nothing is encoded. Used by the integration tests and by
//! headless embedders that only need chat and presentation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use huddle_shared::constants::{CHAT_CHANNEL_LABEL, META_CHANNEL_LABEL};
use huddle_shared::types::{MediaKind, PeerId};

use crate::rtc::{RtcConnectionState, RtcError, RtcEvent, RtcFactory, RtcPeer, Role};
use crate::tracks::{LocalMediaSource, LocalTrack, MediaError, TrackSet, TrackSource};

struct Endpoint {
    generation: u64,
    events: mpsc::Sender<RtcEvent>,
    senders: HashMap<MediaKind, String>,
    local_description: bool,
    remote_description: bool,
    candidates_received: usize,
    connected: bool,
}

impl Endpoint {
    fn emit(&self, event: RtcEvent) {
        if self.events.try_send(event).is_err() {
            warn!("Loopback event dropped");
        }
    }

    fn ready(&self) -> bool {
        self.local_description && self.remote_description && self.candidates_received > 0
    }
}

#[derive(Default)]
struct NetState {
    next_generation: u64,
    /// Keyed by (owner, remote)
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
}

impl NetState {
    fn endpoint(&mut self, key: &(PeerId, PeerId), generation: u64) -> Result<&mut Endpoint, RtcError> {
        self.endpoints
            .get_mut(key)
            .filter(|e| e.generation == generation)
            .ok_or_else(|| RtcError::Platform("peer connection closed".to_string()))
    }

    fn try_connect(&mut self, owner: &PeerId, remote: &PeerId) {
        let forward = (owner.clone(), remote.clone());
        let backward = (remote.clone(), owner.clone());
        let ready = match (self.endpoints.get(&forward), self.endpoints.get(&backward)) {
            (Some(a), Some(b)) => !a.connected && !b.connected && a.ready() && b.ready(),
            _ => false,
        };
        if !ready {
            return;
        }

        let tracks_of = |state: &NetState, key: &(PeerId, PeerId)| -> Vec<(MediaKind, String)> {
            state
                .endpoints
                .get(key)
                .map(|e| e.senders.iter().map(|(k, id)| (*k, id.clone())).collect())
                .unwrap_or_default()
        };
        let forward_tracks = tracks_of(self, &forward);
        let backward_tracks = tracks_of(self, &backward);

        for (key, remote_tracks) in [(&forward, backward_tracks), (&backward, forward_tracks)] {
            if let Some(endpoint) = self.endpoints.get_mut(key) {
                endpoint.connected = true;
                endpoint.emit(RtcEvent::ConnectionState(RtcConnectionState::Connected));
                endpoint.emit(RtcEvent::ChannelOpen(META_CHANNEL_LABEL.to_string()));
                endpoint.emit(RtcEvent::ChannelOpen(CHAT_CHANNEL_LABEL.to_string()));
                for (kind, track_id) in remote_tracks {
                    endpoint.emit(RtcEvent::RemoteTrack { kind, track_id });
                }
            }
        }
        debug!(a = %owner.short(), b = %remote.short(), "Loopback pair connected");
    }

    /// Drop an endpoint and tell its counterpart the transport went away.
    fn remove(&mut self, key: &(PeerId, PeerId)) {
        if let Some(endpoint) = self.endpoints.remove(key) {
            if !endpoint.connected {
                return;
            }
            let counterpart = (key.1.clone(), key.0.clone());
            if let Some(other) = self.endpoints.get_mut(&counterpart) {
                if other.connected {
                    other.connected = false;
                    other.emit(RtcEvent::ConnectionState(RtcConnectionState::Disconnected));
                }
            }
        }
    }
}

/// Shared in-memory "internet". Clones refer to the same network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for the process identified by `local`.
    pub fn factory(&self, local: PeerId) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            local,
        }
    }

    /// Drop every connection owned by `peer` as if its process crashed.
    pub fn kill(&self, peer: &PeerId) {
        let mut state = self.lock();
        let owned: Vec<_> = state
            .endpoints
            .keys()
            .filter(|(owner, _)| owner == peer)
            .cloned()
            .collect();
        for key in owned {
            state.remove(&key);
        }
    }

    pub fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        self.lock()
            .endpoints
            .get(&(a.clone(), b.clone()))
            .map_or(false, |e| e.connected)
    }

    /// Track currently sent from `from` to `to` for `kind`.
    pub fn outgoing_track(&self, from: &PeerId, to: &PeerId, kind: MediaKind) -> Option<String> {
        self.lock()
            .endpoints
            .get(&(from.clone(), to.clone()))
            .and_then(|e| e.senders.get(&kind).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LoopbackFactory {
    network: LoopbackNetwork,
    local: PeerId,
}

#[async_trait]
impl RtcFactory for LoopbackFactory {
    async fn create_peer(
        &self,
        remote: &PeerId,
        role: Role,
        tracks: &TrackSet,
        events: mpsc::Sender<RtcEvent>,
    ) -> Result<Arc<dyn RtcPeer>, RtcError> {
        let key = (self.local.clone(), remote.clone());
        let mut state = self.network.lock();
        state.remove(&key);
        state.next_generation += 1;
        let generation = state.next_generation;
        state.endpoints.insert(
            key.clone(),
            Endpoint {
                generation,
                events,
                senders: tracks.iter().map(|t| (t.kind, t.id.clone())).collect(),
                local_description: false,
                remote_description: false,
                candidates_received: 0,
                connected: false,
            },
        );
        debug!(local = %self.local.short(), remote = %remote.short(), ?role, "Loopback peer created");

        Ok(Arc::new(LoopbackPeer {
            network: self.network.clone(),
            key,
            generation,
        }))
    }
}

pub struct LoopbackPeer {
    network: LoopbackNetwork,
    key: (PeerId, PeerId),
    generation: u64,
}

impl LoopbackPeer {
    fn describe_local(&self, kind: &str) -> Result<String, RtcError> {
        let mut state = self.network.lock();
        let endpoint = state.endpoint(&self.key, self.generation)?;
        endpoint.local_description = true;
        let candidate = format!(
            r#"{{"candidate":"candidate:{gen} 1 udp 2130706431 127.0.0.1 {port} typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
            gen = self.generation,
            port = 40000 + self.generation % 20000,
        );
        endpoint.emit(RtcEvent::LocalCandidate(candidate));
        endpoint.emit(RtcEvent::GatheringComplete);
        state.try_connect(&self.key.0, &self.key.1);
        Ok(format!(
            "v=0 loopback-{kind} {}->{} gen {}",
            self.key.0, self.key.1, self.generation
        ))
    }

    fn apply_remote(&self) -> Result<(), RtcError> {
        let mut state = self.network.lock();
        state.endpoint(&self.key, self.generation)?.remote_description = true;
        state.try_connect(&self.key.0, &self.key.1);
        Ok(())
    }
}

#[async_trait]
impl RtcPeer for LoopbackPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        self.describe_local("offer")
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        {
            let mut state = self.network.lock();
            if !state.endpoint(&self.key, self.generation)?.remote_description {
                return Err(RtcError::NoRemoteDescription);
            }
        }
        self.describe_local("answer")
    }

    async fn set_remote_offer(&self, _sdp: &str) -> Result<(), RtcError> {
        self.apply_remote()
    }

    async fn set_remote_answer(&self, _sdp: &str) -> Result<(), RtcError> {
        self.apply_remote()
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), RtcError> {
        if candidate.is_empty() {
            return Err(RtcError::Platform("empty candidate".to_string()));
        }
        let mut state = self.network.lock();
        let endpoint = state.endpoint(&self.key, self.generation)?;
        if !endpoint.remote_description {
            return Err(RtcError::NoRemoteDescription);
        }
        endpoint.candidates_received += 1;
        state.try_connect(&self.key.0, &self.key.1);
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), RtcError> {
        let mut state = self.network.lock();
        let endpoint = state.endpoint(&self.key, self.generation)?;
        let Some(sender) = endpoint.senders.get_mut(&track.kind) else {
            return Err(RtcError::NoSender(track.kind));
        };
        *sender = track.id.clone();
        let connected = endpoint.connected;

        if connected {
            let counterpart = (self.key.1.clone(), self.key.0.clone());
            if let Some(other) = state.endpoints.get(&counterpart) {
                other.emit(RtcEvent::RemoteTrack {
                    kind: track.kind,
                    track_id: track.id.clone(),
                });
            }
        }
        Ok(())
    }

    async fn send_text(&self, label: &str, payload: String) -> Result<(), RtcError> {
        let mut state = self.network.lock();
        if !state.endpoint(&self.key, self.generation)?.connected {
            return Err(RtcError::ChannelNotOpen(label.to_string()));
        }
        let counterpart = (self.key.1.clone(), self.key.0.clone());
        match state.endpoints.get(&counterpart) {
            Some(other) if other.connected => {
                other.emit(RtcEvent::ChannelMessage {
                    label: label.to_string(),
                    payload,
                });
                Ok(())
            }
            _ => Err(RtcError::ChannelNotOpen(label.to_string())),
        }
    }

    async fn close(&self) -> Result<(), RtcError> {
        let mut state = self.network.lock();
        if state.endpoint(&self.key, self.generation).is_ok() {
            state.remove(&self.key);
        }
        Ok(())
    }
}

#[derive(Default)]
struct DeviceState {
    deny_camera: bool,
    deny_screen: bool,
    live: Vec<LocalTrack>,
    stopped: Vec<String>,
    enabled: HashMap<MediaKind, bool>,
}

/// Fake capture devices that hand out fresh track ids.
#[derive(Default)]
pub struct LoopbackMedia {
    state: Mutex<DeviceState>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_camera(&self, deny: bool) {
        self.lock().deny_camera = deny;
    }

    pub fn deny_screen(&self, deny: bool) {
        self.lock().deny_screen = deny;
    }

    /// Ids of tracks released through [`LocalMediaSource::stop`].
    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn live(&self) -> Vec<LocalTrack> {
        self.lock().live.clone()
    }

    pub fn is_enabled(&self, kind: MediaKind) -> Option<bool> {
        self.lock().enabled.get(&kind).copied()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LocalMediaSource for LoopbackMedia {
    async fn acquire_camera(&self, device_id: Option<&str>) -> Result<TrackSet, MediaError> {
        let mut state = self.lock();
        if state.deny_camera {
            return Err(MediaError::PermissionDenied("camera".to_string()));
        }
        let tracks = TrackSet {
            audio: Some(LocalTrack::new(MediaKind::Audio, TrackSource::Microphone)),
            video: Some(LocalTrack::new(
                MediaKind::Video,
                TrackSource::Camera {
                    device_id: device_id.map(String::from),
                },
            )),
        };
        state.live.extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn acquire_screen_capture(&self) -> Result<TrackSet, MediaError> {
        let mut state = self.lock();
        if state.deny_screen {
            return Err(MediaError::PermissionDenied("screen".to_string()));
        }
        let tracks = TrackSet {
            audio: None,
            video: Some(LocalTrack::new(MediaKind::Video, TrackSource::Screen)),
        };
        state.live.extend(tracks.iter().cloned());
        Ok(tracks)
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        self.lock().enabled.insert(kind, enabled);
    }

    fn stop(&self, tracks: &TrackSet) {
        let mut state = self.lock();
        for track in tracks.iter() {
            state.live.retain(|t| t.id != track.id);
            state.stopped.push(track.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Side {
        peer: Arc<dyn RtcPeer>,
        events: mpsc::Receiver<RtcEvent>,
    }

    async fn side(net: &LoopbackNetwork, local: &str, remote: &str, role: Role, tracks: &TrackSet) -> Side {
        let (tx, events) = mpsc::channel(64);
        let peer = net
            .factory(PeerId::from(local))
            .create_peer(&PeerId::from(remote), role, tracks, tx)
            .await
            .unwrap();
        Side { peer, events }
    }

    fn drain(events: &mut mpsc::Receiver<RtcEvent>) -> Vec<RtcEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn candidate(events: &[RtcEvent]) -> String {
        events
            .iter()
            .find_map(|e| match e {
                RtcEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_pair_connects_after_full_exchange() {
        let net = LoopbackNetwork::new();
        let media = LoopbackMedia::new();
        let tracks = media.acquire_camera(None).await.unwrap();
        let mut a = side(&net, "a", "b", Role::Initiator, &tracks).await;
        let mut b = side(&net, "b", "a", Role::Responder, &TrackSet::default()).await;

        let offer = a.peer.create_offer().await.unwrap();
        b.peer.set_remote_offer(&offer).await.unwrap();
        let answer = b.peer.create_answer().await.unwrap();
        a.peer.set_remote_answer(&answer).await.unwrap();

        let a_events = drain(&mut a.events);
        let b_events = drain(&mut b.events);
        b.peer.add_ice_candidate(&candidate(&a_events)).await.unwrap();
        assert!(!net.is_connected(&PeerId::from("a"), &PeerId::from("b")));
        a.peer.add_ice_candidate(&candidate(&b_events)).await.unwrap();
        assert!(net.is_connected(&PeerId::from("a"), &PeerId::from("b")));

        let b_events = drain(&mut b.events);
        assert!(b_events.contains(&RtcEvent::ConnectionState(RtcConnectionState::Connected)));
        assert!(b_events
            .iter()
            .any(|e| matches!(e, RtcEvent::RemoteTrack { kind: MediaKind::Video, .. })));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_fails() {
        let net = LoopbackNetwork::new();
        let b = side(&net, "b", "a", Role::Responder, &TrackSet::default()).await;
        let result = b.peer.add_ice_candidate("{}").await;
        assert!(matches!(result, Err(RtcError::NoRemoteDescription)));
    }

    #[tokio::test]
    async fn test_replace_without_sender() {
        let net = LoopbackNetwork::new();
        let a = side(&net, "a", "b", Role::Initiator, &TrackSet::default()).await;
        let track = LocalTrack::new(MediaKind::Video, TrackSource::Screen);
        let result = a.peer.replace_track(&track).await;
        assert!(matches!(result, Err(RtcError::NoSender(MediaKind::Video))));
    }

    #[tokio::test]
    async fn test_media_denial_and_stop() {
        let media = LoopbackMedia::new();
        media.deny_screen(true);
        assert!(matches!(
            media.acquire_screen_capture().await,
            Err(MediaError::PermissionDenied(_))
        ));

        let tracks = media.acquire_camera(Some("cam-2")).await.unwrap();
        assert_eq!(media.live().len(), 2);
        media.stop(&tracks);
        assert!(media.live().is_empty());
        assert_eq!(media.stopped().len(), 2);
    }
}
