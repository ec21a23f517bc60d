//! webrtc-rs realization of the RTC seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use huddle_shared::constants::{CHAT_CHANNEL_LABEL, META_CHANNEL_LABEL};
use huddle_shared::types::{MediaKind, PeerId};

use crate::config::SessionConfig;
use crate::rtc::{RtcConnectionState, RtcError, RtcEvent, RtcFactory, RtcPeer, Role};
use crate::tracks::{LocalTrack, TrackSet};

const STREAM_ID: &str = "huddle";

fn platform(e: webrtc::Error) -> RtcError {
    RtcError::Platform(e.to_string())
}

/// Sample writers keyed by local track id, shared by every connection so a
/// capture pipeline feeds one writer per track. Only the newest track of each
/// kind is kept; senders still holding an older writer keep it alive until
/// they are replaced.
#[derive(Clone, Default)]
struct SampleTracks {
    tracks: Arc<StdMutex<HashMap<String, (MediaKind, Arc<TrackLocalStaticSample>)>>>,
}

impl SampleTracks {
    fn current(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock().unwrap_or_else(|e| e.into_inner());
        tracks.retain(|id, (kind, _)| *kind != track.kind || *id == track.id);
        let (_, sample) = tracks.entry(track.id.clone()).or_insert_with(|| {
            let mime_type = match track.kind {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            let sample = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                STREAM_ID.to_owned(),
            ));
            (track.kind, sample)
        });
        sample.clone()
    }
}

pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
    ice_candidate_pool_size: u8,
    samples: SampleTracks,
}

impl WebRtcFactory {
    pub fn new(config: &SessionConfig) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(platform)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(platform)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            samples: SampleTracks::default(),
        })
    }

    /// Writer for the encoded samples of `track`. Capture pipelines push
    /// frames here; every connection sending the track reads from it.
    pub fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.samples.current(track)
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[async_trait]
impl RtcFactory for WebRtcFactory {
    async fn create_peer(
        &self,
        remote: &PeerId,
        role: Role,
        tracks: &TrackSet,
        events: mpsc::Sender<RtcEvent>,
    ) -> Result<Arc<dyn RtcPeer>, RtcError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(platform)?,
        );

        let mut senders = HashMap::new();
        for track in tracks.iter() {
            let local = self.samples.current(track);
            let sender = pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(platform)?;
            drain_rtcp(sender.clone());
            senders.insert(track.kind, sender);
        }

        let channels: Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>> = Arc::default();
        register_handlers(&pc, remote, events.clone(), channels.clone());

        if role == Role::Initiator {
            for label in [META_CHANNEL_LABEL, CHAT_CHANNEL_LABEL] {
                let dc = pc
                    .create_data_channel(label, None)
                    .await
                    .map_err(platform)?;
                wire_data_channel(&dc, events.clone());
                channels.lock().await.insert(label.to_string(), dc);
            }
        }

        info!(remote = %remote.short(), ?role, senders = senders.len(), "Peer connection created");
        Ok(Arc::new(WebRtcPeer {
            remote: remote.clone(),
            pc,
            senders: Mutex::new(senders),
            channels,
            samples: self.samples.clone(),
        }))
    }
}

/// Senders must be read for interceptors (NACK, reports) to run.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

fn register_handlers(
    pc: &RTCPeerConnection,
    remote: &PeerId,
    events: mpsc::Sender<RtcEvent>,
    channels: Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let json = candidate
                .to_json()
                .map_err(|e| e.to_string())
                .and_then(|init| serde_json::to_string(&init).map_err(|e| e.to_string()));
            match json {
                Ok(json) => {
                    let _ = tx.send(RtcEvent::LocalCandidate(json)).await;
                }
                Err(e) => warn!(error = %e, "Could not encode local candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let tx = tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                let _ = tx.send(RtcEvent::GatheringComplete).await;
            }
        })
    }));

    let tx = events.clone();
    let peer = remote.short();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let peer = peer.clone();
        Box::pin(async move {
            debug!(peer = %peer, state = %state, "Peer connection state changed");
            let mapped = match state {
                RTCPeerConnectionState::Connecting => RtcConnectionState::Connecting,
                RTCPeerConnectionState::Connected => RtcConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => RtcConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => RtcConnectionState::Failed,
                RTCPeerConnectionState::Closed => RtcConnectionState::Closed,
                _ => RtcConnectionState::New,
            };
            let _ = tx.send(RtcEvent::ConnectionState(mapped)).await;
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        let channels = channels.clone();
        Box::pin(async move {
            wire_data_channel(&dc, tx);
            channels.lock().await.insert(dc.label().to_string(), dc);
        })
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                RTPCodecType::Video => MediaKind::Video,
                _ => return,
            };
            let track_id = track.id().to_string();
            let _ = tx.send(RtcEvent::RemoteTrack { kind, track_id }).await;
        })
    }));
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, events: mpsc::Sender<RtcEvent>) {
    let label = dc.label().to_string();

    let tx = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        let label = open_label.clone();
        Box::pin(async move {
            debug!(label = %label, "Data channel open");
            let _ = tx.send(RtcEvent::ChannelOpen(label)).await;
        })
    }));

    let tx = events;
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(payload) => {
                    let _ = tx.send(RtcEvent::ChannelMessage { label, payload }).await;
                }
                Err(_) => warn!(label = %label, "Dropping non-text data channel message"),
            }
        })
    }));
}

pub struct WebRtcPeer {
    remote: PeerId,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
    channels: Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>,
    samples: SampleTracks,
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(platform)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(platform)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        if self.pc.remote_description().await.is_none() {
            return Err(RtcError::NoRemoteDescription);
        }
        let answer = self.pc.create_answer(None).await.map_err(platform)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(platform)?;
        Ok(answer.sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), RtcError> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(platform)?;
        self.pc.set_remote_description(offer).await.map_err(platform)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), RtcError> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(platform)?;
        self.pc.set_remote_description(answer).await.map_err(platform)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), RtcError> {
        if self.pc.remote_description().await.is_none() {
            return Err(RtcError::NoRemoteDescription);
        }
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| RtcError::Platform(format!("bad candidate: {e}")))?;
        self.pc.add_ice_candidate(init).await.map_err(platform)
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), RtcError> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&track.kind)
            .cloned()
            .ok_or(RtcError::NoSender(track.kind))?;
        let local = self.samples.current(track);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(platform)?;
        debug!(remote = %self.remote.short(), kind = %track.kind, "Outgoing track replaced");
        Ok(())
    }

    async fn send_text(&self, label: &str, payload: String) -> Result<(), RtcError> {
        let dc = self
            .channels
            .lock()
            .await
            .get(label)
            .cloned()
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .ok_or_else(|| RtcError::ChannelNotOpen(label.to_string()))?;
        dc.send_text(payload).await.map_err(platform)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(platform)
    }
}
