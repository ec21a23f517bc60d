//! Negotiation state machine for one remote peer.
//!
//! ```text
//! New ──▶ Negotiating ──▶ IceGathering ──▶ Connected ──▶ Closed
//!  └──────────┴───────────────┴───────────────┴──▶ Failed ──▶ Closed
//! ```
//!
//! Every input goes through [`PeerLink::dispatch`]. The link owns its
//! [`RtcPeer`] exclusively and reports upward through a [`LinkNotice`]
//! channel tagged with the link's generation id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use huddle_net::TransportError;
use huddle_shared::constants::{CHAT_CHANNEL_LABEL, META_CHANNEL_LABEL};
use huddle_shared::error::ProtocolError;
use huddle_shared::protocol::{ChatMessage, PresentationSnapshot, SignalType};
use huddle_shared::types::{MediaKind, PeerId};

use crate::config::IceMode;
use crate::metadata::RemotePresentation;
use crate::rtc::{RtcConnectionState, RtcError, RtcEvent, RtcPeer, Role};
use crate::signaling::SignalSink;
use crate::tracks::{LocalTrack, TrackSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Negotiating,
    IceGathering,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, Failed) | (_, Closed) => true,
            (New, Negotiating) => true,
            (Negotiating, IceGathering) => true,
            (Negotiating, Connected) | (IceGathering, Connected) => true,
            _ => false,
        }
    }
}

/// Why a link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local side (leave, replacement)
    Local,
    /// Remote sent `hangup` or left the session
    RemoteHangup,
    /// Remote sent its farewell snapshot
    RemoteLeft,
    /// Not connected before the liveness deadline
    NegotiationTimeout,
    /// Transport went away after (or while) connecting
    TransportLost(RtcConnectionState),
    Rtc(String),
    Signaling(String),
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            CloseReason::Local | CloseReason::RemoteHangup | CloseReason::RemoteLeft
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::RemoteHangup => write!(f, "remote hung up"),
            CloseReason::RemoteLeft => write!(f, "remote left"),
            CloseReason::NegotiationTimeout => write!(f, "negotiation timed out"),
            CloseReason::TransportLost(state) => write!(f, "transport {state:?}"),
            CloseReason::Rtc(e) => write!(f, "rtc: {e}"),
            CloseReason::Signaling(e) => write!(f, "signaling: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Initiator only: open channels, send the offer
    Start,
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidates(Vec<String>),
    RemoteHangup,
    Rtc(RtcEvent),
    LocalSnapshot(PresentationSnapshot),
    SendChat(ChatMessage),
    ReplaceTrack(LocalTrack),
    LivenessExpired,
    /// Orderly close: farewell snapshot if connected, then `hangup`
    Close { farewell: Option<PresentationSnapshot> },
    /// Silent close of a superseded link
    Abandon,
}

impl LinkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LinkEvent::Start => "start",
            LinkEvent::RemoteOffer(_) => "offer",
            LinkEvent::RemoteAnswer(_) => "answer",
            LinkEvent::RemoteCandidates(_) => "candidates",
            LinkEvent::RemoteHangup => "hangup",
            LinkEvent::Rtc(_) => "rtc",
            LinkEvent::LocalSnapshot(_) => "local_snapshot",
            LinkEvent::SendChat(_) => "send_chat",
            LinkEvent::ReplaceTrack(_) => "replace_track",
            LinkEvent::LivenessExpired => "liveness_expired",
            LinkEvent::Close { .. } => "close",
            LinkEvent::Abandon => "abandon",
        }
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Illegal {event} in state {state:?}")]
    IllegalTransition {
        state: LinkState,
        event: &'static str,
    },

    #[error("Peer link closed")]
    Closed,

    #[error("No outgoing {0} sender")]
    NoSender(MediaKind),

    #[error("Data channel not open: {0}")]
    ChannelNotOpen(&'static str),

    #[error("RTC error: {0}")]
    Rtc(#[from] RtcError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Upward reports of one link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkReport {
    State(LinkState),
    Presentation(PresentationSnapshot),
    Chat(ChatMessage),
    RemoteTrack { kind: MediaKind, track_id: String },
    TrackReplacementFailed(MediaKind),
    Terminated(CloseReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkNotice {
    pub peer: PeerId,
    pub link_id: u64,
    pub report: LinkReport,
}

pub struct PeerLink {
    peer: PeerId,
    link_id: u64,
    role: Role,
    state: LinkState,
    rtc: Arc<dyn RtcPeer>,
    signals: SignalSink,
    notices: mpsc::Sender<LinkNotice>,
    ice_mode: IceMode,
    liveness_timeout: Duration,
    liveness_deadline: Option<Instant>,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
    gathered: Vec<String>,
    outgoing: HashMap<MediaKind, String>,
    local_snapshot: PresentationSnapshot,
    sent_seq: Option<u64>,
    meta_open: bool,
    chat_open: bool,
    /// Chat sent after `Connected` but before the channel opened
    pending_chat: Vec<ChatMessage>,
    remote: RemotePresentation,
}

pub struct PeerLinkParams {
    pub peer: PeerId,
    pub link_id: u64,
    pub role: Role,
    pub rtc: Arc<dyn RtcPeer>,
    pub signals: SignalSink,
    pub notices: mpsc::Sender<LinkNotice>,
    pub ice_mode: IceMode,
    pub liveness_timeout: Duration,
    pub tracks: TrackSet,
    pub snapshot: PresentationSnapshot,
}

impl PeerLink {
    pub fn new(params: PeerLinkParams) -> Self {
        Self {
            peer: params.peer,
            link_id: params.link_id,
            role: params.role,
            state: LinkState::New,
            rtc: params.rtc,
            signals: params.signals,
            notices: params.notices,
            ice_mode: params.ice_mode,
            liveness_timeout: params.liveness_timeout,
            liveness_deadline: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            gathered: Vec::new(),
            outgoing: params
                .tracks
                .iter()
                .map(|t| (t.kind, t.id.clone()))
                .collect(),
            local_snapshot: params.snapshot,
            sent_seq: None,
            meta_open: false,
            chat_open: false,
            pending_chat: Vec::new(),
            remote: RemotePresentation::default(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn liveness_deadline(&self) -> Option<Instant> {
        self.liveness_deadline
    }

    pub fn remote_presentation(&self) -> Option<&PresentationSnapshot> {
        self.remote.current()
    }

    pub fn outgoing_track(&self, kind: MediaKind) -> Option<&str> {
        self.outgoing.get(&kind).map(String::as_str)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub async fn dispatch(&mut self, event: LinkEvent) -> Result<(), LinkError> {
        if self.state == LinkState::Closed {
            return Err(LinkError::Closed);
        }

        match event {
            LinkEvent::Start => {
                self.require(
                    self.role == Role::Initiator && self.state == LinkState::New,
                    "start",
                )?;
                self.transition(LinkState::Negotiating).await?;
                let offer = self.rtc.create_offer().await?;
                self.signals.send(SignalType::Offer(offer)).await?;
                self.arm_liveness();
            }
            LinkEvent::RemoteOffer(sdp) => {
                self.require(
                    self.role == Role::Responder && self.state == LinkState::New,
                    "offer",
                )?;
                self.transition(LinkState::Negotiating).await?;
                self.rtc.set_remote_offer(&sdp).await?;
                self.remote_description_set = true;
                self.replay_candidates().await;
                let answer = self.rtc.create_answer().await?;
                self.signals.send(SignalType::Answer(answer)).await?;
                self.arm_liveness();
                self.transition(LinkState::IceGathering).await?;
            }
            LinkEvent::RemoteAnswer(sdp) => {
                self.require(
                    self.role == Role::Initiator
                        && self.state == LinkState::Negotiating
                        && !self.remote_description_set,
                    "answer",
                )?;
                self.rtc.set_remote_answer(&sdp).await?;
                self.remote_description_set = true;
                self.replay_candidates().await;
                self.transition(LinkState::IceGathering).await?;
            }
            LinkEvent::RemoteCandidates(candidates) => {
                if self.remote_description_set {
                    for candidate in candidates {
                        self.add_candidate(&candidate).await;
                    }
                } else {
                    debug!(
                        peer = %self.peer.short(),
                        count = candidates.len(),
                        "Buffering candidates until the remote description is set"
                    );
                    self.pending_candidates.extend(candidates);
                }
            }
            LinkEvent::RemoteHangup => {
                info!(peer = %self.peer.short(), "Remote hung up");
                self.close(CloseReason::RemoteHangup).await;
            }
            LinkEvent::Rtc(event) => self.on_rtc(event).await?,
            LinkEvent::LocalSnapshot(snapshot) => {
                self.local_snapshot = snapshot;
                self.flush_snapshot().await?;
            }
            LinkEvent::SendChat(message) => {
                if self.state != LinkState::Connected {
                    return Err(LinkError::ChannelNotOpen(CHAT_CHANNEL_LABEL));
                }
                if self.chat_open {
                    self.send_chat(&message).await?;
                } else {
                    self.pending_chat.push(message);
                }
            }
            LinkEvent::ReplaceTrack(track) => self.replace_track(track).await?,
            LinkEvent::LivenessExpired => {
                if self.state != LinkState::Connected {
                    warn!(
                        peer = %self.peer.short(),
                        state = ?self.state,
                        "Link not connected before the liveness deadline"
                    );
                    self.fail(CloseReason::NegotiationTimeout).await;
                }
            }
            LinkEvent::Close { farewell } => {
                if let Some(farewell) = farewell {
                    if self.state == LinkState::Connected && self.meta_open {
                        if let Err(e) = self.send_snapshot(&farewell).await {
                            debug!(peer = %self.peer.short(), error = %e, "Farewell not sent");
                        }
                    }
                }
                if self.state != LinkState::New {
                    if let Err(e) = self.signals.send(SignalType::Hangup).await {
                        debug!(peer = %self.peer.short(), error = %e, "Hangup not sent");
                    }
                }
                self.close(CloseReason::Local).await;
            }
            LinkEvent::Abandon => self.close(CloseReason::Local).await,
        }
        Ok(())
    }

    /// Move to `Failed` and tear down.
    pub async fn fail(&mut self, reason: CloseReason) {
        if self.state.is_terminal() {
            return;
        }
        warn!(peer = %self.peer.short(), reason = %reason, "Peer link failed");
        let _ = self.transition(LinkState::Failed).await;
        self.close(reason).await;
    }

    pub async fn report(&self, report: LinkReport) {
        let notice = LinkNotice {
            peer: self.peer.clone(),
            link_id: self.link_id,
            report,
        };
        if self.notices.send(notice).await.is_err() {
            debug!(peer = %self.peer.short(), "Link notice dropped, manager gone");
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.state == LinkState::Closed {
            return;
        }
        self.liveness_deadline = None;
        if let Err(e) = self.rtc.close().await {
            debug!(peer = %self.peer.short(), error = %e, "Error closing peer connection");
        }
        let _ = self.transition(LinkState::Closed).await;
        debug!(peer = %self.peer.short(), reason = %reason, "Peer link closed");
        self.report(LinkReport::Terminated(reason)).await;
    }

    async fn on_rtc(&mut self, event: RtcEvent) -> Result<(), LinkError> {
        match event {
            RtcEvent::LocalCandidate(candidate) => match self.ice_mode {
                IceMode::Trickle => self.signals.send(SignalType::IceCandidate(candidate)).await?,
                IceMode::Batch => self.gathered.push(candidate),
            },
            RtcEvent::GatheringComplete => {
                if self.ice_mode == IceMode::Batch && !self.gathered.is_empty() {
                    let batch = std::mem::take(&mut self.gathered);
                    self.signals.send(SignalType::IceBatch(batch)).await?;
                }
            }
            RtcEvent::ConnectionState(RtcConnectionState::Connected) => {
                if self.state != LinkState::Connected {
                    self.transition(LinkState::Connected).await?;
                    self.liveness_deadline = None;
                    info!(peer = %self.peer.short(), "Peer link connected");
                    self.flush_snapshot().await?;
                }
            }
            RtcEvent::ConnectionState(state) if state.is_lost() => {
                self.fail(CloseReason::TransportLost(state)).await;
            }
            RtcEvent::ConnectionState(state) => {
                debug!(peer = %self.peer.short(), ?state, "Transport state");
            }
            RtcEvent::ChannelOpen(label) => match label.as_str() {
                META_CHANNEL_LABEL => {
                    self.meta_open = true;
                    self.flush_snapshot().await?;
                }
                CHAT_CHANNEL_LABEL => {
                    self.chat_open = true;
                    for message in std::mem::take(&mut self.pending_chat) {
                        self.send_chat(&message).await?;
                    }
                }
                other => debug!(label = %other, "Ignoring unknown data channel"),
            },
            RtcEvent::ChannelMessage { label, payload } => match label.as_str() {
                META_CHANNEL_LABEL => {
                    let applied = match self.remote.receive(&payload) {
                        Ok(applied) => applied.cloned(),
                        Err(e) => {
                            warn!(peer = %self.peer.short(), error = %e, "Bad presentation snapshot");
                            None
                        }
                    };
                    if let Some(snapshot) = applied {
                        let leaving = !snapshot.connected;
                        self.report(LinkReport::Presentation(snapshot)).await;
                        if leaving {
                            info!(peer = %self.peer.short(), "Remote sent farewell");
                            self.close(CloseReason::RemoteLeft).await;
                        }
                    }
                }
                CHAT_CHANNEL_LABEL => match ChatMessage::from_json(&payload) {
                    Ok(mut message) => {
                        message.sender = Some(self.peer.clone());
                        self.report(LinkReport::Chat(message)).await;
                    }
                    Err(e) => warn!(peer = %self.peer.short(), error = %e, "Bad chat message"),
                },
                other => debug!(label = %other, "Message on unknown data channel"),
            },
            RtcEvent::RemoteTrack { kind, track_id } => {
                debug!(peer = %self.peer.short(), %kind, track = %track_id, "Remote track");
                self.report(LinkReport::RemoteTrack { kind, track_id }).await;
            }
        }
        Ok(())
    }

    async fn replace_track(&mut self, track: LocalTrack) -> Result<(), LinkError> {
        match self.outgoing.get(&track.kind) {
            Some(current) if *current == track.id => return Ok(()),
            Some(_) => {}
            None => return Err(LinkError::NoSender(track.kind)),
        }
        match self.rtc.replace_track(&track).await {
            Ok(()) => {
                debug!(peer = %self.peer.short(), kind = %track.kind, track = %track.id, "Replaced outgoing track");
                self.outgoing.insert(track.kind, track.id);
                Ok(())
            }
            Err(RtcError::NoSender(kind)) => Err(LinkError::NoSender(kind)),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush_snapshot(&mut self) -> Result<(), LinkError> {
        if self.state != LinkState::Connected || !self.meta_open {
            return Ok(());
        }
        if self.sent_seq == Some(self.local_snapshot.seq) {
            return Ok(());
        }
        let snapshot = self.local_snapshot.clone();
        self.send_snapshot(&snapshot).await?;
        self.sent_seq = Some(snapshot.seq);
        Ok(())
    }

    async fn send_snapshot(&self, snapshot: &PresentationSnapshot) -> Result<(), LinkError> {
        self.rtc
            .send_text(META_CHANNEL_LABEL, snapshot.to_json()?)
            .await?;
        Ok(())
    }

    async fn send_chat(&self, message: &ChatMessage) -> Result<(), LinkError> {
        self.rtc
            .send_text(CHAT_CHANNEL_LABEL, message.to_json()?)
            .await?;
        Ok(())
    }

    async fn replay_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(peer = %self.peer.short(), count = pending.len(), "Replaying buffered candidates");
        }
        for candidate in pending {
            self.add_candidate(&candidate).await;
        }
    }

    /// A bad candidate is not fatal; others may still work.
    async fn add_candidate(&self, candidate: &str) {
        if let Err(e) = self.rtc.add_ice_candidate(candidate).await {
            warn!(peer = %self.peer.short(), error = %e, "Rejected remote candidate");
        }
    }

    fn arm_liveness(&mut self) {
        self.liveness_deadline = Some(Instant::now() + self.liveness_timeout);
    }

    fn require(&self, ok: bool, event: &'static str) -> Result<(), LinkError> {
        if ok {
            Ok(())
        } else {
            Err(LinkError::IllegalTransition {
                state: self.state,
                event,
            })
        }
    }

    async fn transition(&mut self, next: LinkState) -> Result<(), LinkError> {
        if !self.state.can_transition_to(next) {
            return Err(LinkError::IllegalTransition {
                state: self.state,
                event: "transition",
            });
        }
        debug!(peer = %self.peer.short(), from = ?self.state, to = ?next, "Link state");
        self.state = next;
        self.report(LinkReport::State(next)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackMedia, LoopbackNetwork};
    use crate::rtc::RtcFactory;
    use crate::tracks::{LocalMediaSource, TrackSource};
    use huddle_net::{LocalHub, SignalingTransport};
    use huddle_shared::protocol::WireMessage;
    use huddle_shared::types::SessionId;

    struct Harness {
        link: PeerLink,
        rtc_rx: mpsc::Receiver<RtcEvent>,
        notices: mpsc::Receiver<LinkNotice>,
        signals: mpsc::Receiver<WireMessage>,
    }

    async fn harness(
        net: &LoopbackNetwork,
        hub: &LocalHub,
        local: &str,
        remote: &str,
        role: Role,
        tracks: TrackSet,
        ice_mode: IceMode,
    ) -> Harness {
        let session = SessionId::from("room-1");
        let transport = Arc::new(hub.transport(PeerId::from(local)));
        let signals = transport.join(&session).await.unwrap();
        let (rtc_tx, rtc_rx) = mpsc::channel(64);
        let (notice_tx, notices) = mpsc::channel(64);
        let rtc = net
            .factory(PeerId::from(local))
            .create_peer(&PeerId::from(remote), role, &tracks, rtc_tx)
            .await
            .unwrap();
        let link = PeerLink::new(PeerLinkParams {
            peer: PeerId::from(remote),
            link_id: 1,
            role,
            rtc,
            signals: SignalSink::new(transport, session, PeerId::from(remote)),
            notices: notice_tx,
            ice_mode,
            liveness_timeout: Duration::from_secs(2),
            tracks,
            snapshot: PresentationSnapshot::new(local),
        });
        Harness {
            link,
            rtc_rx,
            notices,
            signals,
        }
    }

    /// Feed the signals addressed to `to_id` into its link. Echoes of its own
    /// traffic are filtered by `is_for`.
    async fn deliver_signals(to: &mut Harness, to_id: &str) {
        while let Ok(message) = to.signals.try_recv() {
            if !message.is_for(&PeerId::from(to_id)) {
                continue;
            }
            if let WireMessage::Signal(signal) = message {
                let event = match signal.signal {
                    SignalType::Offer(sdp) => LinkEvent::RemoteOffer(sdp),
                    SignalType::Answer(sdp) => LinkEvent::RemoteAnswer(sdp),
                    SignalType::IceCandidate(c) => LinkEvent::RemoteCandidates(vec![c]),
                    SignalType::IceBatch(cs) => LinkEvent::RemoteCandidates(cs),
                    SignalType::Hangup => LinkEvent::RemoteHangup,
                };
                to.link.dispatch(event).await.unwrap();
            }
        }
    }

    async fn pump_rtc(h: &mut Harness) {
        while let Ok(event) = h.rtc_rx.try_recv() {
            if let Err(e) = h.link.dispatch(LinkEvent::Rtc(event)).await {
                assert!(matches!(e, LinkError::Closed), "unexpected error {e}");
            }
        }
    }

    fn drain_notices(h: &mut Harness) -> Vec<LinkReport> {
        let mut out = Vec::new();
        while let Ok(notice) = h.notices.try_recv() {
            out.push(notice.report);
        }
        out
    }

    async fn connect_pair(ice_mode: IceMode) -> (Harness, Harness) {
        let net = LoopbackNetwork::new();
        let hub = LocalHub::new();
        let media = LoopbackMedia::new();
        let a_tracks = media.acquire_camera(None).await.unwrap();
        let b_tracks = media.acquire_camera(None).await.unwrap();
        let mut a = harness(&net, &hub, "a", "b", Role::Initiator, a_tracks, ice_mode).await;
        let mut b = harness(&net, &hub, "b", "a", Role::Responder, b_tracks, ice_mode).await;

        a.link.dispatch(LinkEvent::Start).await.unwrap();
        for _ in 0..4 {
            pump_rtc(&mut a).await;
            deliver_signals(&mut b, "b").await;
            pump_rtc(&mut b).await;
            deliver_signals(&mut a, "a").await;
        }
        (a, b)
    }

    #[test]
    fn test_transition_table() {
        use LinkState::*;
        assert!(New.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(IceGathering));
        assert!(IceGathering.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Closed));
        assert!(!Connected.can_transition_to(Negotiating));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!New.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_trickle_negotiation_connects() {
        let (mut a, mut b) = connect_pair(IceMode::Trickle).await;
        assert_eq!(a.link.state(), LinkState::Connected);
        assert_eq!(b.link.state(), LinkState::Connected);
        assert!(a.link.liveness_deadline().is_none());

        let reports = drain_notices(&mut b);
        assert!(reports.contains(&LinkReport::State(LinkState::Connected)));
        assert!(reports
            .iter()
            .any(|r| matches!(r, LinkReport::Presentation(s) if s.name == "a")));
        assert!(reports
            .iter()
            .any(|r| matches!(r, LinkReport::RemoteTrack { kind: MediaKind::Video, .. })));
        let _ = drain_notices(&mut a);
    }

    #[tokio::test]
    async fn test_batch_negotiation_connects() {
        let (a, b) = connect_pair(IceMode::Batch).await;
        assert_eq!(a.link.state(), LinkState::Connected);
        assert_eq!(b.link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_candidates_buffered_before_remote_description() {
        let net = LoopbackNetwork::new();
        let hub = LocalHub::new();
        let mut b = harness(&net, &hub, "b", "a", Role::Responder, TrackSet::default(), IceMode::Trickle).await;

        b.link
            .dispatch(LinkEvent::RemoteCandidates(vec!["c1".to_string(), "c2".to_string()]))
            .await
            .unwrap();
        assert_eq!(b.link.pending_candidates(), 2);

        b.link
            .dispatch(LinkEvent::RemoteOffer("sdp".to_string()))
            .await
            .unwrap();
        assert_eq!(b.link.pending_candidates(), 0);
        assert_eq!(b.link.state(), LinkState::IceGathering);
        assert!(b.link.liveness_deadline().is_some());
    }

    #[tokio::test]
    async fn test_illegal_events_leave_state_unchanged() {
        let (mut a, mut b) = connect_pair(IceMode::Trickle).await;

        let err = a
            .link
            .dispatch(LinkEvent::RemoteAnswer("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::IllegalTransition { state: LinkState::Connected, .. }));
        assert_eq!(a.link.state(), LinkState::Connected);

        let err = b
            .link
            .dispatch(LinkEvent::RemoteOffer("again".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::IllegalTransition { .. }));
        assert_eq!(b.link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_offer_to_initiator_is_illegal() {
        let net = LoopbackNetwork::new();
        let hub = LocalHub::new();
        let mut a = harness(&net, &hub, "a", "b", Role::Initiator, TrackSet::default(), IceMode::Trickle).await;
        let err = a
            .link
            .dispatch(LinkEvent::RemoteOffer("sdp".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::IllegalTransition { state: LinkState::New, event: "offer" }));
    }

    #[tokio::test]
    async fn test_closed_rejects_everything() {
        let (mut a, _b) = connect_pair(IceMode::Trickle).await;
        a.link
            .dispatch(LinkEvent::Close { farewell: None })
            .await
            .unwrap();
        assert_eq!(a.link.state(), LinkState::Closed);
        assert!(matches!(
            a.link.dispatch(LinkEvent::Start).await,
            Err(LinkError::Closed)
        ));
        assert!(matches!(
            a.link.dispatch(LinkEvent::LivenessExpired).await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_liveness_expiry_fails_link() {
        let net = LoopbackNetwork::new();
        let hub = LocalHub::new();
        let mut a = harness(&net, &hub, "a", "ghost", Role::Initiator, TrackSet::default(), IceMode::Trickle).await;
        a.link.dispatch(LinkEvent::Start).await.unwrap();
        assert!(a.link.liveness_deadline().is_some());

        a.link.dispatch(LinkEvent::LivenessExpired).await.unwrap();
        assert_eq!(a.link.state(), LinkState::Closed);
        let reports = drain_notices(&mut a);
        assert!(reports.contains(&LinkReport::State(LinkState::Failed)));
        assert_eq!(
            reports.last(),
            Some(&LinkReport::Terminated(CloseReason::NegotiationTimeout))
        );
    }

    #[tokio::test]
    async fn test_replace_track_is_idempotent() {
        let (mut a, mut b) = connect_pair(IceMode::Trickle).await;
        let _ = drain_notices(&mut b);
        let screen = LocalTrack::new(MediaKind::Video, TrackSource::Screen);

        a.link
            .dispatch(LinkEvent::ReplaceTrack(screen.clone()))
            .await
            .unwrap();
        a.link
            .dispatch(LinkEvent::ReplaceTrack(screen.clone()))
            .await
            .unwrap();
        assert_eq!(a.link.outgoing_track(MediaKind::Video), Some(screen.id.as_str()));
        assert_eq!(a.link.state(), LinkState::Connected);

        pump_rtc(&mut b).await;
        let remote_tracks: Vec<_> = drain_notices(&mut b)
            .into_iter()
            .filter(|r| matches!(r, LinkReport::RemoteTrack { .. }))
            .collect();
        assert_eq!(
            remote_tracks,
            vec![LinkReport::RemoteTrack {
                kind: MediaKind::Video,
                track_id: screen.id.clone()
            }]
        );
    }

    #[tokio::test]
    async fn test_replace_without_sender_fails() {
        let net = LoopbackNetwork::new();
        let hub = LocalHub::new();
        let mut a = harness(&net, &hub, "a", "b", Role::Initiator, TrackSet::default(), IceMode::Trickle).await;
        let track = LocalTrack::new(MediaKind::Audio, TrackSource::Microphone);
        assert!(matches!(
            a.link.dispatch(LinkEvent::ReplaceTrack(track)).await,
            Err(LinkError::NoSender(MediaKind::Audio))
        ));
    }

    #[tokio::test]
    async fn test_farewell_closes_remote_link() {
        let (mut a, mut b) = connect_pair(IceMode::Trickle).await;
        let _ = drain_notices(&mut b);

        let mut farewell = PresentationSnapshot::new("a");
        farewell.connected = false;
        farewell.seq = 99;
        a.link
            .dispatch(LinkEvent::Close {
                farewell: Some(farewell),
            })
            .await
            .unwrap();

        pump_rtc(&mut b).await;
        assert_eq!(b.link.state(), LinkState::Closed);
        let reports = drain_notices(&mut b);
        assert_eq!(
            reports.last(),
            Some(&LinkReport::Terminated(CloseReason::RemoteLeft))
        );
    }

    #[tokio::test]
    async fn test_chat_requires_open_channel() {
        let net = LoopbackNetwork::new();
        let hub = LocalHub::new();
        let mut a = harness(&net, &hub, "a", "b", Role::Initiator, TrackSet::default(), IceMode::Trickle).await;
        let message = ChatMessage::new(PeerId::from("a"), "a", "hi");
        assert!(matches!(
            a.link.dispatch(LinkEvent::SendChat(message)).await,
            Err(LinkError::ChannelNotOpen(_))
        ));
    }
}
