//! Session orchestration.
//!
//! A [`ConnectionManager`] is started once and then driven through its
//! [`SessionHandle`]. One event loop owns the `PeerId -> link` table and
//! consumes four inputs: handle commands, signaling messages, link reports
//! and media acquisition results. It emits [`SessionEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use huddle_net::{MembershipEvents, SignalingTransport, TransportError};
use huddle_shared::protocol::{ChatMessage, PresentationSnapshot, SignalMessage, SignalType, WireMessage};
use huddle_shared::types::{MediaKind, PeerId, SessionId};

use crate::chat::ChatTranscript;
use crate::config::{SessionConfig, Topology};
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::focus::{FocusState, FocusTarget};
use crate::link_task::{spawn_link, LinkSpawn};
use crate::metadata::LocalPresentation;
use crate::peer_link::{CloseReason, LinkEvent, LinkNotice, LinkReport, LinkState};
use crate::rtc::{RtcFactory, Role};
use crate::signaling::SignalSink;
use crate::tracks::{LocalMediaSource, MediaError, TrackSet, VideoSource};

const COMMAND_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 256;
const NOTICE_QUEUE_DEPTH: usize = 256;
const LINK_INBOX_DEPTH: usize = 64;

/// Commands sent *into* the session loop.
enum SessionCommand {
    Join {
        session: SessionId,
        display_name: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    SetMirrored(bool),
    SetDisplayName(String),
    SetVideoSource(VideoSource),
    ScreenCaptureEnded,
    SendChat {
        body: String,
        reply: oneshot::Sender<Result<ChatMessage, SessionError>>,
    },
    SetFocus(Option<FocusTarget>),
    Leave(oneshot::Sender<()>),
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Transcript(oneshot::Sender<Vec<ChatMessage>>),
    Focus(oneshot::Sender<Option<FocusTarget>>),
    Stop(oneshot::Sender<()>),
}

struct MediaAcquired {
    generation: u64,
    source: VideoSource,
    result: Result<TrackSet, MediaError>,
}

/// One row of [`SessionHandle::peers`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub peer: PeerId,
    pub role: Role,
    pub state: LinkState,
    pub presentation: Option<PresentationSnapshot>,
}

struct LinkEntry {
    link_id: u64,
    role: Role,
    state: LinkState,
    inbox: mpsc::Sender<LinkEvent>,
    task: JoinHandle<()>,
    /// `PeerConnected` was emitted
    announced: bool,
    presentation: Option<PresentationSnapshot>,
}

pub struct ConnectionManager {
    config: Arc<SessionConfig>,
    transport: Arc<dyn SignalingTransport>,
    rtc: Arc<dyn RtcFactory>,
    media: Arc<dyn LocalMediaSource>,
}

impl ConnectionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        rtc: Arc<dyn RtcFactory>,
        media: Arc<dyn LocalMediaSource>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            rtc,
            media,
        }
    }

    /// Spawn the session loop. Must be called inside a tokio runtime.
    pub fn start(self) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let local = self.transport.local_peer().clone();

        let session_loop = SessionLoop::new(self, cmd_rx, event_tx);
        tokio::spawn(session_loop.run());

        (
            SessionHandle {
                commands: cmd_tx,
                local,
            },
            event_rx,
        )
    }
}

/// Cloneable front door of a running [`ConnectionManager`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    local: PeerId,
}

impl SessionHandle {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Acquire the camera, subscribe to `session` and announce ourselves.
    pub async fn join_session(
        &self,
        session: impl Into<SessionId>,
        display_name: impl Into<String>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Join {
            session: session.into(),
            display_name: display_name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    pub async fn set_local_audio_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetAudioEnabled(enabled)).await
    }

    pub async fn set_local_video_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetVideoEnabled(enabled)).await
    }

    pub async fn set_mirrored(&self, mirrored: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetMirrored(mirrored)).await
    }

    pub async fn set_display_name(&self, name: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetDisplayName(name.into())).await
    }

    /// Switch the outgoing video between camera and screen without
    /// renegotiating. The result arrives as `LocalMediaReady` or
    /// `MediaPermissionRequired`.
    pub async fn set_outgoing_video_source(&self, source: VideoSource) -> Result<(), SessionError> {
        self.send(SessionCommand::SetVideoSource(source)).await
    }

    /// The platform ended the screen capture (e.g. the OS "stop sharing" bar).
    pub async fn screen_capture_ended(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ScreenCaptureEnded).await
    }

    pub async fn send_chat_message(&self, body: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SendChat {
            body: body.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    pub async fn set_focus(&self, target: Option<FocusTarget>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetFocus(target)).await
    }

    /// Close every link, leave the transport and release local media.
    pub async fn leave_session(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Leave(reply)).await?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Peers(reply)).await?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn transcript(&self) -> Result<Vec<ChatMessage>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Transcript(reply)).await?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn focus(&self) -> Result<Option<FocusTarget>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Focus(reply)).await?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Leave (if joined) and stop the session loop.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stop(reply)).await?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)
    }
}

struct SessionLoop {
    config: Arc<SessionConfig>,
    transport: Arc<dyn SignalingTransport>,
    rtc: Arc<dyn RtcFactory>,
    media: Arc<dyn LocalMediaSource>,
    local: PeerId,

    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    notices_tx: mpsc::Sender<LinkNotice>,
    notices_rx: mpsc::Receiver<LinkNotice>,
    media_tx: mpsc::Sender<MediaAcquired>,
    media_rx: mpsc::Receiver<MediaAcquired>,
    signal_rx: Option<MembershipEvents>,

    session: Option<SessionId>,
    links: HashMap<PeerId, LinkEntry>,
    next_link_id: u64,
    retries_used: u32,

    presentation: LocalPresentation,
    presentation_tx: watch::Sender<PresentationSnapshot>,
    tracks_tx: watch::Sender<TrackSet>,
    video_source: VideoSource,
    camera_device: Option<String>,
    media_generation: u64,

    transcript: ChatTranscript,
    focus: FocusState,
}

impl SessionLoop {
    fn new(
        manager: ConnectionManager,
        commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::channel(NOTICE_QUEUE_DEPTH);
        let (media_tx, media_rx) = mpsc::channel(4);
        let presentation = LocalPresentation::new("");
        let (presentation_tx, _) = watch::channel(presentation.snapshot().clone());
        let (tracks_tx, _) = watch::channel(TrackSet::default());
        let local = manager.transport.local_peer().clone();
        let transcript = ChatTranscript::new(manager.config.max_transcript_len);

        Self {
            config: manager.config,
            transport: manager.transport,
            rtc: manager.rtc,
            media: manager.media,
            local,
            commands,
            events,
            notices_tx,
            notices_rx,
            media_tx,
            media_rx,
            signal_rx: None,
            session: None,
            links: HashMap::new(),
            next_link_id: 0,
            retries_used: 0,
            presentation,
            presentation_tx,
            tracks_tx,
            video_source: VideoSource::camera(),
            camera_device: None,
            media_generation: 0,
            transcript,
            focus: FocusState::default(),
        }
    }

    async fn run(mut self) {
        info!(peer = %self.local.short(), "Session loop started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Stop(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                message = next_signal(&mut self.signal_rx) => match message {
                    Some(message) => self.on_signal(message).await,
                    None => self.on_transport_closed().await,
                },
                Some(notice) = self.notices_rx.recv() => self.on_notice(notice).await,
                Some(acquired) = self.media_rx.recv() => self.on_media_acquired(acquired).await,
            }
        }

        info!(peer = %self.local.short(), "Session loop stopped");
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                session,
                display_name,
                reply,
            } => {
                let result = self.join(session, display_name).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetAudioEnabled(enabled) => {
                self.set_track_enabled(MediaKind::Audio, enabled)
            }
            SessionCommand::SetVideoEnabled(enabled) => {
                self.set_track_enabled(MediaKind::Video, enabled)
            }
            SessionCommand::SetMirrored(mirrored) => {
                let changed = self.presentation.set_mirrored(mirrored);
                self.publish(changed);
            }
            SessionCommand::SetDisplayName(name) => {
                let changed = self.presentation.set_name(&name);
                self.publish(changed);
            }
            SessionCommand::SetVideoSource(source) => self.switch_video_source(source),
            SessionCommand::ScreenCaptureEnded => {
                if self.video_source.is_screen() {
                    info!("Screen capture ended, reverting to camera");
                    let camera = VideoSource::Camera {
                        device_id: self.camera_device.clone(),
                    };
                    self.switch_video_source(camera);
                }
            }
            SessionCommand::SendChat { body, reply } => {
                let result = self.send_chat(body).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetFocus(target) => self.set_focus(target).await,
            SessionCommand::Leave(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
            SessionCommand::Peers(reply) => {
                let _ = reply.send(self.peer_summaries());
            }
            SessionCommand::Transcript(reply) => {
                let _ = reply.send(self.transcript.entries());
            }
            SessionCommand::Focus(reply) => {
                let _ = reply.send(self.focus.current().cloned());
            }
            SessionCommand::Stop(reply) => {
                let _ = reply.send(());
            }
        }
    }

    // -- joining and leaving --------------------------------------------

    async fn join(&mut self, session: SessionId, display_name: String) -> Result<(), SessionError> {
        if let Some(current) = &self.session {
            return Err(SessionError::AlreadyJoined(current.clone()));
        }
        let changed = self.presentation.set_name(&display_name);
        self.publish(changed);

        let camera = VideoSource::Camera {
            device_id: self.camera_device.clone(),
        };
        let tracks = match acquire(self.media.as_ref(), &camera, self.config.media_timeout).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(error = %e, "Camera unavailable, not joining");
                self.emit(SessionEvent::MediaPermissionRequired(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        self.apply_enabled(&tracks);
        self.tracks_tx.send_replace(tracks.clone());
        self.video_source = camera;
        self.emit(SessionEvent::LocalMediaReady(tracks)).await;

        if let Err(e) = self.subscribe(&session).await {
            error!(session = %session, error = %e, "Could not join signaling transport");
            self.signal_rx = None;
            let _ = self.transport.leave(&session).await;
            self.release_tracks();
            let err = SessionError::from(e);
            self.emit(SessionEvent::FatalSessionError(err.clone())).await;
            return Err(err);
        }

        info!(session = %session, peer = %self.local.short(), "Joined session");
        self.session = Some(session);
        self.retries_used = 0;
        Ok(())
    }

    /// Subscribe, then announce ourselves once.
    async fn subscribe(&mut self, session: &SessionId) -> Result<(), TransportError> {
        let events = self.transport.join(session).await?;
        self.signal_rx = Some(events);
        self.transport
            .broadcast(session, WireMessage::Join(self.local.clone()))
            .await?;
        debug!(session = %session, "Announced membership");
        Ok(())
    }

    /// Announce ourselves again. The subscription is only renewed when no
    /// link is connected, since a relay reports our leave to every member.
    async fn retry_join(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.clone() else {
            return Ok(());
        };
        if self.config.topology == Topology::Mesh || self.any_connected() {
            self.transport
                .broadcast(&session, WireMessage::Join(self.local.clone()))
                .await?;
            debug!(session = %session, "Re-announced membership");
            return Ok(());
        }
        if let Err(e) = self.transport.leave(&session).await {
            debug!(error = %e, "Leave before rejoin failed");
        }
        self.subscribe(&session).await
    }

    fn any_connected(&self) -> bool {
        self.links
            .values()
            .any(|entry| entry.state == LinkState::Connected)
    }

    /// Revert to the pre-session state. Emits `PeerDisconnected` for every
    /// connected peer.
    async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let farewell = self.presentation.farewell();

        let links: Vec<_> = self.links.drain().collect();
        for (peer, entry) in links {
            let close = LinkEvent::Close {
                farewell: Some(farewell.clone()),
            };
            if entry.inbox.try_send(close).is_err() {
                entry.task.abort();
            }
            if entry.announced {
                self.emit(SessionEvent::PeerDisconnected(peer)).await;
            }
        }

        if let Err(e) = self
            .transport
            .broadcast(&session, WireMessage::Leave(self.local.clone()))
            .await
        {
            debug!(error = %e, "Leave notice not sent");
        }
        if let Err(e) = self.transport.leave(&session).await {
            warn!(session = %session, error = %e, "Error leaving signaling transport");
        }
        self.signal_rx = None;

        self.release_tracks();
        self.video_source = VideoSource::camera();
        self.media_generation += 1;
        self.retries_used = 0;
        self.transcript.clear();
        if self.focus.set(None) {
            self.emit(SessionEvent::FocusChanged(None)).await;
        }
        info!(session = %session, "Left session");
    }

    async fn fatal(&mut self, err: SessionError) {
        error!(error = %err, "Fatal session error");
        self.teardown().await;
        self.emit(SessionEvent::FatalSessionError(err)).await;
    }

    async fn on_transport_closed(&mut self) {
        self.signal_rx = None;
        if self.session.is_some() {
            self.fatal(SessionError::Transport(TransportError::Closed.to_string()))
                .await;
        }
    }

    // -- signaling ------------------------------------------------------

    async fn on_signal(&mut self, message: WireMessage) {
        if !message.is_for(&self.local) {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };

        match message {
            WireMessage::Join(peer) => self.on_peer_joined(peer),
            WireMessage::Leave(peer) => {
                debug!(peer = %peer.short(), "Peer left session");
                self.forward(&peer, LinkEvent::RemoteHangup);
            }
            WireMessage::Signal(signal) => {
                if signal.session != session {
                    debug!(session = %signal.session, "Signal for another session");
                    return;
                }
                self.on_negotiation(signal);
            }
        }
    }

    fn on_peer_joined(&mut self, peer: PeerId) {
        if let Some(entry) = self.links.get(&peer) {
            if entry.state == LinkState::Connected {
                debug!(peer = %peer.short(), "Join from already connected peer");
                return;
            }
            info!(peer = %peer.short(), state = ?entry.state, "Replacing unconnected link");
            self.discard_link(&peer);
        }
        if self.config.topology == Topology::Call && !self.links.is_empty() {
            warn!(peer = %peer.short(), "Call already has a peer, ignoring join");
            return;
        }
        self.start_link(peer, Role::Initiator, None);
    }

    fn on_negotiation(&mut self, signal: SignalMessage) {
        let peer = signal.sender;
        match signal.signal {
            SignalType::Offer(sdp) => self.on_offer(peer, sdp),
            SignalType::Answer(sdp) => self.forward(&peer, LinkEvent::RemoteAnswer(sdp)),
            SignalType::IceCandidate(candidate) => {
                self.forward(&peer, LinkEvent::RemoteCandidates(vec![candidate]))
            }
            SignalType::IceBatch(candidates) => {
                self.forward(&peer, LinkEvent::RemoteCandidates(candidates))
            }
            SignalType::Hangup => self.forward(&peer, LinkEvent::RemoteHangup),
        }
    }

    fn on_offer(&mut self, peer: PeerId, sdp: String) {
        if let Some(entry) = self.links.get(&peer) {
            match (entry.role, entry.state) {
                (_, LinkState::Connected) => {
                    self.forward(&peer, LinkEvent::RemoteOffer(sdp));
                    return;
                }
                (Role::Initiator, _) if self.local < peer => {
                    debug!(peer = %peer.short(), "Offer glare, keeping our offer");
                    return;
                }
                _ => {
                    debug!(peer = %peer.short(), "Offer glare, answering instead");
                    self.discard_link(&peer);
                }
            }
        }
        if self.config.topology == Topology::Call && !self.links.is_empty() {
            warn!(peer = %peer.short(), "Call already has a peer, ignoring offer");
            return;
        }
        self.start_link(peer, Role::Responder, Some(LinkEvent::RemoteOffer(sdp)));
    }

    fn forward(&self, peer: &PeerId, event: LinkEvent) {
        let name = event.name();
        match self.links.get(peer) {
            Some(entry) => {
                if entry.inbox.try_send(event).is_err() {
                    warn!(peer = %peer.short(), event = name, "Link inbox unavailable, dropping");
                }
            }
            None => debug!(peer = %peer.short(), event = name, "No link for signal"),
        }
    }

    fn start_link(&mut self, peer: PeerId, role: Role, first: Option<LinkEvent>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.next_link_id += 1;
        let link_id = self.next_link_id;

        let (inbox, inbox_rx) = mpsc::channel(LINK_INBOX_DEPTH);
        if let Some(first) = first {
            let _ = inbox.try_send(first);
        }
        let task = spawn_link(
            LinkSpawn {
                peer: peer.clone(),
                link_id,
                role,
                factory: self.rtc.clone(),
                signals: SignalSink::new(self.transport.clone(), session, peer.clone()),
                notices: self.notices_tx.clone(),
                tracks: self.tracks_tx.subscribe(),
                presentation: self.presentation_tx.subscribe(),
                config: self.config.clone(),
            },
            inbox_rx,
        );

        info!(peer = %peer.short(), ?role, link = link_id, "Starting peer link");
        self.links.insert(
            peer,
            LinkEntry {
                link_id,
                role,
                state: LinkState::New,
                inbox,
                task,
                announced: false,
                presentation: None,
            },
        );
    }

    /// Drop a superseded link without telling the remote side.
    fn discard_link(&mut self, peer: &PeerId) {
        if let Some(entry) = self.links.remove(peer) {
            let _ = entry.inbox.try_send(LinkEvent::Abandon);
        }
    }

    // -- link reports ---------------------------------------------------

    async fn on_notice(&mut self, notice: LinkNotice) {
        let LinkNotice {
            peer,
            link_id,
            report,
        } = notice;
        let Some(entry) = self.links.get_mut(&peer) else {
            return;
        };
        if entry.link_id != link_id {
            debug!(peer = %peer.short(), link = link_id, "Ignoring report from replaced link");
            return;
        }

        match report {
            LinkReport::State(state) => {
                entry.state = state;
                if state == LinkState::Connected && !entry.announced {
                    entry.announced = true;
                    self.retries_used = 0;
                    info!(peer = %peer.short(), "Peer connected");
                    self.emit(SessionEvent::PeerConnected(peer)).await;
                }
            }
            LinkReport::Presentation(snapshot) => {
                entry.presentation = Some(snapshot.clone());
                self.emit(SessionEvent::PeerPresentationChanged(peer, snapshot))
                    .await;
            }
            LinkReport::Chat(message) => {
                if self.transcript.append(message.clone()) {
                    self.emit(SessionEvent::ChatMessage(message)).await;
                }
            }
            LinkReport::RemoteTrack { kind, track_id } => {
                self.emit(SessionEvent::RemoteTrack {
                    peer,
                    kind,
                    track_id,
                })
                .await;
            }
            LinkReport::TrackReplacementFailed(kind) => {
                self.emit(SessionEvent::TrackReplacementFailed { peer, kind })
                    .await;
            }
            LinkReport::Terminated(reason) => self.on_link_terminated(peer, reason).await,
        }
    }

    async fn on_link_terminated(&mut self, peer: PeerId, reason: CloseReason) {
        let Some(entry) = self.links.remove(&peer) else {
            return;
        };
        if entry.announced {
            info!(peer = %peer.short(), reason = %reason, "Peer disconnected");
            self.emit(SessionEvent::PeerDisconnected(peer.clone())).await;
        } else {
            debug!(peer = %peer.short(), reason = %reason, "Unconnected link ended");
        }
        if self.focus.clear_if_peer(&peer) {
            self.emit(SessionEvent::FocusChanged(None)).await;
        }

        match reason {
            CloseReason::Signaling(e) => self.fatal(SessionError::Transport(e)).await,
            CloseReason::NegotiationTimeout => self.on_negotiation_timeout(peer).await,
            reason if self.config.topology == Topology::Call => {
                self.fatal(SessionError::PeerLinkFailure {
                    peer,
                    reason: reason.to_string(),
                })
                .await
            }
            _ => {}
        }
    }

    /// First timeout: retry the join once. Later timeouts end the session
    /// only if nothing is connected.
    async fn on_negotiation_timeout(&mut self, peer: PeerId) {
        if self.retries_used < self.config.join_retries {
            self.retries_used += 1;
            warn!(peer = %peer.short(), attempt = self.retries_used, "Negotiation timed out, retrying join");
            if let Err(e) = self.retry_join().await {
                self.fatal(e.into()).await;
            }
            return;
        }

        if !self.any_connected() || self.config.topology == Topology::Call {
            self.fatal(SessionError::NegotiationTimeout { peer }).await;
        } else {
            warn!(peer = %peer.short(), "Negotiation timed out, dropping peer");
        }
    }

    // -- local media and presentation -----------------------------------

    fn publish(&mut self, changed: Option<PresentationSnapshot>) {
        if let Some(snapshot) = changed {
            debug!(seq = snapshot.seq, "Local presentation changed");
            self.presentation_tx.send_replace(snapshot);
        }
    }

    fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) {
        if self.tracks_tx.borrow().get(kind).is_some() {
            self.media.set_enabled(kind, enabled);
        }
        let changed = match kind {
            MediaKind::Audio => self.presentation.set_audio_enabled(enabled),
            MediaKind::Video => self.presentation.set_video_enabled(enabled),
        };
        self.publish(changed);
    }

    /// Fresh tracks start in the state the user last chose.
    fn apply_enabled(&self, tracks: &TrackSet) {
        let snapshot = self.presentation.snapshot();
        for track in tracks.iter() {
            let enabled = match track.kind {
                MediaKind::Audio => snapshot.audio_enabled,
                MediaKind::Video => snapshot.video_enabled,
            };
            self.media.set_enabled(track.kind, enabled);
        }
    }

    fn release_tracks(&mut self) {
        let tracks = self.tracks_tx.send_replace(TrackSet::default());
        if !tracks.is_empty() {
            self.media.stop(&tracks);
        }
    }

    fn switch_video_source(&mut self, source: VideoSource) {
        if self.session.is_none() {
            warn!(?source, "Not in a session, ignoring video source change");
            return;
        }
        // Any in-flight acquisition is superseded from here on
        self.media_generation += 1;
        if source == self.video_source {
            debug!(?source, "Video source already active");
            return;
        }

        let generation = self.media_generation;
        let media = self.media.clone();
        let results = self.media_tx.clone();
        let limit = self.config.media_timeout;
        info!(?source, "Switching video source");
        tokio::spawn(async move {
            let result = acquire(media.as_ref(), &source, limit).await;
            let _ = results
                .send(MediaAcquired {
                    generation,
                    source,
                    result,
                })
                .await;
        });
    }

    async fn on_media_acquired(&mut self, acquired: MediaAcquired) {
        let MediaAcquired {
            generation,
            source,
            result,
        } = acquired;
        if generation != self.media_generation || self.session.is_none() {
            debug!(?source, "Discarding superseded media acquisition");
            if let Ok(tracks) = result {
                self.media.stop(&tracks);
            }
            return;
        }

        match result {
            Ok(fresh) => {
                let current = self.tracks_tx.borrow().clone();
                let (merged, displaced) = current.overlay(&fresh);
                self.apply_enabled(&fresh);
                self.tracks_tx.send_replace(merged.clone());
                if !displaced.is_empty() {
                    self.media.stop(&displaced);
                }

                let was_sharing = self.video_source.is_screen();
                if let VideoSource::Camera { device_id } = &source {
                    self.camera_device = device_id.clone();
                }
                self.video_source = source;
                let sharing = self.video_source.is_screen();
                if sharing {
                    let changed = self.presentation.set_mirrored(false);
                    self.publish(changed);
                }
                if sharing != was_sharing {
                    self.emit(SessionEvent::ScreenShareChanged(sharing)).await;
                }
                self.emit(SessionEvent::LocalMediaReady(merged)).await;
            }
            Err(e) => {
                warn!(?source, error = %e, "Media acquisition failed");
                self.emit(SessionEvent::MediaPermissionRequired(e.to_string()))
                    .await;
                if source.is_screen() {
                    let sharing = self.video_source.is_screen();
                    self.emit(SessionEvent::ScreenShareChanged(sharing)).await;
                }
            }
        }
    }

    // -- chat and focus -------------------------------------------------

    async fn send_chat(&mut self, body: String) -> Result<ChatMessage, SessionError> {
        if self.session.is_none() {
            return Err(SessionError::NotJoined);
        }
        if body.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let connected: Vec<_> = self
            .links
            .iter()
            .filter(|(_, entry)| entry.state == LinkState::Connected)
            .map(|(peer, entry)| (peer.clone(), entry.inbox.clone()))
            .collect();
        if connected.is_empty() {
            return Err(SessionError::NoConnectedPeers);
        }

        let message = ChatMessage::new(
            self.local.clone(),
            self.presentation.snapshot().name.clone(),
            body,
        );
        for (peer, inbox) in connected {
            if inbox.try_send(LinkEvent::SendChat(message.clone())).is_err() {
                warn!(peer = %peer.short(), "Chat message not queued for peer");
            }
        }
        self.transcript.append(message.clone());
        self.emit(SessionEvent::ChatMessage(message.clone())).await;
        Ok(message)
    }

    async fn set_focus(&mut self, target: Option<FocusTarget>) {
        if let Some(FocusTarget::Peer(peer)) = &target {
            if !self.links.contains_key(peer) {
                warn!(peer = %peer.short(), "Cannot focus unknown peer");
                return;
            }
        }
        if self.focus.set(target.clone()) {
            self.emit(SessionEvent::FocusChanged(target)).await;
        }
    }

    fn peer_summaries(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<_> = self
            .links
            .iter()
            .map(|(peer, entry)| PeerSummary {
                peer: peer.clone(),
                role: entry.role,
                state: entry.state,
                presentation: entry.presentation.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Session event receiver dropped");
        }
    }
}

async fn next_signal(signals: &mut Option<MembershipEvents>) -> Option<WireMessage> {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

async fn acquire(
    media: &dyn LocalMediaSource,
    source: &VideoSource,
    limit: Duration,
) -> Result<TrackSet, MediaError> {
    let request = async {
        match source {
            VideoSource::Camera { device_id } => media.acquire_camera(device_id.as_deref()).await,
            VideoSource::Screen => media.acquire_screen_capture().await,
        }
    };
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(MediaError::Timeout),
    }
}
