//! The task that owns one [`PeerLink`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use huddle_shared::protocol::PresentationSnapshot;
use huddle_shared::types::PeerId;

use crate::config::SessionConfig;
use crate::peer_link::{
    CloseReason, LinkError, LinkEvent, LinkNotice, LinkReport, PeerLink, PeerLinkParams,
};
use crate::rtc::{RtcError, RtcFactory, Role};
use crate::signaling::SignalSink;
use crate::tracks::TrackSet;

const RTC_EVENT_DEPTH: usize = 128;

pub(crate) struct LinkSpawn {
    pub peer: PeerId,
    pub link_id: u64,
    pub role: Role,
    pub factory: Arc<dyn RtcFactory>,
    pub signals: SignalSink,
    pub notices: mpsc::Sender<LinkNotice>,
    pub tracks: watch::Receiver<TrackSet>,
    pub presentation: watch::Receiver<PresentationSnapshot>,
    pub config: Arc<SessionConfig>,
}

pub(crate) fn spawn_link(spawn: LinkSpawn, inbox: mpsc::Receiver<LinkEvent>) -> JoinHandle<()> {
    tokio::spawn(run_link(spawn, inbox))
}

async fn run_link(mut spawn: LinkSpawn, mut inbox: mpsc::Receiver<LinkEvent>) {
    let (rtc_tx, mut rtc_rx) = mpsc::channel(RTC_EVENT_DEPTH);
    // Newest values at creation: a link built mid-switch never sees a stale track
    let tracks = spawn.tracks.borrow_and_update().clone();
    let snapshot = spawn.presentation.borrow_and_update().clone();

    let mut sent = tracks.clone();

    let rtc = match spawn
        .factory
        .create_peer(&spawn.peer, spawn.role, &tracks, rtc_tx)
        .await
    {
        Ok(rtc) => rtc,
        Err(e) => {
            warn!(peer = %spawn.peer.short(), error = %e, "Could not create peer connection");
            let notice = LinkNotice {
                peer: spawn.peer.clone(),
                link_id: spawn.link_id,
                report: LinkReport::Terminated(CloseReason::Rtc(e.to_string())),
            };
            let _ = spawn.notices.send(notice).await;
            return;
        }
    };

    let mut link = PeerLink::new(PeerLinkParams {
        peer: spawn.peer.clone(),
        link_id: spawn.link_id,
        role: spawn.role,
        rtc,
        signals: spawn.signals.clone(),
        notices: spawn.notices.clone(),
        ice_mode: spawn.config.ice_mode,
        liveness_timeout: spawn.config.liveness_timeout,
        tracks,
        snapshot,
    });

    if spawn.role == Role::Initiator {
        handle(&mut link, LinkEvent::Start).await;
    }

    while !link.state().is_terminal() {
        let deadline = link.liveness_deadline();
        let event = tokio::select! {
            event = inbox.recv() => match event {
                Some(event) => event,
                None => LinkEvent::Abandon,
            },
            Some(event) = rtc_rx.recv() => LinkEvent::Rtc(event),
            changed = spawn.tracks.changed() => {
                if changed.is_err() {
                    LinkEvent::Close { farewell: None }
                } else {
                    let tracks = spawn.tracks.borrow_and_update().clone();
                    for track in tracks.replacements(&sent) {
                        handle(&mut link, LinkEvent::ReplaceTrack(track.clone())).await;
                    }
                    sent = tracks;
                    continue;
                }
            }
            changed = spawn.presentation.changed() => {
                if changed.is_err() {
                    LinkEvent::Close { farewell: None }
                } else {
                    LinkEvent::LocalSnapshot(spawn.presentation.borrow_and_update().clone())
                }
            }
            _ = liveness(deadline) => LinkEvent::LivenessExpired,
        };
        handle(&mut link, event).await;
    }
    debug!(peer = %spawn.peer.short(), link = spawn.link_id, "Link task finished");
}

async fn liveness(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle(link: &mut PeerLink, event: LinkEvent) {
    let name = event.name();
    let Err(e) = link.dispatch(event).await else {
        return;
    };
    match e {
        LinkError::NoSender(kind) => {
            warn!(peer = %link.peer().short(), %kind, "No sender for replacement track");
            link.report(LinkReport::TrackReplacementFailed(kind)).await;
        }
        LinkError::Rtc(RtcError::ChannelNotOpen(label)) => {
            debug!(peer = %link.peer().short(), event = name, label = %label, "Data channel not open yet")
        }
        LinkError::Rtc(e) => link.fail(CloseReason::Rtc(e.to_string())).await,
        LinkError::Signaling(e) => link.fail(CloseReason::Signaling(e.to_string())).await,
        other => {
            warn!(peer = %link.peer().short(), event = name, error = %other, "Link event rejected")
        }
    }
}
