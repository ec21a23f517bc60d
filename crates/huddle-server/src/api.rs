use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use huddle_shared::protocol::WireMessage;
use huddle_shared::types::PeerId;

use crate::config::RelayConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter, TokenBucket};
use crate::room::{MemberId, RoomRegistry};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomRegistry,
    pub rate_limiter: RateLimiter,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: RoomRegistry::new(config.max_session_members),
            rate_limiter: RateLimiter::from_config(&config),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/session/:id", get(session_socket))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.rooms.session_count().await,
    })
}

/// Upgrade to a WebSocket subscribed to one session. The member is
/// registered before the handshake completes, so a client never misses
/// frames sent right after its `join` returns.
async fn session_socket(
    ws: WebSocketUpgrade,
    Path(session): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    validate_session_id(&session)?;
    let (member, outbound) = state.rooms.join(&session).await?;

    let max_frame = state.config.max_frame_bytes;
    Ok(ws
        .max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| serve_member(socket, state, session, member, outbound)))
}

fn validate_session_id(session: &str) -> Result<(), ServerError> {
    let valid = !session.is_empty()
        && session.len() <= MAX_SESSION_ID_LEN
        && session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ServerError::InvalidSession(session.to_string()))
    }
}

/// Pump one socket until either side goes away, then announce a departure
/// on the member's behalf if it had identified itself.
async fn serve_member(
    socket: WebSocket,
    state: AppState,
    session: String,
    member: MemberId,
    mut outbound: tokio::sync::mpsc::Receiver<String>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut budget = TokenBucket::new(state.config.rate_limit_per_sec, state.config.rate_limit_burst);
    let mut announced: Option<PeerId> = None;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(session = %session, member, error = %e, "Socket write failed");
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !budget.try_consume() {
                        warn!(session = %session, member, "Frame rate exceeded, dropping");
                        continue;
                    }
                    match WireMessage::from_json(&text) {
                        Ok(message) => {
                            if !accept_sender(&mut announced, &message) {
                                warn!(session = %session, member, "Frame sender mismatch, dropping");
                                continue;
                            }
                            state.rooms.publish(&session, member, &text).await;
                        }
                        Err(e) => {
                            warn!(session = %session, member, error = %e, "Dropping undecodable frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session, member, error = %e, "Socket read failed");
                    break;
                }
            },
        }
    }

    state.rooms.leave(&session, member).await;
    if let Some(peer) = announced {
        match WireMessage::Leave(peer.clone()).to_json() {
            Ok(frame) => state.rooms.publish(&session, member, &frame).await,
            Err(e) => warn!(error = %e, "Could not encode leave notice"),
        }
        info!(session = %session, peer = %peer.short(), "Announced departure of closed socket");
    }
}

/// The first frame fixes the socket's peer id; later frames must match it.
fn accept_sender(announced: &mut Option<PeerId>, message: &WireMessage) -> bool {
    match announced {
        Some(peer) => peer == message.sender(),
        None => {
            *announced = Some(message.sender().clone());
            true
        }
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting signaling relay");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use huddle_media::loopback::{LoopbackMedia, LoopbackNetwork};
    use huddle_media::{ConnectionManager, LinkState, SessionConfig, SessionEvent, SessionHandle};
    use huddle_net::{RelayTransport, SignalingTransport, TransportError};
    use huddle_shared::types::SessionId;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tower::ServiceExt;

    async fn spawn_relay(config: RelayConfig) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(AppState::new(config));
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await
            .unwrap();
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(AppState::new(RelayConfig::default()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sessions"], 0);
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("room-1").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_sender_pinned_by_first_frame() {
        let mut announced = None;
        assert!(accept_sender(&mut announced, &WireMessage::Join(PeerId::from("a"))));
        assert!(accept_sender(&mut announced, &WireMessage::Leave(PeerId::from("a"))));
        assert!(!accept_sender(&mut announced, &WireMessage::Join(PeerId::from("b"))));
    }

    #[tokio::test]
    async fn test_relay_fans_out_and_announces_departure() {
        let url = spawn_relay(RelayConfig::default()).await;
        let session = SessionId::from("room-1");
        let a = RelayTransport::new(url.clone(), PeerId::from("a"));
        let b = RelayTransport::new(url, PeerId::from("b"));

        let mut a_rx = a.join(&session).await.unwrap();
        let mut b_rx = b.join(&session).await.unwrap();

        a.broadcast(&session, WireMessage::Join(PeerId::from("a")))
            .await
            .unwrap();
        let received = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(received, Some(WireMessage::Join(PeerId::from("a"))));
        assert!(a_rx.try_recv().is_err());

        a.leave(&session).await.unwrap();
        let received = timeout(Duration::from_secs(5), b_rx.recv()).await.unwrap();
        assert_eq!(received, Some(WireMessage::Leave(PeerId::from("a"))));
    }

    #[tokio::test]
    async fn test_full_session_rejected() {
        let url = spawn_relay(RelayConfig {
            max_session_members: 1,
            ..RelayConfig::default()
        })
        .await;
        let session = SessionId::from("room-1");
        let a = RelayTransport::new(url.clone(), PeerId::from("a"));
        let b = RelayTransport::new(url, PeerId::from("b"));

        let _a_rx = a.join(&session).await.unwrap();
        assert!(matches!(
            b.join(&session).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    fn start_member(
        url: &str,
        net: &LoopbackNetwork,
        id: &str,
        liveness: Duration,
    ) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let peer = PeerId::from(id);
        ConnectionManager::new(
            SessionConfig {
                liveness_timeout: liveness,
                ..SessionConfig::default()
            },
            Arc::new(RelayTransport::new(url.to_string(), peer.clone())),
            Arc::new(net.factory(peer)),
            Arc::new(LoopbackMedia::new()),
        )
        .start()
    }

    async fn wait_connected(events: &mut mpsc::Receiver<SessionEvent>, peer: &PeerId) {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(SessionEvent::PeerConnected(p)) if p == *peer => return,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_silent_member_does_not_disturb_connected_members() {
        let url = spawn_relay(RelayConfig::default()).await;
        let net = LoopbackNetwork::new();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let (a, mut a_events) = start_member(&url, &net, "a", Duration::from_millis(300));
        let (b, mut b_events) = start_member(&url, &net, "b", Duration::from_secs(10));

        a.join_session("room-1", "Ada").await.unwrap();
        b.join_session("room-1", "Bob").await.unwrap();
        wait_connected(&mut a_events, &b_id).await;
        wait_connected(&mut b_events, &a_id).await;

        // Announces itself and never answers an offer
        let session = SessionId::from("room-1");
        let ghost = RelayTransport::new(url.clone(), PeerId::from("ghost"));
        let _ghost_rx = ghost.join(&session).await.unwrap();
        ghost
            .broadcast(&session, WireMessage::Join(PeerId::from("ghost")))
            .await
            .unwrap();

        // Past a's liveness deadline and its join retry
        tokio::time::sleep(Duration::from_millis(1500)).await;

        for events in [&mut a_events, &mut b_events] {
            while let Ok(event) = events.try_recv() {
                assert!(
                    !matches!(
                        event,
                        SessionEvent::PeerDisconnected(_) | SessionEvent::FatalSessionError(_)
                    ),
                    "connected link disturbed: {event:?}"
                );
            }
        }
        let a_links = a.peers().await.unwrap();
        assert_eq!(a_links.len(), 1);
        assert_eq!(a_links[0].peer, b_id);
        assert_eq!(a_links[0].state, LinkState::Connected);
        assert!(b
            .peers()
            .await
            .unwrap()
            .iter()
            .any(|link| link.peer == a_id && link.state == LinkState::Connected));
        assert!(net.is_connected(&a_id, &b_id));
    }
}
