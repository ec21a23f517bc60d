//! WebSocket client of the `huddle-server` signaling relay.
//!
//! Each joined session owns one socket split into a writer task, fed by a
//! command channel, and a reader task that decodes frames into
//! [`WireMessage`]s. The relay fans frames out to every other member of the
//! session and keeps no history.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use huddle_shared::constants::SIGNAL_QUEUE_DEPTH;
use huddle_shared::protocol::WireMessage;
use huddle_shared::types::{PeerId, SessionId};

use crate::transport::{MembershipEvents, SignalingTransport, TransportError};

/// Commands sent *into* a session's writer task.
#[derive(Debug)]
pub enum RelayCommand {
    /// Send one encoded frame.
    Publish(String),
    /// Close the socket.
    Shutdown,
}

struct RelayConnection {
    cmd_tx: mpsc::Sender<RelayCommand>,
    reader: JoinHandle<()>,
}

pub struct RelayTransport {
    base_url: String,
    local: PeerId,
    connections: Mutex<HashMap<SessionId, RelayConnection>>,
}

impl RelayTransport {
    /// `base_url` is the relay root, e.g. `ws://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>, local: PeerId) -> Self {
        Self {
            base_url: base_url.into(),
            local,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_url(&self, session: &SessionId) -> String {
        format!(
            "{}/session/{}",
            self.base_url.trim_end_matches('/'),
            session.as_str()
        )
    }

    fn command_sender(&self, session: &SessionId) -> Result<mpsc::Sender<RelayCommand>, TransportError> {
        let connections = self
            .connections
            .lock()
            .map_err(|_| TransportError::Unreachable("relay lock poisoned".to_string()))?;
        connections
            .get(session)
            .map(|c| c.cmd_tx.clone())
            .ok_or_else(|| TransportError::NotJoined(session.clone()))
    }

    fn take_connection(&self, session: &SessionId) -> Option<RelayConnection> {
        self.connections
            .lock()
            .ok()
            .and_then(|mut connections| connections.remove(session))
    }
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn join(&self, session: &SessionId) -> Result<MembershipEvents, TransportError> {
        let url = self.session_url(session);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        info!(url = %url, peer = %self.local.short(), "Connected to signaling relay");

        let (mut sink, mut source) = stream.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<RelayCommand>(SIGNAL_QUEUE_DEPTH);
        let (notif_tx, notif_rx) = mpsc::channel::<WireMessage>(SIGNAL_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    RelayCommand::Publish(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(error = %e, "Relay write failed");
                            break;
                        }
                    }
                    RelayCommand::Shutdown => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("Relay writer terminated");
        });

        let session_name = session.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match WireMessage::from_json(&text) {
                        Ok(message) => {
                            if notif_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(session = %session_name, error = %e, "Dropping undecodable frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(session = %session_name, error = %e, "Relay read failed");
                        break;
                    }
                }
            }
            info!(session = %session_name, "Relay connection closed");
        });

        let previous = self
            .connections
            .lock()
            .map_err(|_| TransportError::Unreachable("relay lock poisoned".to_string()))?
            .insert(session.clone(), RelayConnection { cmd_tx, reader });
        if let Some(previous) = previous {
            let _ = previous.cmd_tx.try_send(RelayCommand::Shutdown);
            previous.reader.abort();
        }

        Ok(notif_rx)
    }

    async fn broadcast(
        &self,
        session: &SessionId,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let frame = message.to_json()?;
        let cmd_tx = self.command_sender(session)?;
        cmd_tx
            .send(RelayCommand::Publish(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn leave(&self, session: &SessionId) -> Result<(), TransportError> {
        if let Some(connection) = self.take_connection(session) {
            debug!(session = %session, "Leaving signaling relay");
            let _ = connection.cmd_tx.send(RelayCommand::Shutdown).await;
            connection.reader.abort();
        }
        Ok(())
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        if let Ok(mut connections) = self.connections.lock() {
            for (_, connection) in connections.drain() {
                let _ = connection.cmd_tx.try_send(RelayCommand::Shutdown);
                connection.reader.abort();
            }
        }
    }
}
