use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_SIGNAL_FRAME_BYTES;
use crate::error::ProtocolError;
use crate::types::{PeerId, SessionId};

/// All signaling messages exchanged through a session's transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum WireMessage {
    /// Membership announcement, sent once right after subscribing
    Join(PeerId),

    /// Best-effort departure notice
    Leave(PeerId),

    /// Negotiation traffic addressed to one peer
    Signal(SignalMessage),
}

/// Session description / ICE traffic for one directed pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub sender: PeerId,
    pub target: PeerId,
    pub session: SessionId,
    pub signal: SignalType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// SDP Offer
    Offer(String),
    /// SDP Answer
    Answer(String),
    /// One trickled ICE candidate (JSON candidate init)
    IceCandidate(String),
    /// Every candidate gathered, sent once gathering completed
    IceBatch(Vec<String>),
    /// Call ended
    Hangup,
}

impl SignalType {
    pub fn name(&self) -> &'static str {
        match self {
            SignalType::Offer(_) => "offer",
            SignalType::Answer(_) => "answer",
            SignalType::IceCandidate(_) => "ice_candidate",
            SignalType::IceBatch(_) => "ice_batch",
            SignalType::Hangup => "hangup",
        }
    }
}

impl WireMessage {
    pub fn sender(&self) -> &PeerId {
        match self {
            WireMessage::Join(peer) | WireMessage::Leave(peer) => peer,
            WireMessage::Signal(signal) => &signal.sender,
        }
    }

    /// Whether `local` should act on this message. Transports may echo a
    /// member's own broadcasts back, so the sender is filtered here.
    pub fn is_for(&self, local: &PeerId) -> bool {
        match self {
            WireMessage::Join(peer) | WireMessage::Leave(peer) => peer != local,
            WireMessage::Signal(signal) => &signal.target == local && &signal.sender != local,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self)?;
        if json.len() > MAX_SIGNAL_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: json.len(),
                max: MAX_SIGNAL_FRAME_BYTES,
            });
        }
        Ok(json)
    }

    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        if data.len() > MAX_SIGNAL_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: MAX_SIGNAL_FRAME_BYTES,
            });
        }
        Ok(serde_json::from_str(data)?)
    }
}

/// Presentation state of one participant, sent whole on the `meta` channel.
///
/// Field names match the browser clients so both can share a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationSnapshot {
    pub name: String,
    #[serde(rename = "isAudioEnabled")]
    pub audio_enabled: bool,
    #[serde(rename = "isVideoEnabled")]
    pub video_enabled: bool,
    #[serde(rename = "isCameraMirrored")]
    pub mirrored: bool,
    /// `false` only on the farewell snapshot of a leaving peer
    #[serde(rename = "isConnected", default = "default_connected")]
    pub connected: bool,
    /// Per-sender counter; `0` means the sender does not number its snapshots
    #[serde(default)]
    pub seq: u64,
}

fn default_connected() -> bool {
    true
}

impl PresentationSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            audio_enabled: true,
            video_enabled: true,
            mirrored: false,
            connected: true,
            seq: 0,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// A chat line, sent on the `chat` channel of every connected link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message UUID for deduplication
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub sender: Option<PeerId>,
    #[serde(rename = "user")]
    pub sender_name: String,
    pub body: String,
    #[serde(rename = "time", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: PeerId, sender_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: Some(sender),
            sender_name: sender_name.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }
}
