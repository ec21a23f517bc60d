// Identifiers, wire protocol and error types shared by every huddle crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ChatMessage, PresentationSnapshot, SignalMessage, SignalType, WireMessage};
pub use types::{MediaKind, PeerId, SessionId};
