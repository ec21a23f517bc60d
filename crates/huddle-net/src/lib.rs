// Session-scoped signaling transports: in-process hub, WebSocket relay client
// and the shared-record variant.

pub mod hub;
pub mod record;
pub mod relay;
pub mod transport;

pub use hub::{HubTransport, LocalHub};
pub use record::{RecordStore, RecordTransport, SessionRecord};
pub use relay::{RelayCommand, RelayTransport};
pub use transport::{MembershipEvents, SignalingTransport, TransportError};
