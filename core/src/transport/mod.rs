// Transport module: link-layer vocabulary, adapter capabilities and the local medium

pub mod abstraction;
pub mod local;

pub use abstraction::{
    LinkAddress, LinkLayerAdapter, LocalProfile, Presence, ProtocolId, SessionId,
    TransportCommand, TransportError, TransportSession, TransportType, PUSH_PROTOCOL,
};
pub use local::{pump_inbox, LocalAdapter, LocalMedium, LocalSession, Received};
