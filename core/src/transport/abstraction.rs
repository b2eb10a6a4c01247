//! Transport abstraction layer for meshcast
//!
//! Defines the link-layer vocabulary shared by the registry, the arbiter and the
//! dissemination engines, plus the capability traits implemented per radio.

use crate::store::ContentItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Link-layer technologies a neighbor can be observed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    /// Classic Bluetooth (RFCOMM)
    Bluetooth,
    /// WiFi in infrastructure mode (same access point)
    WifiManaged,
    /// WiFi Direct (peer-to-peer groups)
    WifiDirect,
    /// In-process transport for tests and simulations
    Local,
}

impl TransportType {
    /// Stable identifier used in logs and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Bluetooth => "bluetooth",
            TransportType::WifiManaged => "wifi-managed",
            TransportType::WifiDirect => "wifi-direct",
            TransportType::Local => "local",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link-layer address of a neighbor (MAC address, IP address, ...).
///
/// Ordering is plain lexicographic string ordering; the connection arbiter relies on
/// it to give both ends of a link the same tie-break result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkAddress(String);

impl LinkAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// An observation of a neighbor through one specific transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub address: LinkAddress,
    pub transport: TransportType,
    pub observed_at: SystemTime,
}

impl Presence {
    pub fn new(address: impl Into<LinkAddress>, transport: TransportType) -> Self {
        Self {
            address: address.into(),
            transport,
            observed_at: SystemTime::now(),
        }
    }
}

impl From<String> for LinkAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of an application protocol running over a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub &'static str);

/// The epidemic push protocol served by the dissemination engines
pub const PUSH_PROTOCOL: ProtocolId = ProtocolId("meshcast-push");

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identifier of one connection attempt / established session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Preferences announced to a peer when a push session starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProfile {
    pub name: String,
    pub interests: Vec<String>,
    pub groups: Vec<String>,
}

/// Commands from the dissemination engine to a transport session
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Announce our name, interests and group memberships
    SendLocalInformation(LocalProfile),
    /// Push one content item to the peer
    PushContent(Arc<ContentItem>),
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCommand::SendLocalInformation(profile) => write!(
                f,
                "SendLocalInformation {{ name: {}, interests: {} }}",
                profile.name,
                profile.interests.len()
            ),
            TransportCommand::PushContent(item) => {
                write!(f, "PushContent {{ id: {}, body_len: {} }}", item.id, item.body.len())
            }
        }
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("No adapter registered for transport: {0}")]
    AdapterNotFound(TransportType),

    #[error("Adapter not active: {0}")]
    AdapterInactive(TransportType),

    #[error("Link layer disabled by configuration: {0}")]
    AdapterDisabled(TransportType),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Session closed")]
    SessionClosed,
}

/// Capability interface of one link-layer technology (scan + connect).
///
/// Implementations call back into the coordinator for discovery and session events;
/// they are looked up by [`TransportType`] rather than through a type hierarchy.
#[cfg_attr(test, mockall::automock)]
pub trait LinkLayerAdapter: Send + Sync {
    fn transport(&self) -> TransportType;

    fn start(&self) -> Result<(), TransportError>;

    fn stop(&self);

    fn is_active(&self) -> bool;

    fn is_scanning(&self) -> bool;

    fn force_discovery(&self);

    /// Initiate a connection to a neighbor observed through this adapter
    fn connect_to(&self, presence: &Presence, autoconnect: bool) -> Result<(), TransportError>;

    /// Abort an in-flight outgoing dial that lost a connection race
    fn cancel_dial(&self, session: SessionId);
}

/// An established, protocol-identified connection to one neighbor
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn send(&self, command: TransportCommand) -> Result<(), TransportError>;

    fn close(&self) {}
}
