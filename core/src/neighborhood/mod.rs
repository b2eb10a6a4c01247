// Neighborhood: who is reachable, over what, and which protocol sessions run with them

pub mod arbiter;
pub mod registry;

pub use arbiter::{ConnectionArbiter, ConnectionState, InboundVerdict, StateError};
pub use registry::{NeighborhoodRegistry, RegistryError, SessionRef, DEFAULT_EVENT_CAPACITY};

use crate::transport::{LinkAddress, Presence, ProtocolId, SessionId, TransportType};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

/// An active protocol session with a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    pub id: SessionId,
    /// Transport the session runs over
    pub transport: TransportType,
}

/// A device seen by at least one adapter since startup
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub address: LinkAddress,
    /// Link-layer type of the first sighting
    pub link_type: TransportType,
    /// Current observations, one per transport
    pub presences: BTreeMap<TransportType, Presence>,
    pub sessions: HashMap<ProtocolId, SessionEntry>,
    pub arbiters: HashMap<ProtocolId, ConnectionArbiter>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
}

impl Neighbor {
    pub(crate) fn new(presence: &Presence) -> Self {
        let mut presences = BTreeMap::new();
        presences.insert(presence.transport, presence.clone());
        Self {
            address: presence.address.clone(),
            link_type: presence.transport,
            presences,
            sessions: HashMap::new(),
            arbiters: HashMap::new(),
            first_seen: presence.observed_at,
            last_seen: presence.observed_at,
        }
    }

    /// At least one adapter currently observes this neighbor
    pub fn is_reachable(&self) -> bool {
        !self.presences.is_empty()
    }

    pub fn transports(&self) -> Vec<TransportType> {
        self.presences.keys().copied().collect()
    }

    pub fn session(&self, protocol: ProtocolId) -> Option<SessionEntry> {
        self.sessions.get(&protocol).copied()
    }

    pub fn connection_state(&self, protocol: ProtocolId) -> ConnectionState {
        self.arbiters
            .get(&protocol)
            .map(|a| a.state())
            .unwrap_or_default()
    }
}

/// Neighbor-lifecycle notifications, emitted under the registry lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborhoodEvent {
    NewNeighbor(Presence),
    NeighborhoodChanged,
    ProtocolStarted {
        address: LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
    },
    ProtocolStopped {
        address: LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
    },
}
