//! Neighborhood registry.
//!
//! Single authority for "who is reachable". Every mutation and every snapshot goes
//! through one registry-wide lock; lifecycle events are broadcast while that lock is
//! held so subscribers never see them reordered. Adapters are only ever called after
//! the lock has been released.

use super::arbiter::{ConnectionArbiter, ConnectionState, InboundVerdict, StateError};
use super::{Neighbor, NeighborhoodEvent, SessionEntry};
use crate::transport::{
    LinkAddress, LinkLayerAdapter, Presence, ProtocolId, SessionId, TransportError, TransportType,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default capacity of the neighborhood event feed
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown neighbor: {0}")]
    NotFound(LinkAddress),

    #[error("No {protocol} session with {address}")]
    SessionNotFound {
        address: LinkAddress,
        protocol: ProtocolId,
    },

    #[error("Connection state error: {0}")]
    State(#[from] StateError),
}

/// A session that depended on a transport being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub address: LinkAddress,
    pub protocol: ProtocolId,
    pub session: SessionId,
}

pub struct NeighborhoodRegistry {
    local: LinkAddress,
    neighbors: Mutex<HashMap<LinkAddress, Neighbor>>,
    adapters: RwLock<HashMap<TransportType, Arc<dyn LinkLayerAdapter>>>,
    events: broadcast::Sender<NeighborhoodEvent>,
}

impl NeighborhoodRegistry {
    pub fn new(local: LinkAddress) -> Self {
        Self::with_event_capacity(local, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(local: LinkAddress, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            local,
            neighbors: Mutex::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn local_address(&self) -> &LinkAddress {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NeighborhoodEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NeighborhoodEvent) {
        // no subscriber is not an error
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------

    /// Register the adapter owning a transport, replacing any previous one
    pub fn register_adapter(
        &self,
        adapter: Arc<dyn LinkLayerAdapter>,
    ) -> Option<Arc<dyn LinkLayerAdapter>> {
        let transport = adapter.transport();
        info!("Link-layer adapter registered: {}", transport);
        self.adapters.write().insert(transport, adapter)
    }

    pub fn adapter(&self, transport: TransportType) -> Result<Arc<dyn LinkLayerAdapter>, TransportError> {
        self.adapters
            .read()
            .get(&transport)
            .cloned()
            .ok_or(TransportError::AdapterNotFound(transport))
    }

    pub fn adapters(&self) -> Vec<Arc<dyn LinkLayerAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Presences
    // ------------------------------------------------------------------

    /// Record that a neighbor was observed through `presence.transport`.
    ///
    /// Returns the neighbor as it stands after the update. When the presence set
    /// changed and `autoconnect` is set, the owning adapter is asked to connect.
    pub fn upsert(&self, presence: Presence, autoconnect: bool) -> Neighbor {
        let (neighbor, changed) = {
            let mut neighbors = self.neighbors.lock();
            let changed = match neighbors.get_mut(&presence.address) {
                Some(existing) => {
                    existing.last_seen = presence.observed_at;
                    if existing.presences.contains_key(&presence.transport) {
                        false
                    } else {
                        existing.presences.insert(presence.transport, presence.clone());
                        true
                    }
                }
                None => {
                    neighbors.insert(presence.address.clone(), Neighbor::new(&presence));
                    info!("New neighbor {} via {}", presence.address, presence.transport);
                    true
                }
            };
            if changed {
                self.emit(NeighborhoodEvent::NewNeighbor(presence.clone()));
            }
            let neighbor = match neighbors.get(&presence.address) {
                Some(n) => n.clone(),
                None => Neighbor::new(&presence),
            };
            (neighbor, changed)
        };

        if changed && autoconnect {
            match self.adapter(presence.transport) {
                Ok(adapter) => {
                    if let Err(e) = adapter.connect_to(&presence, autoconnect) {
                        warn!("Autoconnect to {} failed: {}", presence.address, e);
                    }
                }
                Err(e) => warn!("Cannot autoconnect to {}: {}", presence.address, e),
            }
        }
        neighbor
    }

    /// Forget one transport's observation of a neighbor.
    ///
    /// Returns true when the neighbor is no longer observed by any transport.
    pub fn drop_presence(
        &self,
        address: &LinkAddress,
        transport: TransportType,
    ) -> Result<bool, RegistryError> {
        let mut neighbors = self.neighbors.lock();
        let neighbor = neighbors
            .get_mut(address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;

        neighbor.presences.remove(&transport);
        if neighbor.presences.is_empty() {
            info!("Neighbor {} disappeared", address);
            self.emit(NeighborhoodEvent::NeighborhoodChanged);
            Ok(true)
        } else {
            debug!(
                "Neighbor {} lost on {}, still seen on {:?}",
                address,
                transport,
                neighbor.transports()
            );
            Ok(false)
        }
    }

    /// Remove a transport's presence from every neighbor.
    ///
    /// Returns the sessions that ran over that transport; the caller tears them down.
    pub fn drop_transport(&self, transport: TransportType) -> Vec<SessionRef> {
        let mut neighbors = self.neighbors.lock();
        let mut affected = Vec::new();
        let mut touched = 0usize;

        for neighbor in neighbors.values_mut() {
            if neighbor.presences.remove(&transport).is_some() {
                touched += 1;
            }
            for (protocol, entry) in &neighbor.sessions {
                if entry.transport == transport {
                    affected.push(SessionRef {
                        address: neighbor.address.clone(),
                        protocol: *protocol,
                        session: entry.id,
                    });
                }
            }
        }

        info!(
            "Transport {} dropped: {} presences, {} sessions affected",
            transport,
            touched,
            affected.len()
        );
        self.emit(NeighborhoodEvent::NeighborhoodChanged);
        affected
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn add_session(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
        transport: TransportType,
    ) -> Result<bool, RegistryError> {
        let mut neighbors = self.neighbors.lock();
        let neighbor = neighbors
            .get_mut(address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;

        if let Some(existing) = neighbor.sessions.get(&protocol) {
            debug!(
                "{} already has a {} session ({}), ignoring {}",
                address, protocol, existing.id, session
            );
            return Ok(false);
        }
        neighbor.sessions.insert(
            protocol,
            SessionEntry {
                id: session,
                transport,
            },
        );
        info!("Protocol {} started with {} ({})", protocol, address, session);
        self.emit(NeighborhoodEvent::NeighborhoodChanged);
        self.emit(NeighborhoodEvent::ProtocolStarted {
            address: address.clone(),
            protocol,
            session,
        });
        Ok(true)
    }

    pub fn remove_session(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
    ) -> Result<bool, RegistryError> {
        let mut neighbors = self.neighbors.lock();
        let neighbor = neighbors
            .get_mut(address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;

        match neighbor.sessions.get(&protocol) {
            Some(entry) if entry.id == session => {}
            _ => return Ok(false),
        }
        neighbor.sessions.remove(&protocol);

        if let Some(arbiter) = neighbor.arbiters.get_mut(&protocol) {
            if arbiter.state() == ConnectionState::Connected(session) {
                // cannot fail: the state was just checked
                let _ = arbiter.session_closed(session);
            }
        }

        info!("Protocol {} stopped with {} ({})", protocol, address, session);
        self.emit(NeighborhoodEvent::NeighborhoodChanged);
        self.emit(NeighborhoodEvent::ProtocolStopped {
            address: address.clone(),
            protocol,
            session,
        });
        Ok(true)
    }

    pub fn session(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
    ) -> Result<SessionEntry, RegistryError> {
        let neighbors = self.neighbors.lock();
        let neighbor = neighbors
            .get(address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;
        neighbor
            .session(protocol)
            .ok_or_else(|| RegistryError::SessionNotFound {
                address: address.clone(),
                protocol,
            })
    }

    // ------------------------------------------------------------------
    // Connection arbitration
    // ------------------------------------------------------------------

    fn with_arbiter<T>(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        f: impl FnOnce(&mut ConnectionArbiter) -> Result<T, StateError>,
    ) -> Result<T, RegistryError> {
        let mut neighbors = self.neighbors.lock();
        let neighbor = neighbors
            .get_mut(address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;
        let arbiter = neighbor.arbiters.entry(protocol).or_default();
        f(arbiter).map_err(|e| {
            debug!("{} / {}: {}", address, protocol, e);
            RegistryError::State(e)
        })
    }

    pub fn begin_dial(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        outgoing: SessionId,
    ) -> Result<(), RegistryError> {
        self.with_arbiter(address, protocol, |arbiter| arbiter.begin_dial(outgoing))
    }

    pub fn resolve_inbound(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        inbound: SessionId,
    ) -> Result<InboundVerdict, RegistryError> {
        let local = &self.local;
        let verdict = self.with_arbiter(address, protocol, |arbiter| {
            Ok(arbiter.resolve_inbound(local, address, inbound))
        })?;
        match verdict {
            InboundVerdict::Refuse => {
                debug!("Refused inbound {} session {} from {}", protocol, inbound, address)
            }
            InboundVerdict::AcceptAndCancel { outgoing } => info!(
                "Inbound {} session {} from {} wins the race, cancelling dial {}",
                protocol, inbound, address, outgoing
            ),
            InboundVerdict::Accept => {}
        }
        Ok(verdict)
    }

    pub fn dial_succeeded(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        outgoing: SessionId,
    ) -> Result<(), RegistryError> {
        self.with_arbiter(address, protocol, |arbiter| arbiter.dial_succeeded(outgoing))
    }

    pub fn dial_failed(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        outgoing: SessionId,
    ) -> Result<(), RegistryError> {
        self.with_arbiter(address, protocol, |arbiter| arbiter.dial_failed(outgoing))
    }

    pub fn connection_state(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
    ) -> Result<ConnectionState, RegistryError> {
        let neighbors = self.neighbors.lock();
        neighbors
            .get(address)
            .map(|n| n.connection_state(protocol))
            .ok_or_else(|| RegistryError::NotFound(address.clone()))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn lookup(&self, address: &LinkAddress) -> Result<Neighbor, RegistryError> {
        self.neighbors
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(address.clone()))
    }

    /// Neighbors with at least one presence, ordered by address
    pub fn list_reachable(&self) -> Vec<Neighbor> {
        let mut reachable: Vec<Neighbor> = self
            .neighbors
            .lock()
            .values()
            .filter(|n| n.is_reachable())
            .cloned()
            .collect();
        reachable.sort_by(|a, b| a.address.cmp(&b.address));
        reachable
    }

    /// Every neighbor ever seen, reachable or not
    pub fn history(&self) -> Vec<Neighbor> {
        let mut all: Vec<Neighbor> = self.neighbors.lock().values().cloned().collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }
}
