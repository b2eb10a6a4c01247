//! In-process link layer.
//!
//! Nodes attached to the same [`LocalMedium`] can discover and dial each other
//! without any radio. Dials go through the same arbitration as real transports, so
//! simultaneous discovery on both ends exercises the connection race.

use super::abstraction::{
    LinkAddress, LinkLayerAdapter, Presence, SessionId, TransportCommand, TransportError,
    TransportSession, TransportType, PUSH_PROTOCOL,
};
use crate::coordinator::NetworkCoordinator;
use crate::neighborhood::InboundVerdict;
use crate::store::MemoryContentStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A command received from a neighbor over a local session
#[derive(Debug, Clone)]
pub struct Received {
    pub from: LinkAddress,
    pub session: SessionId,
    pub command: TransportCommand,
}

/// Shared "air" between local adapters
#[derive(Default)]
pub struct LocalMedium {
    nodes: RwLock<BTreeMap<LinkAddress, Weak<LocalAdapter>>>,
}

impl LocalMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, adapter: &Arc<LocalAdapter>) {
        self.nodes
            .write()
            .insert(adapter.address.clone(), Arc::downgrade(adapter));
    }

    pub fn detach(&self, address: &LinkAddress) {
        self.nodes.write().remove(address);
    }

    pub fn node(&self, address: &LinkAddress) -> Option<Arc<LocalAdapter>> {
        self.nodes.read().get(address).and_then(Weak::upgrade)
    }

    pub fn addresses(&self) -> Vec<LinkAddress> {
        self.nodes.read().keys().cloned().collect()
    }
}

pub struct LocalAdapter {
    address: LinkAddress,
    medium: Arc<LocalMedium>,
    coordinator: Weak<NetworkCoordinator>,
    runtime: Handle,
    me: Weak<LocalAdapter>,
    active: AtomicBool,
    scanning: AtomicBool,
    /// Outgoing dials not yet completed nor cancelled
    pending: Mutex<HashSet<SessionId>>,
    inbox: mpsc::UnboundedSender<Received>,
}

impl LocalAdapter {
    /// Attach a coordinator to the medium and register the adapter with it.
    ///
    /// The returned receiver yields everything neighbors send to this node.
    pub fn attach(
        medium: &Arc<LocalMedium>,
        coordinator: &Arc<NetworkCoordinator>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Received>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let adapter = Arc::new_cyclic(|me| Self {
            address: coordinator.local_address().clone(),
            medium: medium.clone(),
            coordinator: Arc::downgrade(coordinator),
            runtime: coordinator.runtime().clone(),
            me: me.clone(),
            active: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
            pending: Mutex::new(HashSet::new()),
            inbox,
        });
        medium.attach(&adapter);
        coordinator.register_adapter(adapter.clone());
        (adapter, rx)
    }

    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    fn deliver(&self, received: Received) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::AdapterInactive(TransportType::Local));
        }
        self.inbox
            .send(received)
            .map_err(|_| TransportError::SessionClosed)
    }

    /// The other end closed `session`
    fn link_closed(&self, from: LinkAddress, session: SessionId) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            coordinator.session_lost(&from, PUSH_PROTOCOL, session).await;
        });
    }

    /// Inbound connection attempt from `from`
    fn accept(
        &self,
        from: &LinkAddress,
        session: SessionId,
        link: Arc<dyn TransportSession>,
    ) -> Result<InboundVerdict, TransportError> {
        if !self.is_active() {
            return Err(TransportError::AdapterInactive(TransportType::Local));
        }
        let coordinator = self
            .coordinator
            .upgrade()
            .ok_or_else(|| TransportError::ConnectionFailed("node is gone".to_string()))?;
        coordinator
            .inbound_connection(
                Presence::new(from.clone(), TransportType::Local),
                PUSH_PROTOCOL,
                session,
                link,
            )
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    async fn dial(self: Arc<Self>, remote: Arc<LocalAdapter>, session: SessionId) {
        // give a dial racing from the other end the chance to start
        tokio::task::yield_now().await;

        let closed = Arc::new(AtomicBool::new(false));
        let ours = Arc::new(LocalSession {
            local: self.address.clone(),
            session,
            peer: Arc::downgrade(&remote),
            closed: closed.clone(),
        });
        let theirs = Arc::new(LocalSession {
            local: remote.address.clone(),
            session,
            peer: self.me.clone(),
            closed,
        });

        let verdict = remote.accept(&self.address, session, theirs);
        let still_pending = self.pending.lock().remove(&session);
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        let target = remote.address.clone();

        match verdict {
            Ok(v) if v.is_accepted() && still_pending => {
                if let Err(e) = coordinator.dial_established(
                    &target,
                    PUSH_PROTOCOL,
                    session,
                    TransportType::Local,
                    ours.clone(),
                ) {
                    debug!("Dial {} to {} completed too late: {}", session, target, e);
                    ours.close();
                }
            }
            Ok(v) => {
                if v.is_accepted() {
                    // cancelled while the remote end was accepting
                    ours.close();
                }
                debug!("Dial {} to {} not kept ({:?})", session, target, v);
                if let Err(e) = coordinator.dial_failed(&target, PUSH_PROTOCOL, session) {
                    debug!("Dial {} cleanup: {}", session, e);
                }
            }
            Err(e) => {
                debug!("Dial {} to {} failed: {}", session, target, e);
                if let Err(e) = coordinator.dial_failed(&target, PUSH_PROTOCOL, session) {
                    debug!("Dial {} cleanup: {}", session, e);
                }
            }
        }
    }
}

impl LinkLayerAdapter for LocalAdapter {
    fn transport(&self) -> TransportType {
        TransportType::Local
    }

    fn start(&self) -> Result<(), TransportError> {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("Local link layer up at {}", self.address);
        }
        Ok(())
    }

    fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.pending.lock().clear();
            info!("Local link layer down at {}", self.address);
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn force_discovery(&self) {
        if !self.is_active() {
            return;
        }
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        self.scanning.store(true, Ordering::SeqCst);
        for address in self.medium.addresses() {
            if address == self.address {
                continue;
            }
            let visible = self
                .medium
                .node(&address)
                .map(|n| n.is_active())
                .unwrap_or(false);
            if visible {
                coordinator.neighbor_observed(Presence::new(address, TransportType::Local), true);
            }
        }
        self.scanning.store(false, Ordering::SeqCst);
    }

    fn connect_to(&self, presence: &Presence, _autoconnect: bool) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::AdapterInactive(TransportType::Local));
        }
        let remote = self
            .medium
            .node(&presence.address)
            .filter(|n| n.is_active())
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("{} is not on the medium", presence.address))
            })?;
        let coordinator = self
            .coordinator
            .upgrade()
            .ok_or_else(|| TransportError::ConnectionFailed("node is gone".to_string()))?;
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::ConnectionFailed("adapter is gone".to_string()))?;

        let session = SessionId::new();
        self.pending.lock().insert(session);
        if let Err(e) = coordinator.begin_dial(&presence.address, PUSH_PROTOCOL, session) {
            self.pending.lock().remove(&session);
            return Err(TransportError::ConnectionFailed(e.to_string()));
        }
        self.runtime.spawn(me.dial(remote, session));
        Ok(())
    }

    fn cancel_dial(&self, session: SessionId) {
        if self.pending.lock().remove(&session) {
            debug!("Dial {} cancelled", session);
        }
    }
}

/// One end of an in-process session
pub struct LocalSession {
    /// Address of the end owning this half
    local: LinkAddress,
    session: SessionId,
    peer: Weak<LocalAdapter>,
    /// Shared by both halves
    closed: Arc<AtomicBool>,
}

impl LocalSession {
    pub fn id(&self) -> SessionId {
        self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for LocalSession {
    async fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let peer = self.peer.upgrade().ok_or(TransportError::SessionClosed)?;
        peer.deliver(Received {
            from: self.local.clone(),
            session: self.session,
            command,
        })?;
        tokio::task::yield_now().await;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(peer) = self.peer.upgrade() {
            peer.link_closed(self.local.clone(), self.session);
        }
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Apply what neighbors send: content goes into `store`, profiles to the coordinator.
/// Runs until every sender is gone; returns the number of new items stored.
pub async fn pump_inbox(
    mut inbox: mpsc::UnboundedReceiver<Received>,
    coordinator: Weak<NetworkCoordinator>,
    store: MemoryContentStore,
) -> usize {
    let mut stored = 0;
    while let Some(received) = inbox.recv().await {
        match received.command {
            TransportCommand::PushContent(item) => {
                if store.insert(item.as_ref().clone()) {
                    stored += 1;
                }
            }
            TransportCommand::SendLocalInformation(profile) => {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.peer_preferences(&received.from, PUSH_PROTOCOL, profile) {
                    debug!("Profile from {} not applied: {}", received.from, e);
                }
            }
        }
    }
    stored
}
