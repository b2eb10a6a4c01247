//! Network coordinator.
//!
//! The explicitly constructed context object of a node. It owns the neighborhood
//! registry, the link-layer adapters and the push service, and turns link-layer
//! notifications (presence observed/lost, dials, inbound connections, session loss)
//! into registry mutations and engine lifecycle changes.

use crate::config::MeshConfig;
use crate::neighborhood::{
    InboundVerdict, Neighbor, NeighborhoodEvent, NeighborhoodRegistry, RegistryError,
};
use crate::push::{
    BrokenSession, DisseminationEngine, EngineDeps, PushService, ScoreModel, ScoreSource,
    SessionBinding,
};
use crate::store::{ContentEvent, ContentStore};
use crate::transport::{
    LinkAddress, LinkLayerAdapter, LocalProfile, Presence, ProtocolId, SessionId, TransportError,
    TransportSession, TransportType, PUSH_PROTOCOL,
};
use crate::MeshError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

struct LiveSession {
    address: LinkAddress,
    protocol: ProtocolId,
    link: Arc<dyn TransportSession>,
}

pub struct NetworkCoordinator {
    config: MeshConfig,
    registry: NeighborhoodRegistry,
    push: PushService,
    runtime: Handle,
    links: Mutex<HashMap<SessionId, LiveSession>>,
    broken_rx: Mutex<Option<mpsc::UnboundedReceiver<BrokenSession>>>,
}

impl NetworkCoordinator {
    /// Build a coordinator on the current Tokio runtime
    pub fn new(
        local_address: impl Into<LinkAddress>,
        config: MeshConfig,
        store: Arc<dyn ContentStore>,
        feed: broadcast::Sender<ContentEvent>,
        scores: Arc<dyn ScoreSource>,
    ) -> Result<Arc<Self>, MeshError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| MeshError::NoRuntime)?;

        let (broken_tx, broken_rx) = mpsc::unbounded_channel();
        let deps = EngineDeps {
            store,
            feed,
            model: ScoreModel::new(config.push.weights, scores),
            profile: LocalProfile {
                name: config.local_name.clone(),
                interests: config.interests.clone(),
                groups: config.groups.clone(),
            },
            settings: config.push.clone(),
            broken: broken_tx,
        };

        let local_address = local_address.into();
        info!("Coordinator for {} ({}) created", local_address, config.local_name);
        Ok(Arc::new(Self {
            registry: NeighborhoodRegistry::new(local_address),
            push: PushService::new(deps, runtime.clone()),
            runtime,
            config,
            links: Mutex::new(HashMap::new()),
            broken_rx: Mutex::new(Some(broken_rx)),
        }))
    }

    pub fn local_address(&self) -> &LinkAddress {
        self.registry.local_address()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn registry(&self) -> &NeighborhoodRegistry {
        &self.registry
    }

    pub fn push(&self) -> &PushService {
        &self.push
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NeighborhoodEvent> {
        self.registry.subscribe()
    }

    // ------------------------------------------------------------------
    // Link layers
    // ------------------------------------------------------------------

    pub fn register_adapter(&self, adapter: Arc<dyn LinkLayerAdapter>) {
        if let Some(previous) = self.registry.register_adapter(adapter) {
            warn!("Replaced adapter for {}", previous.transport());
        }
    }

    /// Start a registered adapter. Link layers disabled in the config are refused.
    pub fn start_adapter(&self, transport: TransportType) -> Result<(), MeshError> {
        if !self.config.adapters.enables(transport) {
            warn!("Link layer {} is disabled, not starting it", transport);
            return Err(TransportError::AdapterDisabled(transport).into());
        }
        let adapter = self.registry.adapter(transport)?;
        adapter.start()?;
        info!("Link layer {} started", transport);
        Ok(())
    }

    /// Stop an adapter and tear down every session that ran over it.
    /// Returns the number of sessions torn down.
    pub async fn stop_adapter(&self, transport: TransportType) -> Result<usize, MeshError> {
        let adapter = self.registry.adapter(transport)?;
        adapter.stop();
        let affected = self.registry.drop_transport(transport);
        let count = affected.len();
        for s in affected {
            self.session_lost(&s.address, s.protocol, s.session).await;
        }
        info!("Link layer {} stopped, {} sessions closed", transport, count);
        Ok(count)
    }

    pub fn is_link_layer_enabled(&self, transport: TransportType) -> bool {
        self.registry
            .adapter(transport)
            .map(|a| a.is_active())
            .unwrap_or(false)
    }

    pub fn is_scanning(&self) -> bool {
        self.registry.adapters().iter().any(|a| a.is_scanning())
    }

    /// Ask every active adapter to run a discovery pass
    pub fn force_scan(&self) {
        for adapter in self.registry.adapters() {
            if adapter.is_active() {
                debug!("Forcing discovery on {}", adapter.transport());
                adapter.force_discovery();
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub fn neighbor_observed(&self, presence: Presence, autoconnect: bool) -> Neighbor {
        self.registry.upsert(presence, autoconnect)
    }

    /// Returns true when the neighbor is no longer reachable at all
    pub fn neighbor_lost(
        &self,
        address: &LinkAddress,
        transport: TransportType,
    ) -> Result<bool, MeshError> {
        self.registry.drop_presence(address, transport).map_err(|e| {
            warn!("Presence loss for {}: {}", address, e);
            e.into()
        })
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.registry.list_reachable()
    }

    pub fn neighbor(&self, address: &LinkAddress) -> Result<Neighbor, MeshError> {
        Ok(self.registry.lookup(address)?)
    }

    pub fn history(&self) -> Vec<Neighbor> {
        self.registry.history()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn begin_dial(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
    ) -> Result<(), MeshError> {
        self.registry.begin_dial(address, protocol, session)?;
        debug!("Dialing {} for {} ({})", address, protocol, session);
        Ok(())
    }

    /// Our dial was accepted by the remote end
    pub fn dial_established(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
        transport: TransportType,
        link: Arc<dyn TransportSession>,
    ) -> Result<(), MeshError> {
        self.registry.dial_succeeded(address, protocol, session)?;
        self.admit_session(address, protocol, session, transport, link)
    }

    pub fn dial_failed(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
    ) -> Result<(), MeshError> {
        self.registry.dial_failed(address, protocol, session)?;
        debug!("Dial {} to {} failed", session, address);
        Ok(())
    }

    /// A neighbor is connecting to us. The presence is recorded first, then the
    /// connection race (if any) is arbitrated.
    pub fn inbound_connection(
        &self,
        presence: Presence,
        protocol: ProtocolId,
        session: SessionId,
        link: Arc<dyn TransportSession>,
    ) -> Result<InboundVerdict, MeshError> {
        let address = presence.address.clone();
        let transport = presence.transport;
        self.registry.upsert(presence, false);

        let verdict = self.registry.resolve_inbound(&address, protocol, session)?;
        if let InboundVerdict::AcceptAndCancel { outgoing } = verdict {
            match self.registry.adapter(transport) {
                Ok(adapter) => adapter.cancel_dial(outgoing),
                Err(e) => warn!("Cannot cancel dial {}: {}", outgoing, e),
            }
        }
        if verdict.is_accepted() {
            self.admit_session(&address, protocol, session, transport, link)?;
        }
        Ok(verdict)
    }

    fn admit_session(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
        transport: TransportType,
        link: Arc<dyn TransportSession>,
    ) -> Result<(), MeshError> {
        if !self.registry.add_session(address, protocol, session, transport)? {
            warn!("{} session {} with {} not admitted", protocol, session, address);
            link.close();
            return Ok(());
        }
        self.links.lock().insert(
            session,
            LiveSession {
                address: address.clone(),
                protocol,
                link: link.clone(),
            },
        );

        if protocol == PUSH_PROTOCOL {
            self.push.bind(SessionBinding {
                address: address.clone(),
                protocol,
                session,
                transport,
                link,
            });
        }
        Ok(())
    }

    /// Tear a session down: registry entry, engine and link.
    /// Returns false when the session was already gone.
    pub async fn session_lost(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        session: SessionId,
    ) -> bool {
        let removed = match self.registry.remove_session(address, protocol, session) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Session loss for {}: {}", address, e);
                false
            }
        };
        self.push.unbind(session).await;
        let live = self.links.lock().remove(&session);
        if let Some(live) = live {
            live.link.close();
        }
        if removed {
            info!("Session {} with {} lost", session, address);
        }
        removed
    }

    /// The peer announced its profile on an established session
    pub fn peer_preferences(
        &self,
        address: &LinkAddress,
        protocol: ProtocolId,
        profile: LocalProfile,
    ) -> Result<(), MeshError> {
        let entry = self.registry.session(address, protocol)?;
        debug!(
            "{} ({}) announced {} interests",
            address,
            profile.name,
            profile.interests.len()
        );
        if !self.push.update_interests(entry.id, profile.interests) {
            return Err(RegistryError::SessionNotFound {
                address: address.clone(),
                protocol,
            }
            .into());
        }
        Ok(())
    }

    pub fn engine(&self, session: SessionId) -> Option<Arc<DisseminationEngine>> {
        self.push.engine(session)
    }

    /// Drain broken-session reports into `session_lost` until shutdown is signalled
    pub async fn run_until_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        let receiver = self.broken_rx.lock().take();
        let Some(mut broken) = receiver else {
            warn!("Broken-session reports are already being consumed");
            return;
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                report = broken.recv() => match report {
                    Some(report) => {
                        debug!("Session {} broke: {}", report.session, report.reason);
                        self.session_lost(&report.address, report.protocol, report.session).await;
                    }
                    None => break,
                },
            }
        }
        *self.broken_rx.lock() = Some(broken);
    }

    /// Stop every engine, close every link and stop every adapter
    pub async fn shutdown(&self) {
        let released = self.push.shutdown().await;
        let links: Vec<(SessionId, LiveSession)> = self.links.lock().drain().collect();
        for (session, live) in &links {
            if let Err(e) = self.registry.remove_session(&live.address, live.protocol, *session) {
                debug!("Closing {}: {}", session, e);
            }
            live.link.close();
        }
        for adapter in self.registry.adapters() {
            adapter.stop();
        }
        info!(
            "Coordinator {} shut down: {} links closed, {} handles released",
            self.local_address(),
            links.len(),
            released
        );
    }
}
