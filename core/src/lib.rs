// meshcast core: neighborhood tracking, connection arbitration and epidemic push
//
// A node discovers neighbors over one or more link layers, keeps at most one
// session per neighbor and protocol, and pushes the most valuable pending content
// to each connected peer.

pub mod config;
pub mod coordinator;
pub mod neighborhood;
pub mod push;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use config::{AdapterConfig, ConfigError, MeshConfig, PushConfig};
pub use coordinator::NetworkCoordinator;
pub use neighborhood::{
    ConnectionState, InboundVerdict, Neighbor, NeighborhoodEvent, NeighborhoodRegistry,
    RegistryError, StateError,
};
pub use push::{
    DensityTable, DisseminationEngine, PushService, ScoreModel, ScoreSource, ScoreWeights,
};
pub use store::{
    ContentEvent, ContentFilter, ContentHandle, ContentId, ContentItem, ContentStore,
    MemoryContentStore, StoreError,
};
pub use transport::{
    LinkAddress, LinkLayerAdapter, LocalAdapter, LocalMedium, LocalProfile, Presence, ProtocolId,
    SessionId, TransportCommand, TransportError, TransportSession, TransportType, PUSH_PROTOCOL,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No Tokio runtime available")]
    NoRuntime,
}
