// Push service: one dissemination engine per established push session

use super::engine::{DisseminationEngine, EngineDeps, SessionBinding};
use crate::transport::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub struct PushService {
    deps: EngineDeps,
    runtime: Handle,
    engines: Mutex<HashMap<SessionId, Arc<DisseminationEngine>>>,
}

impl PushService {
    pub fn new(deps: EngineDeps, runtime: Handle) -> Self {
        Self {
            deps,
            runtime,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Start an engine for a freshly established session.
    /// Returns false if the session already has one.
    pub fn bind(&self, binding: SessionBinding) -> bool {
        let mut engines = self.engines.lock();
        if engines.contains_key(&binding.session) {
            warn!("Session {} with {} is already bound", binding.session, binding.address);
            return false;
        }
        let session = binding.session;
        let engine = DisseminationEngine::start(binding, self.deps.clone(), &self.runtime);
        engines.insert(session, engine);
        true
    }

    /// Stop and forget the engine of a session
    pub async fn unbind(&self, session: SessionId) -> bool {
        let engine = self.engines.lock().remove(&session);
        match engine {
            Some(engine) => {
                engine.stop().await;
                true
            }
            None => {
                debug!("No push engine bound to session {}", session);
                false
            }
        }
    }

    pub fn update_interests(&self, session: SessionId, interests: Vec<String>) -> bool {
        match self.engine(session) {
            Some(engine) => {
                engine.set_peer_interests(interests);
                true
            }
            None => false,
        }
    }

    pub fn engine(&self, session: SessionId) -> Option<Arc<DisseminationEngine>> {
        self.engines.lock().get(&session).cloned()
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.engines.lock().keys().copied().collect()
    }

    /// Total items pushed by the engines currently bound
    pub fn total_sent(&self) -> u64 {
        self.engines.lock().values().map(|e| e.sent()).sum()
    }

    /// Stop every engine. Returns the number of handles released.
    pub async fn shutdown(&self) -> usize {
        let engines: Vec<Arc<DisseminationEngine>> =
            self.engines.lock().drain().map(|(_, e)| e).collect();
        let count = engines.len();
        let released: usize = futures::future::join_all(engines.iter().map(|e| e.stop()))
            .await
            .into_iter()
            .sum();
        info!("Push service stopped {} engines, released {} handles", count, released);
        released
    }
}
