//! Per-session dissemination engine.
//!
//! Each established push session gets two tasks:
//! - the feed task loads the initial candidates from the store and then applies
//!   content-change notifications in the order they arrive;
//! - the pick task announces our profile, then repeatedly picks a candidate and
//!   sends it, suspending only while the candidate set is empty.
//!
//! Teardown interrupts both tasks, drains the candidate set and releases every
//! handle still held. An item in flight at teardown is released, never requeued.

use super::candidates::{Admission, CandidateSet};
use super::score::{ScoreModel, SessionScorer};
use crate::config::PushConfig;
use crate::store::{
    unix_millis, ContentEvent, ContentFilter, ContentHandle, ContentId, ContentItem, ContentStore,
    StoreError,
};
use crate::transport::{
    LinkAddress, LocalProfile, ProtocolId, SessionId, TransportCommand, TransportError,
    TransportSession, TransportType,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stable per-peer identifier used for "never resend to this peer"
pub fn interface_id(address: &LinkAddress, protocol: ProtocolId) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(address.as_str().as_bytes());
    hasher.update(&[0u8]);
    hasher.update(protocol.0.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Report from an engine whose transport failed
#[derive(Debug, Clone)]
pub struct BrokenSession {
    pub address: LinkAddress,
    pub protocol: ProtocolId,
    pub session: SessionId,
    pub reason: TransportError,
}

/// An established session handed to the push service
#[derive(Clone)]
pub struct SessionBinding {
    pub address: LinkAddress,
    pub protocol: ProtocolId,
    pub session: SessionId,
    pub transport: TransportType,
    pub link: Arc<dyn TransportSession>,
}

/// Collaborators shared by every engine of a node
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn ContentStore>,
    pub feed: broadcast::Sender<ContentEvent>,
    pub model: ScoreModel,
    pub profile: LocalProfile,
    pub settings: PushConfig,
    pub broken: mpsc::UnboundedSender<BrokenSession>,
}

/// State shared between the engine handle and its two tasks
struct Shared {
    label: String,
    candidates: Mutex<CandidateSet>,
    not_empty: Notify,
    interests: RwLock<Vec<String>>,
    model: ScoreModel,
    store: Arc<dyn ContentStore>,
    sent: AtomicU64,
    resyncs: AtomicU64,
}

impl Shared {
    fn score_now(&self, item: &ContentItem) -> f32 {
        let interests = self.interests.read();
        self.model.score(item, unix_millis(), &interests)
    }

    /// Fetch and offer one item to the candidate set
    fn admit(&self, id: ContentId, filter: &ContentFilter) {
        let handle = match self.store.fetch(id) {
            Ok(handle) => handle,
            Err(StoreError::NotFound(_)) => {
                debug!("[{}] stale reference to {}, skipped", self.label, id);
                return;
            }
        };
        if !filter.accepts_group(&handle.group_id) {
            return;
        }
        let score = self.score_now(&handle);

        let mut set = self.candidates.lock();
        let was_empty = set.is_empty();
        match set.insert(handle, score) {
            Admission::Admitted => {
                if was_empty {
                    self.not_empty.notify_one();
                }
            }
            Admission::BelowThreshold => {
                debug!("[{}] {} below threshold ({:.3})", self.label, id, score)
            }
            Admission::AlreadyPresent => {}
        }
    }

    fn evict(&self, id: ContentId) {
        if let Some(handle) = self.candidates.lock().remove(id) {
            debug!("[{}] {} deleted, evicted", self.label, id);
            drop(handle);
        }
    }

    /// Reconcile the candidate set with the store after missed notifications
    fn resync(&self, filter: &ContentFilter) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        let ids = self.store.query(filter);
        let wanted: HashSet<ContentId> = ids.iter().copied().collect();
        let held = self.candidates.lock().ids();
        for id in held.into_iter().filter(|id| !wanted.contains(id)) {
            self.evict(id);
        }
        for id in ids {
            if !self.candidates.lock().contains(id) {
                self.admit(id, filter);
            }
        }
        self.candidates.lock().mark_stale();
    }

    /// Suspend until a candidate can be picked
    async fn next_candidate(&self) -> ContentHandle {
        loop {
            let picked = {
                let mut set = self.candidates.lock();
                let interests = self.interests.read();
                let scorer = SessionScorer {
                    model: &self.model,
                    store: self.store.as_ref(),
                    now_ms: unix_millis(),
                    interests: &interests,
                };
                let mut rng = rand::thread_rng();
                set.pick(&mut rng, &scorer)
            };
            match picked {
                Some(handle) => return handle,
                None => self.not_empty.notified().await,
            }
        }
    }
}

pub struct DisseminationEngine {
    address: LinkAddress,
    protocol: ProtocolId,
    session: SessionId,
    peer_interface: String,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DisseminationEngine {
    /// Start the engine of one session on `runtime`
    pub fn start(binding: SessionBinding, deps: EngineDeps, runtime: &Handle) -> Arc<Self> {
        let peer_interface = interface_id(&binding.address, binding.protocol);
        let label = format!("{}/{}", binding.address, binding.session);
        let shared = Arc::new(Shared {
            label: label.clone(),
            candidates: Mutex::new(CandidateSet::new(deps.settings.threshold)),
            not_empty: Notify::new(),
            interests: RwLock::new(Vec::new()),
            model: deps.model.clone(),
            store: deps.store.clone(),
            sent: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        });
        let (shutdown, _) = watch::channel(false);

        let filter = ContentFilter {
            groups: deps.profile.groups.clone(),
            never_sent_to: Some(peer_interface.clone()),
        };
        // subscribe before the initial load so nothing falls in between
        let feed_rx = deps.feed.subscribe();
        let feed_task = runtime.spawn(feed_loop(
            shared.clone(),
            filter,
            feed_rx,
            shutdown.subscribe(),
        ));

        let pick_task = runtime.spawn(pick_loop(
            shared.clone(),
            PickContext {
                link: binding.link.clone(),
                profile: deps.profile.clone(),
                peer_interface: peer_interface.clone(),
                interval: match deps.settings.send_interval_ms {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                },
                broken: deps.broken.clone(),
                address: binding.address.clone(),
                protocol: binding.protocol,
                session: binding.session,
            },
            shutdown.subscribe(),
        ));

        info!("[{}] push engine started over {}", label, binding.transport);
        Arc::new(Self {
            address: binding.address,
            protocol: binding.protocol,
            session: binding.session,
            peer_interface,
            shared,
            shutdown,
            tasks: Mutex::new(vec![feed_task, pick_task]),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn peer_interface(&self) -> &str {
        &self.peer_interface
    }

    /// Items currently waiting to be pushed
    pub fn pending(&self) -> usize {
        self.shared.candidates.lock().len()
    }

    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Times the feed task rebuilt its candidates after missing notifications
    pub fn resyncs(&self) -> u64 {
        self.shared.resyncs.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Interests announced by the peer; they drive the relevance component
    pub fn set_peer_interests(&self, interests: Vec<String>) {
        *self.shared.interests.write() = interests;
        self.shared.candidates.lock().mark_stale();
    }

    /// Stop both tasks and release every handle. Returns the number released.
    pub async fn stop(&self) -> usize {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[{}/{}] engine task ended abnormally: {}", self.address, self.session, e);
            }
        }

        let drained = self.shared.candidates.lock().drain();
        let released = drained.len();
        drop(drained);
        info!(
            "[{}/{}] push engine stopped after {} sends, released {} handles",
            self.address,
            self.session,
            self.sent(),
            released
        );
        released
    }
}

impl Drop for DisseminationEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn feed_loop(
    shared: Arc<Shared>,
    filter: ContentFilter,
    mut feed: broadcast::Receiver<ContentEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    for id in shared.store.query(&filter) {
        if *shutdown.borrow() {
            return;
        }
        shared.admit(id, &filter);
    }
    debug!(
        "[{}] initial load: {} candidates",
        shared.label,
        shared.candidates.lock().len()
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = feed.recv() => match event {
                Ok(ContentEvent::Inserted(id)) => shared.admit(id, &filter),
                Ok(ContentEvent::Deleted(id)) => shared.evict(id),
                Err(RecvError::Lagged(missed)) => {
                    warn!("[{}] content feed lagged by {} events, resyncing", shared.label, missed);
                    shared.resync(&filter);
                }
                Err(RecvError::Closed) => {
                    debug!("[{}] content feed closed", shared.label);
                    break;
                }
            },
        }
    }
}

struct PickContext {
    link: Arc<dyn TransportSession>,
    profile: LocalProfile,
    peer_interface: String,
    interval: Option<Duration>,
    broken: mpsc::UnboundedSender<BrokenSession>,
    address: LinkAddress,
    protocol: ProtocolId,
    session: SessionId,
}

impl PickContext {
    fn report(&self, reason: TransportError) {
        warn!("[{}/{}] send failed: {}", self.address, self.session, reason);
        let _ = self.broken.send(BrokenSession {
            address: self.address.clone(),
            protocol: self.protocol,
            session: self.session,
            reason,
        });
    }
}

async fn pick_loop(shared: Arc<Shared>, ctx: PickContext, mut shutdown: watch::Receiver<bool>) {
    let announce = ctx
        .link
        .send(TransportCommand::SendLocalInformation(ctx.profile.clone()));
    tokio::select! {
        _ = shutdown.changed() => return,
        result = announce => {
            if let Err(e) = result {
                ctx.report(e);
                return;
            }
        }
    }

    loop {
        let handle = tokio::select! {
            _ = shutdown.changed() => break,
            handle = shared.next_candidate() => handle,
        };

        let id = handle.id();
        let item = shared
            .store
            .snapshot(id)
            .unwrap_or_else(|| handle.item().clone());
        let command = TransportCommand::PushContent(item);
        let result = tokio::select! {
            // the in-flight handle is released on the way out
            _ = shutdown.changed() => break,
            result = ctx.link.send(command) => result,
        };

        match result {
            Ok(()) => {
                shared.store.record_delivery(id, &ctx.peer_interface);
                shared.sent.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] pushed {}", shared.label, id);
                drop(handle);
            }
            Err(e) => {
                drop(handle);
                ctx.report(e);
                break;
            }
        }

        if let Some(interval) = ctx.interval {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::score::{DensityTable, ScoreWeights};
    use crate::store::MemoryContentStore;
    use async_trait::async_trait;

    /// Session that records what it is asked to send
    struct RecordingLink {
        sent: Mutex<Vec<TransportCommand>>,
        fail_pushes: bool,
    }

    impl RecordingLink {
        fn new(fail_pushes: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_pushes,
            })
        }

        fn pushed(&self) -> Vec<ContentId> {
            self.sent
                .lock()
                .iter()
                .filter_map(|c| match c {
                    TransportCommand::PushContent(item) => Some(item.id),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl TransportSession for RecordingLink {
        async fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
            if self.fail_pushes && matches!(command, TransportCommand::PushContent(_)) {
                return Err(TransportError::SendFailed("radio off".to_string()));
            }
            self.sent.lock().push(command);
            Ok(())
        }
    }

    /// Session whose pushes never complete
    struct StalledLink;

    #[async_trait]
    impl TransportSession for StalledLink {
        async fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
            if let TransportCommand::PushContent(_) = command {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    /// Session that never completes any send, so nothing is ever picked
    struct MuteLink;

    #[async_trait]
    impl TransportSession for MuteLink {
        async fn send(&self, _command: TransportCommand) -> Result<(), TransportError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn deps(
        store: &MemoryContentStore,
        settings: PushConfig,
    ) -> (EngineDeps, mpsc::UnboundedReceiver<BrokenSession>) {
        let (broken, broken_rx) = mpsc::unbounded_channel();
        let deps = EngineDeps {
            store: Arc::new(store.clone()),
            feed: store.feed(),
            model: ScoreModel::new(ScoreWeights::default(), Arc::new(DensityTable::new(0.5))),
            profile: LocalProfile {
                name: "node-a".to_string(),
                interests: vec![],
                groups: vec!["public".to_string()],
            },
            settings,
            broken,
        };
        (deps, broken_rx)
    }

    fn binding(link: Arc<dyn TransportSession>) -> SessionBinding {
        SessionBinding {
            address: LinkAddress::new("BB:01"),
            protocol: crate::transport::PUSH_PROTOCOL,
            session: SessionId::new(),
            transport: TransportType::Local,
            link,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_interface_id_is_stable_and_distinct() {
        let a = LinkAddress::new("AA:01");
        let b = LinkAddress::new("AA:02");
        let p = crate::transport::PUSH_PROTOCOL;
        assert_eq!(interface_id(&a, p), interface_id(&a, p));
        assert_ne!(interface_id(&a, p), interface_id(&b, p));
        assert_eq!(interface_id(&a, p).len(), 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_pushes_everything_then_waits() {
        let store = MemoryContentStore::new();
        for i in 0..5 {
            store.insert(ContentItem::new("alice", "public", format!("post {}", i)));
        }
        let link = RecordingLink::new(false);
        let (deps, _broken) = deps(&store, PushConfig::default());
        let engine = DisseminationEngine::start(binding(link.clone()), deps, &Handle::current());

        wait_until(|| link.pushed().len() == 5).await;
        assert!(matches!(
            link.sent.lock().first(),
            Some(TransportCommand::SendLocalInformation(_))
        ));

        // new content wakes the suspended pick loop
        let late = ContentItem::new("bob", "public", "late post");
        let late_id = late.id;
        store.insert(late);
        wait_until(|| link.pushed().contains(&late_id)).await;

        // delivered items are remembered for this peer
        wait_until(|| store.was_delivered(late_id, engine.peer_interface())).await;
        wait_until(|| engine.sent() == 6).await;

        engine.stop().await;
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.double_releases(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_other_groups_are_not_pushed() {
        let store = MemoryContentStore::new();
        store.insert(ContentItem::new("alice", "private", "secret"));
        let public = ContentItem::new("alice", "public", "hello");
        let public_id = public.id;
        store.insert(public);

        let link = RecordingLink::new(false);
        let (deps, _broken) = deps(&store, PushConfig::default());
        let engine = DisseminationEngine::start(binding(link.clone()), deps, &Handle::current());

        wait_until(|| link.pushed().len() == 1).await;

        // live notifications go through the same group filter
        store.insert(ContentItem::new("carol", "private", "also secret"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.pushed(), vec![public_id]);
        assert_eq!(engine.pending(), 0);
        engine.stop().await;
        assert_eq!(store.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_failure_reports_broken_session() {
        let store = MemoryContentStore::new();
        store.insert(ContentItem::new("alice", "public", "hello"));
        let link = RecordingLink::new(true);
        let (deps, mut broken) = deps(&store, PushConfig::default());
        let b = binding(link.clone());
        let session = b.session;
        let engine = DisseminationEngine::start(b, deps, &Handle::current());

        let report = tokio::time::timeout(Duration::from_secs(2), broken.recv())
            .await
            .expect("report in time")
            .expect("channel open");
        assert_eq!(report.session, session);
        assert!(matches!(report.reason, TransportError::SendFailed(_)));

        engine.stop().await;
        assert_eq!(store.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_releases_pending_and_in_flight_handles() {
        let store = MemoryContentStore::new();
        for i in 0..10 {
            store.insert(ContentItem::new("alice", "public", format!("post {}", i)));
        }
        let (deps, _broken) = deps(&store, PushConfig::default());
        let engine =
            DisseminationEngine::start(binding(Arc::new(StalledLink)), deps, &Handle::current());

        // one handle stuck in send, nine waiting
        wait_until(|| store.acquisitions() == 10 && engine.pending() == 9).await;
        assert_eq!(store.outstanding(), 10);

        let released = engine.stop().await;
        assert_eq!(released, 9);
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.releases(), 10);
        assert_eq!(store.double_releases(), 0);

        // stopping twice is harmless
        assert_eq!(engine.stop().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deleted_content_is_evicted() {
        let store = MemoryContentStore::new();
        let mut settings = PushConfig::default();
        settings.send_interval_ms = 60_000;
        let (deps, _broken) = deps(&store, settings);
        let link = RecordingLink::new(false);
        let engine = DisseminationEngine::start(binding(link.clone()), deps, &Handle::current());

        // the first push happens immediately, the interval holds back the rest
        let first = ContentItem::new("alice", "public", "first");
        store.insert(first);
        wait_until(|| link.pushed().len() == 1).await;

        let doomed = ContentItem::new("alice", "public", "doomed");
        let doomed_id = doomed.id;
        store.insert(doomed);
        wait_until(|| engine.pending() == 1).await;

        store.delete(doomed_id);
        wait_until(|| engine.pending() == 0).await;
        assert_eq!(store.outstanding(), 0);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_content_is_never_admitted() {
        let store = MemoryContentStore::new();
        store.insert(
            ContentItem::new("alice", "public", "old news")
                .with_created_at_ms(1_000)
                .with_ttl_ms(10),
        );
        let link = RecordingLink::new(false);
        let (deps, _broken) = deps(&store, PushConfig::default());
        let engine = DisseminationEngine::start(binding(link.clone()), deps, &Handle::current());

        wait_until(|| store.acquisitions() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(link.pushed().is_empty());
        assert_eq!(engine.pending(), 0);
        assert_eq!(store.outstanding(), 0);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_notification_for_missing_item_is_skipped() {
        let store = MemoryContentStore::new();
        let link = RecordingLink::new(false);
        let (deps, _broken) = deps(&store, PushConfig::default());
        let feed = deps.feed.clone();
        let engine = DisseminationEngine::start(binding(link.clone()), deps, &Handle::current());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the item was gone before the engine got to fetch it
        feed.send(ContentEvent::Inserted(ContentId::new())).unwrap();
        let real = ContentItem::new("alice", "public", "still here");
        let real_id = real.id;
        store.insert(real);

        wait_until(|| link.pushed() == vec![real_id]).await;
        assert_eq!(engine.pending(), 0);
        assert_eq!(store.acquisitions(), 1);

        engine.stop().await;
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.double_releases(), 0);
    }

    #[tokio::test]
    async fn test_lagged_feed_resyncs_with_store() {
        let store = MemoryContentStore::with_feed_capacity(1);
        let (deps, _broken) = deps(&store, PushConfig::default());
        let engine =
            DisseminationEngine::start(binding(Arc::new(MuteLink)), deps, &Handle::current());

        // let the feed task finish its (empty) initial load
        tokio::time::sleep(Duration::from_millis(20)).await;

        // no await in between: the single-slot feed overflows
        let mut ids = Vec::new();
        for i in 0..50 {
            let item = ContentItem::new("alice", "public", format!("post {}", i));
            ids.push(item.id);
            store.insert(item);
        }
        for id in &ids[..20] {
            store.delete(*id);
        }

        wait_until(|| engine.pending() == 30 && engine.resyncs() >= 1).await;
        assert_eq!(store.outstanding(), 30);
        assert_eq!(store.double_releases(), 0);

        assert_eq!(engine.stop().await, 30);
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.double_releases(), 0);
    }
}
