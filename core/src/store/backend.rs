// In-memory content store with handle accounting

use super::content::{
    ContentEvent, ContentFilter, ContentHandle, ContentId, ContentItem, ContentStore,
    HandleRelease, StoreError,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default capacity of the content-change feed
pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct HandleLedger {
    outstanding: HashMap<ContentId, usize>,
    acquired: u64,
    released: u64,
    double_releases: u64,
}

struct Inner {
    items: RwLock<HashMap<ContentId, Arc<ContentItem>>>,
    delivered: RwLock<HashMap<ContentId, HashSet<String>>>,
    handles: Mutex<HandleLedger>,
    feed: broadcast::Sender<ContentEvent>,
}

impl HandleRelease for Inner {
    fn release(&self, id: ContentId) {
        let mut ledger = self.handles.lock();
        match ledger.outstanding.get_mut(&id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    ledger.outstanding.remove(&id);
                }
                ledger.released += 1;
            }
            _ => {
                ledger.double_releases += 1;
                warn!("Release of content {} without an outstanding handle", id);
            }
        }
    }
}

/// In-memory content store useful for testing and simulations.
///
/// Every fetch and every release is counted, so tests can assert that handles are
/// neither leaked nor released twice.
#[derive(Clone)]
pub struct MemoryContentStore {
    inner: Arc<Inner>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(HashMap::new()),
                delivered: RwLock::new(HashMap::new()),
                handles: Mutex::new(HandleLedger::default()),
                feed,
            }),
        }
    }

    /// Sender side of the content-change feed
    pub fn feed(&self) -> broadcast::Sender<ContentEvent> {
        self.inner.feed.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.inner.feed.subscribe()
    }

    /// Store an item. A replica of a known item only bumps its duplicate counter.
    /// Returns true if the item was new.
    pub fn insert(&self, item: ContentItem) -> bool {
        let id = item.id;
        {
            let mut items = self.inner.items.write();
            if let Some(existing) = items.get_mut(&id) {
                Arc::make_mut(existing).duplicates += 1;
                debug!("Duplicate of content {} received", id);
                return false;
            }
            items.insert(id, Arc::new(item));
        }
        let _ = self.inner.feed.send(ContentEvent::Inserted(id));
        true
    }

    pub fn delete(&self, id: ContentId) -> bool {
        let removed = self.inner.items.write().remove(&id).is_some();
        if removed {
            self.inner.delivered.write().remove(&id);
            let _ = self.inner.feed.send(ContentEvent::Deleted(id));
        }
        removed
    }

    pub fn like(&self, id: ContentId) -> bool {
        let mut items = self.inner.items.write();
        match items.get_mut(&id) {
            Some(item) => {
                Arc::make_mut(item).likes += 1;
                true
            }
            None => false,
        }
    }

    /// Uncounted read access, for inspection only
    pub fn get(&self, id: ContentId) -> Option<Arc<ContentItem>> {
        self.inner.items.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn was_delivered(&self, id: ContentId, peer: &str) -> bool {
        self.inner
            .delivered
            .read()
            .get(&id)
            .map(|peers| peers.contains(peer))
            .unwrap_or(false)
    }

    /// Handles currently held outside the store
    pub fn outstanding(&self) -> usize {
        self.inner.handles.lock().outstanding.values().sum()
    }

    pub fn acquisitions(&self) -> u64 {
        self.inner.handles.lock().acquired
    }

    pub fn releases(&self) -> u64 {
        self.inner.handles.lock().released
    }

    pub fn double_releases(&self) -> u64 {
        self.inner.handles.lock().double_releases
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore for MemoryContentStore {
    fn query(&self, filter: &ContentFilter) -> Vec<ContentId> {
        let items = self.inner.items.read();
        let delivered = self.inner.delivered.read();
        let mut matching: Vec<&Arc<ContentItem>> = items
            .values()
            .filter(|item| filter.accepts_group(&item.group_id))
            .filter(|item| match &filter.never_sent_to {
                Some(peer) => !delivered
                    .get(&item.id)
                    .map(|peers| peers.contains(peer))
                    .unwrap_or(false),
                None => true,
            })
            .collect();
        matching.sort_by_key(|item| (item.created_at_ms, item.id));
        matching.into_iter().map(|item| item.id).collect()
    }

    fn fetch(&self, id: ContentId) -> Result<ContentHandle, StoreError> {
        let item = self
            .inner
            .items
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;

        {
            let mut ledger = self.inner.handles.lock();
            *ledger.outstanding.entry(id).or_insert(0) += 1;
            ledger.acquired += 1;
        }

        let releaser: Arc<dyn HandleRelease> = self.inner.clone();
        Ok(ContentHandle::new(item, releaser))
    }

    fn snapshot(&self, id: ContentId) -> Option<Arc<ContentItem>> {
        self.get(id)
    }

    fn record_delivery(&self, id: ContentId, peer: &str) {
        if !self.inner.items.read().contains_key(&id) {
            return;
        }
        self.inner
            .delivered
            .write()
            .entry(id)
            .or_default()
            .insert(peer.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(group: &str) -> ContentItem {
        ContentItem::new("alice", group, "hello mesh")
    }

    #[test]
    fn test_insert_and_fetch() {
        let store = MemoryContentStore::new();
        let it = item("public");
        let id = it.id;

        assert!(store.insert(it));
        let handle = store.fetch(id).expect("item should exist");
        assert_eq!(handle.body, "hello mesh");
        assert_eq!(store.outstanding(), 1);

        drop(handle);
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.acquisitions(), 1);
        assert_eq!(store.releases(), 1);
        assert_eq!(store.double_releases(), 0);
    }

    #[test]
    fn test_fetch_unknown_is_not_found() {
        let store = MemoryContentStore::new();
        let id = ContentId::new();
        assert_eq!(store.fetch(id).unwrap_err(), StoreError::NotFound(id));
        assert_eq!(store.acquisitions(), 0);
    }

    #[test]
    fn test_duplicate_insert_counts_duplicates() {
        let store = MemoryContentStore::new();
        let it = item("public");
        let id = it.id;

        assert!(store.insert(it.clone()));
        assert!(!store.insert(it.clone()));
        assert!(!store.insert(it));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().duplicates, 2);
    }

    #[test]
    fn test_like_updates_item() {
        let store = MemoryContentStore::new();
        let it = item("public");
        let id = it.id;
        store.insert(it);

        assert!(store.like(id));
        assert!(store.like(id));
        assert_eq!(store.get(id).unwrap().likes, 2);
        assert!(!store.like(ContentId::new()));
    }

    #[test]
    fn test_query_filters_by_group_and_delivery() {
        let store = MemoryContentStore::new();
        let public = item("public");
        let private = item("private");
        let delivered = item("public");
        let (public_id, delivered_id) = (public.id, delivered.id);

        store.insert(public);
        store.insert(private);
        store.insert(delivered);
        store.record_delivery(delivered_id, "peer-1");

        let filter = ContentFilter {
            groups: vec!["public".to_string()],
            never_sent_to: Some("peer-1".to_string()),
        };
        assert_eq!(store.query(&filter), vec![public_id]);

        let other_peer = ContentFilter {
            groups: vec!["public".to_string()],
            never_sent_to: Some("peer-2".to_string()),
        };
        assert_eq!(store.query(&other_peer).len(), 2);
        assert!(store.was_delivered(delivered_id, "peer-1"));
    }

    #[test]
    fn test_feed_publishes_insert_and_delete() {
        let store = MemoryContentStore::new();
        let mut rx = store.subscribe();
        let it = item("public");
        let id = it.id;

        store.insert(it);
        assert!(store.delete(id));
        assert!(!store.delete(id));

        assert_eq!(rx.try_recv().unwrap(), ContentEvent::Inserted(id));
        assert_eq!(rx.try_recv().unwrap(), ContentEvent::Deleted(id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_sees_updates_made_after_fetch() {
        let store = MemoryContentStore::new();
        let it = item("public");
        let id = it.id;
        store.insert(it.clone());

        let handle = store.fetch(id).unwrap();
        store.insert(it);
        store.like(id);

        let current = store.snapshot(id).unwrap();
        assert_eq!((current.likes, current.duplicates), (1, 1));
        assert_eq!((handle.likes, handle.duplicates), (0, 0));
        assert_eq!(store.acquisitions(), 1);

        drop(handle);
        store.delete(id);
        assert!(store.snapshot(id).is_none());
    }

    #[test]
    fn test_handle_outlives_deletion() {
        let store = MemoryContentStore::new();
        let it = item("public");
        let id = it.id;
        store.insert(it);

        let handle = store.fetch(id).unwrap();
        store.delete(id);
        assert_eq!(handle.body, "hello mesh");
        drop(handle);

        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.double_releases(), 0);
    }

    #[test]
    fn test_unmatched_release_is_counted() {
        let store = MemoryContentStore::new();
        store.inner.release(ContentId::new());
        assert_eq!(store.double_releases(), 1);
    }
}
