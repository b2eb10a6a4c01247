//! Content items, scoped handles and the content store capability.
//!
//! The store is the sole owner of item bodies. Everything else holds a
//! [`ContentHandle`], which hands itself back to the store when dropped, so a handle
//! is released exactly once on every exit path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Mesh-wide identifier of a content item; every replica carries the same id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(Uuid);

impl ContentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// A status/post disseminated through the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub author: String,
    pub group_id: String,
    pub body: String,
    pub tags: Vec<String>,
    pub likes: u32,
    /// How many times a replica of this item has been received again
    pub duplicates: u32,
    /// Creation time, milliseconds since the UNIX epoch
    pub created_at_ms: u64,
    /// Time to live in milliseconds (0 = never expires)
    pub ttl_ms: u64,
}

impl ContentItem {
    pub fn new(author: impl Into<String>, group_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: ContentId::new(),
            author: author.into(),
            group_id: group_id.into(),
            body: body.into(),
            tags: Vec::new(),
            likes: 0,
            duplicates: 0,
            created_at_ms: unix_millis(),
            ttl_ms: 0,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_created_at_ms(mut self, created_at_ms: u64) -> Self {
        self.created_at_ms = created_at_ms;
        self
    }
}

/// Errors returned by a content store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Content not found: {0}")]
    NotFound(ContentId),
}

/// Content-change notifications published by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEvent {
    Inserted(ContentId),
    Deleted(ContentId),
}

/// Peer-specific selection rules applied when a session loads its candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentFilter {
    /// Only items of these groups (empty = any group)
    pub groups: Vec<String>,
    /// Skip items already delivered to this peer interface
    pub never_sent_to: Option<String>,
}

impl ContentFilter {
    pub fn accepts_group(&self, group_id: &str) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| g == group_id)
    }
}

/// Receives handles coming back from their holders
pub trait HandleRelease: Send + Sync {
    fn release(&self, id: ContentId);
}

/// Owned, non-clonable reference to a stored item. Dropping it releases it.
pub struct ContentHandle {
    item: Arc<ContentItem>,
    releaser: Arc<dyn HandleRelease>,
}

impl ContentHandle {
    pub fn new(item: Arc<ContentItem>, releaser: Arc<dyn HandleRelease>) -> Self {
        Self { item, releaser }
    }

    pub fn id(&self) -> ContentId {
        self.item.id
    }

    pub fn item(&self) -> &Arc<ContentItem> {
        &self.item
    }
}

impl Deref for ContentHandle {
    type Target = ContentItem;

    fn deref(&self) -> &ContentItem {
        &self.item
    }
}

impl Drop for ContentHandle {
    fn drop(&mut self) {
        self.releaser.release(self.item.id);
    }
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHandle").field("id", &self.item.id).finish()
    }
}

/// Capability interface of the persistent content store
pub trait ContentStore: Send + Sync {
    fn query(&self, filter: &ContentFilter) -> Vec<ContentId>;

    fn fetch(&self, id: ContentId) -> Result<ContentHandle, StoreError>;

    /// Current state of an item without taking a handle. Likes and duplicates
    /// counted after a fetch show up here, not in the fetched handle.
    fn snapshot(&self, id: ContentId) -> Option<Arc<ContentItem>>;

    fn release(&self, handle: ContentHandle) {
        drop(handle);
    }

    /// Remember that `id` reached `peer`, so later sessions can skip it
    fn record_delivery(&self, _id: ContentId, _peer: &str) {}
}

/// Milliseconds since the UNIX epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
