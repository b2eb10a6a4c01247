// Store module: content items, scoped handles and the in-memory store

pub mod backend;
pub mod content;

pub use backend::{MemoryContentStore, DEFAULT_FEED_CAPACITY};
pub use content::{
    unix_millis, ContentEvent, ContentFilter, ContentHandle, ContentId, ContentItem,
    ContentStore, HandleRelease, StoreError,
};
