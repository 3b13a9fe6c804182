//! Generic client-side query cache.
//!
//! This module knows nothing about posts or users. It provides:
//! - Typed keys grouped by tag, with exact, tag-wide and global invalidation
//! - Cache-first reads with one in-flight load per key
//! - Mutations that invalidate only after the backend call succeeds
//! - Cursor-paged entries for "load more" feeds

mod layer;
mod pages;
mod storage;
mod traits;

pub use layer::QueryCache;
pub use pages::{InfinitePages, NextPage};
pub use storage::{CacheStorage, CachedEntry, EntryState, MemoryStorage, NoopStorage};
pub use traits::{CacheResult, CacheSource, Cacheable, Identified, KeyPattern, QueryKey};
