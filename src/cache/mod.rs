//! In-memory caches.

pub mod lru;

pub use lru::LruCache;
