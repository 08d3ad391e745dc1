//! Pixelflow Cache Library
//!
//! Storage tiers and caching policy for the resource loading engine: a
//! byte-budgeted in-memory LRU, a content-addressed disk cache, the disk cache
//! strategy decision table, memory categories and engine configuration.

pub mod config;
pub mod disk;
pub mod key;
pub mod lru;
pub mod memory;
pub mod strategy;

pub use config::{ConfigError, EngineConfig};
pub use disk::{DiskCache, DiskCacheError, DiskCacheStats, DiskLruCache, DiskWriter};
pub use key::{digest_bytes, digest_str, DiskKey, ObjectKey};
pub use lru::{CacheStats, EvictionListener, LruCache, Weighted};
pub use memory::{MemoryCategory, MemoryPressure, TrimAction, TrimLevel};
pub use strategy::{DataSource, DiskCacheStrategy, EncodeStrategy};

/// Re-exported so downstream keys can implement [`DiskKey`] without a direct dependency.
pub use sha2::Sha256;
