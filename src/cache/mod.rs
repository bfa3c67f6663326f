//! Generic caching layer for offline support.
//!
//! This module provides an entity-agnostic cache that:
//! - Keeps one durable JSON file and one in-memory snapshot per entity type
//! - Classifies data as fresh or expired by a wall-clock TTL
//! - Discards data written under a different schema version
//! - Serves stale data when the network is unavailable

mod offline;
mod storage;
mod traits;

pub use offline::{CacheSettings, OfflineCache};
pub use storage::{CacheError, CacheWrapper};
pub use traits::{now_millis, CacheMetadata, CacheResult, CacheSource, Cacheable};
