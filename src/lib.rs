//! Offline-first data layer for field-sales clients: a per-entity-type
//! offline cache with TTL and schema versioning, and a durable queue that
//! synchronizes local mutations with the remote service.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod handlers;
pub mod logging;
pub mod sync;
pub mod telemetry;
