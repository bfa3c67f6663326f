//! Durable queue of pending mutations and the machinery that sends them.
//!
//! Mutations are enqueued through [`SyncManager`], persisted as job rows and
//! executed in the background by [`SyncWorker`] attempts. The entity-specific
//! steps of an attempt are supplied by a [`SyncHandler`] registered for the
//! entity type.

mod conflict;
pub(crate) mod handler;
mod manager;
mod multipart;
mod queue;
mod types;
mod worker;

pub use conflict::{
  classify_conflict, ConflictClassifier, DUPLICATE_TOKEN, INSUFFICIENT_STOCK_TOKEN,
};
pub use handler::{
  AttemptOutcome, DynSyncHandler, HandlerRegistry, SyncHandler, SyncRequest,
};
pub use manager::SyncManager;
pub use multipart::{FilePart, MultipartRequest, MultipartRequestBuilder, FILE_FIELD, JSON_FIELD};
pub use queue::{JobStore, SyncJob};
pub use types::{
  Conflict, ConflictType, JobState, OperationKind, RetryPolicy, SyncConfig, SyncContext,
  SyncFailure, SyncOperation, SyncResult,
};
pub use worker::{resolve, SyncWorker, WorkerOutcome};
