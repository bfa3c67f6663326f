//! Remote service collaborator.

mod client;
mod types;

pub use client::{RemoteApi, RemoteClient};
pub use types::{ApiError, ApiRequest, RequestBody};
