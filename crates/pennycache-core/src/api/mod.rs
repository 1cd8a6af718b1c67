//! Remote store access for the PennyPilot backend.
//!
//! This module provides the `RemoteStore` trait the cache layer fetches
//! through, and `ApiClient`, its REST implementation. Records are scoped per
//! user under `users/{uid}/{collection}`.
//!
//! Requests carry the signed-in user's ID token as a bearer token.

pub mod client;
pub mod error;
pub mod remote;

pub use client::ApiClient;
pub use error::ApiError;
pub use remote::{ListParams, RemoteStore};
