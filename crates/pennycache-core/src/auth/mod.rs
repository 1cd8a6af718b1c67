//! Session state for the signed-in user.
//!
//! This module provides:
//! - `Session`: the saved sign-in (user id and ID token), persisted to disk
//! - `SessionProvider`: the observable current user that queries, mutations
//!   and the cache lifecycle key off
//!
//! Signing in itself is out of scope; a session is produced elsewhere and
//! handed to this crate.

pub mod provider;
pub mod session;

pub use provider::{HookId, SessionProvider};
pub use session::{Session, SessionData};
