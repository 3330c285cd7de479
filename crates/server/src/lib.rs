//! HTTP gateway for git-hosted datasets.
//!
//! This crate provides:
//! - Branch/commit resolution with canonical redirects
//! - Access control over users and permalink share tokens
//! - Sync orchestration on top of the git worker
//! - The event ledger with named snapshots
//! - Operator endpoints for status, sync and events

pub mod access;
pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod query;
pub mod reader;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod sync;
pub mod versions;

pub use access::{AccessResolver, Requester};
pub use auth::TraceId;
pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, Collaborators};
