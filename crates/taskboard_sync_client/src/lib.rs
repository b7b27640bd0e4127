//! # Taskboard Sync Client
//!
//! Client-side reconciliation for Taskboard real-time sync.
//!
//! This crate provides:
//! - Optimistic local edits with at most one pending edit per entity
//! - Reconciliation of pending edits against server updates and responses
//! - Resync requests built from the last revision seen per topic
//! - Retry with exponential backoff for `unavailable` responses
//! - A notification inbox
//! - Transport abstraction (`SyncTransport`)
//!
//! ## Architecture
//!
//! The client never resolves conflicts on its own. The server is
//! authoritative: when a pending edit loses, the local change is dropped
//! and the caller gets a conflict notice carrying the winning state.
//!
//! The client does no I/O of its own. Outbound frames go through a
//! [`SyncTransport`]; inbound frames are fed to
//! [`ReconciliationClient::handle_message`] by whoever owns the socket.
//!
//! ## Key Invariants
//!
//! - Cached versions never go backwards
//! - A discarded or rolled-back edit is never re-sent
//! - Creates with an unknown outcome are not retried

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod client;
mod config;
mod error;
mod transport;

pub use client::{ClientEvent, PendingOptimisticEdit, ReconciliationClient};
pub use config::{ClientConfig, RetryConfig};
pub use error::{ClientError, ClientResult};
pub use transport::{ChannelTransport, MockTransport, SyncTransport};
