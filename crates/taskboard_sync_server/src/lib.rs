//! # Taskboard Sync Server
//!
//! Real-time synchronization core for Taskboard.
//!
//! This crate provides:
//! - `EntityStore`, the adapter trait for the durable store, and an
//!   in-memory implementation
//! - `VersionLedger`, the authoritative per-entity version cache with
//!   compare-and-set and write-through
//! - `MutationService` (propose, create, delete)
//! - `ConnectionRegistry` and `Broadcaster` for topic-scoped fan-out
//!   over per-connection queues
//! - `NotificationDispatcher`, per-user notification queues
//! - A newline-delimited JSON transport over TCP
//!
//! # Architecture
//!
//! Every state change flows through the mutation service and the ledger;
//! every observation flows out as an `update` frame. Conflicting edits are
//! never merged or resolved by last-writer-wins: the losing caller gets a
//! `conflict` carrying the current state.
//!
//! # Ordering
//!
//! - Versions of one entity are strictly increasing
//! - Each connection receives its messages in the order they were enqueued
//! - An accepted mutation is enqueued to subscribers under its entity lock,
//!   so no subscriber sees version N after N+1
//!
//! A connection that cannot keep up is dropped and resyncs on reconnect;
//! nothing else is affected.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod fanout;
mod ledger;
mod listener;
mod mutation;
mod notifications;
mod registry;
mod server;
mod session;
mod store;

pub use config::ServerConfig;
pub use error::{SyncError, SyncResult};
pub use fanout::{Broadcaster, FanoutReport};
pub use ledger::{MutationEvent, VersionLedger};
pub use listener::{handle_connection, serve};
pub use mutation::{structural_topics, update_topics, MutationService, Outcome};
pub use notifications::{NotificationDispatcher, NotificationEvent};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{MaintenanceReport, SyncServer};
pub use session::Session;
pub use store::{EntityStore, MemoryEntityStore, StoreError, StoreResult};
