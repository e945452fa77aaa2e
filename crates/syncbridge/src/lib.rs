//! # syncbridge - CRUD services over replicated Automerge partitions
//!
//! syncbridge keeps ordinary record stores ("source services") in step with
//! Automerge documents. Records are grouped into *partitions*, one document
//! per query, listed in a replicated *root catalog*. Changes flow both ways:
//! a service mutation is written into every partition that should hold the
//! record, and a partition change (local or replicated from a peer) is
//! applied back to the service.
//!
//! ## Features
//!
//! - **Offline-first**: partitions live on local disk and merge on reconnect
//! - **Automatic conflict resolution**: Automerge merges concurrent edits
//! - **No echo**: every write carries a change tag so it is applied at most
//!   once on each side
//! - **Pluggable partitioning**: a [`SyncStrategy`] decides what goes where
//!   and who may see it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use syncbridge::{
//!     Config, MemoryService, QueryMatchStrategy, RootCatalog, ServiceRegistry, Store, SyncEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> syncbridge::Result<()> {
//!     let config = Config::new("/path/to/storage");
//!     let store = Arc::new(Store::new(&config)?);
//!     let root = RootCatalog::load_or_create(&store, &config).await?;
//!
//!     let todos = Arc::new(MemoryService::new("id"));
//!     let services = ServiceRegistry::new().with("todos", todos.clone())?;
//!     let strategy = Arc::new(QueryMatchStrategy::new(services.clone()));
//!     let engine = SyncEngine::start(Arc::clone(&store), root, services, strategy, &config).await?;
//!
//!     // One partition holding alice's todos
//!     let query = json!({"username": "alice"}).as_object().cloned().unwrap_or_default();
//!     let entry = engine.create(query, None).await?;
//!     println!("partition {}", entry.url);
//!
//!     engine.shutdown().await;
//!     store.flush().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Configuration
//! - [`doc`]: Document handles, urls and change notifications
//! - [`store`]: Local persistence for documents
//! - [`catalog`]: The root catalog of partitions
//! - [`partition`]: Partition layout and change tags on records
//! - [`service`]: The source service interface and stock implementations
//! - [`strategy`]: Partitioning and access hooks
//! - [`engine`]: The sync engine tying all of the above together
//! - [`auth`]: Authentication hooks for the hub/spoke link
//! - [`error`]: Error types and Result alias
//!
//! ## Internal Modules
//!
//! - [`sync`]: Replication protocol
//! - [`tag`]: Change tag values

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]

// =============================================================================
// Public modules - stable API
// =============================================================================

pub mod auth;
pub mod catalog;
pub mod config;
pub mod doc;
pub mod engine;
pub mod error;
pub mod partition;
pub mod service;
pub mod store;
pub mod strategy;

// =============================================================================
// Internal modules - not part of stable API
// =============================================================================

#[doc(hidden)]
pub mod sync;

#[doc(hidden)]
pub mod tag;

// =============================================================================
// Public re-exports - the primary public API
// =============================================================================

pub use auth::{AccessTokenProvider, Authenticator, StaticToken};
pub use catalog::{CatalogEntry, Query, RootCatalog};
pub use config::Config;
pub use doc::{DocChange, Document, DocumentUrl};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use service::{
    DocumentService, EventContext, EventKind, MemoryService, ServiceBacking, ServiceEvent,
    ServiceRegistry, SourceService,
};
pub use store::Store;
pub use strategy::{Caller, QueryMatchStrategy, SyncStrategy};
pub use tag::ChangeTag;

// =============================================================================
// Constants
// =============================================================================

/// Default interval between flushes of dirty documents to disk, in seconds.
///
/// Can be configured via [`Config::with_flush_interval`].
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 1;

/// Default limit on authentication and token calls, in seconds.
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;

/// Default number of change tags and pending removals remembered.
pub const DEFAULT_TRACKING_CAPACITY: usize = 65_536;

/// Default lifetime of a remembered tag or pending removal, in seconds.
pub const DEFAULT_TRACKING_TTL_SECS: u64 = 600;

/// Default capacity of broadcast channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
