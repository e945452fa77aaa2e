//! Source services.
//!
//! A source service is a CRUD record store that announces every mutation as a
//! [`ServiceEvent`]. The engine bridges these events into partition documents
//! and applies replicated document changes back through the same interface.
//!
//! Provided implementations:
//!
//! - [`MemoryService`] - records in memory, for tests and demos
//! - [`DocumentService`] - records read from and written to one partition map
//! - [`ServiceBacking`] - either of the above behind one interface

pub mod backing;
pub mod document;
pub mod memory;
pub mod query;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::catalog::Query;
use crate::error::{Error, Result};
use crate::partition::META_KEY;
use crate::tag::ChangeTag;

pub use backing::{BackingKind, ServiceBacking};
pub use document::DocumentService;
pub use memory::MemoryService;

/// Page sizes used when `find` paginates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page size when the query has no `$limit`.
    pub default: usize,
    /// Largest page a query may ask for.
    pub max: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            default: 10,
            max: 10,
        }
    }
}

/// Kind of mutation announced by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A record was created.
    Created,
    /// A record was replaced.
    Updated,
    /// A record was partially modified.
    Patched,
    /// A record was removed.
    Removed,
}

/// Extra data travelling with a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// Tag of the document change that caused this mutation, if any.
    pub change_tag: Option<ChangeTag>,
    /// Set when the mutation seeds a service from a freshly bound partition.
    pub initial_sync: bool,
}

impl EventContext {
    /// Context carrying `tag`.
    #[must_use]
    pub fn tagged(tag: Option<ChangeTag>) -> Self {
        Self {
            change_tag: tag,
            initial_sync: false,
        }
    }
}

/// A mutation announced by a service.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// What happened.
    pub kind: EventKind,
    /// The record after the mutation, or the removed record.
    pub record: Value,
    /// Context passed to the mutating call.
    pub context: EventContext,
}

/// Options for [`SourceService::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindParams {
    /// Apply the service's [`Pagination`]. When false every match is returned.
    pub paginate: bool,
}

impl FindParams {
    /// Return one page.
    #[must_use]
    pub const fn paginated() -> Self {
        Self { paginate: true }
    }

    /// Return every match.
    #[must_use]
    pub const fn all() -> Self {
        Self { paginate: false }
    }
}

impl Default for FindParams {
    fn default() -> Self {
        Self::paginated()
    }
}

/// Result of [`SourceService::find`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Matches before `$skip`/`$limit`.
    pub total: usize,
    /// Applied limit.
    pub limit: usize,
    /// Applied offset.
    pub skip: usize,
    /// The page.
    pub data: Vec<Value>,
}

/// A CRUD record store with change events.
///
/// `query` maps field names to required values. The reserved keys `$skip`,
/// `$limit` and `$sort` control paging and ordering.
#[async_trait]
pub trait SourceService: Send + Sync {
    /// Name of the id field.
    fn id_field(&self) -> &str;

    /// Page sizes for `find`.
    fn pagination(&self) -> Pagination {
        Pagination::default()
    }

    /// Records matching `query`.
    async fn find(&self, query: &Query, params: FindParams) -> Result<Page>;

    /// One record, or [`Error::NotFound`].
    async fn get(&self, id: &str) -> Result<Value>;

    /// Insert a record.
    async fn create(&self, data: Value, context: EventContext) -> Result<Value>;

    /// Merge `data` into an existing record.
    async fn patch(&self, id: &str, data: Value, context: EventContext) -> Result<Value>;

    /// Replace an existing record.
    async fn update(&self, id: &str, data: Value, context: EventContext) -> Result<Value>;

    /// Remove a record, returning it.
    async fn remove(&self, id: &str, context: EventContext) -> Result<Value>;

    /// Subscribe to mutation events.
    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent>;
}

/// Services keyed by path.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<dyn SourceService>>,
}

impl ServiceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under `path`.
    ///
    /// Fails for the reserved path `__meta`, empty paths and duplicates.
    pub fn register(&mut self, path: impl Into<String>, service: Arc<dyn SourceService>) -> Result<()> {
        let path = path.into();
        if path.is_empty() || path == META_KEY {
            return Err(Error::config(format!("invalid service path `{path}`")));
        }
        if self.services.contains_key(&path) {
            return Err(Error::config(format!("service `{path}` registered twice")));
        }
        self.services.insert(path, service);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, path: impl Into<String>, service: Arc<dyn SourceService>) -> Result<Self> {
        self.register(path, service)?;
        Ok(self)
    }

    /// Service at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Arc<dyn SourceService>> {
        self.services.get(path)
    }

    /// All services in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn SourceService>)> {
        self.services.iter().map(|(path, service)| (path.as_str(), service))
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.services.keys()).finish()
    }
}
