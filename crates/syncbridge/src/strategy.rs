//! Partitioning strategy.
//!
//! A [`SyncStrategy`] decides which records seed a new partition, which
//! partitions a record belongs to, and who may see a partition. The engine
//! receives one at construction and never reaches for global state.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{CatalogEntry, Query};
use crate::error::Result;
use crate::service::{query, FindParams, ServiceRegistry};

/// Identity of an external caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Transport the call arrived on, e.g. `rest` or `websocket`.
    pub provider: String,
    /// Authenticated user, if any.
    pub user: Option<String>,
}

impl Caller {
    /// Anonymous caller on `provider`.
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            user: None,
        }
    }

    /// Set the authenticated user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Application hooks that shape partitions.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    /// Whether `caller` may see or change the partition selected by `query`.
    async fn can_access(&self, query: &Query, caller: &Caller) -> Result<bool>;

    /// Records of `service_path` that seed a new partition for `query`.
    ///
    /// `None` leaves the service out of the partition entirely.
    async fn initialize_document(
        &self,
        service_path: &str,
        query: &Query,
        entries: &[CatalogEntry],
    ) -> Result<Option<Vec<Value>>>;

    /// Partitions among `entries` that should hold `record`.
    async fn documents_for_data(
        &self,
        service_path: &str,
        record: &Value,
        entries: &[CatalogEntry],
    ) -> Result<Vec<CatalogEntry>>;
}

/// Routes a record to every partition whose query fields all equal the
/// record's fields.
///
/// Partitions are seeded from `service.find(query)`. With an owner field set,
/// callers may only use partitions whose query names them in that field.
#[derive(Debug, Clone)]
pub struct QueryMatchStrategy {
    services: ServiceRegistry,
    routed: Option<HashSet<String>>,
    owner_field: Option<String>,
}

impl QueryMatchStrategy {
    /// Route every service in `services`.
    #[must_use]
    pub fn new(services: ServiceRegistry) -> Self {
        Self {
            services,
            routed: None,
            owner_field: None,
        }
    }

    /// Only partition the listed service paths.
    #[must_use]
    pub fn only<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routed = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict access to partitions whose `field` equals the caller's user.
    #[must_use]
    pub fn with_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = Some(field.into());
        self
    }

    fn routes(&self, service_path: &str) -> bool {
        self.routed
            .as_ref()
            .map_or(true, |paths| paths.contains(service_path))
    }
}

#[async_trait]
impl SyncStrategy for QueryMatchStrategy {
    async fn can_access(&self, query: &Query, caller: &Caller) -> Result<bool> {
        let Some(field) = &self.owner_field else {
            return Ok(true);
        };
        let owner = query.get(field).and_then(Value::as_str);
        Ok(owner.is_some() && owner == caller.user.as_deref())
    }

    async fn initialize_document(
        &self,
        service_path: &str,
        query: &Query,
        _entries: &[CatalogEntry],
    ) -> Result<Option<Vec<Value>>> {
        if !self.routes(service_path) {
            return Ok(None);
        }
        let Some(service) = self.services.get(service_path) else {
            return Ok(None);
        };
        let page = service.find(query, FindParams::all()).await?;
        Ok(Some(page.data))
    }

    async fn documents_for_data(
        &self,
        service_path: &str,
        record: &Value,
        entries: &[CatalogEntry],
    ) -> Result<Vec<CatalogEntry>> {
        if !self.routes(service_path) {
            return Ok(Vec::new());
        }
        Ok(entries
            .iter()
            .filter(|entry| query::matches(record, &entry.query))
            .cloned()
            .collect())
    }
}
