//! Local or document-backed service behind one interface.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{DocumentService, EventContext, FindParams, Page, Pagination, ServiceEvent, SourceService};
use crate::catalog::Query;
use crate::error::Result;

/// Which store a [`ServiceBacking`] dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// An application record store.
    Local,
    /// A partition document.
    Document,
}

/// A source service that is either an application store or a partition map.
///
/// Every call is routed by variant, so callers can hold one handle while the
/// data path underneath is chosen per deployment.
#[derive(Clone)]
pub enum ServiceBacking {
    /// Application record store.
    Local(Arc<dyn SourceService>),
    /// Partition document map.
    Document(Arc<DocumentService>),
}

impl ServiceBacking {
    /// The active variant.
    #[must_use]
    pub fn kind(&self) -> BackingKind {
        match self {
            Self::Local(_) => BackingKind::Local,
            Self::Document(_) => BackingKind::Document,
        }
    }

    fn inner(&self) -> &dyn SourceService {
        match self {
            Self::Local(service) => service.as_ref(),
            Self::Document(service) => service.as_ref(),
        }
    }
}

#[async_trait]
impl SourceService for ServiceBacking {
    fn id_field(&self) -> &str {
        self.inner().id_field()
    }

    fn pagination(&self) -> Pagination {
        self.inner().pagination()
    }

    async fn find(&self, query: &Query, params: FindParams) -> Result<Page> {
        self.inner().find(query, params).await
    }

    async fn get(&self, id: &str) -> Result<Value> {
        self.inner().get(id).await
    }

    async fn create(&self, data: Value, context: EventContext) -> Result<Value> {
        self.inner().create(data, context).await
    }

    async fn patch(&self, id: &str, data: Value, context: EventContext) -> Result<Value> {
        self.inner().patch(id, data, context).await
    }

    async fn update(&self, id: &str, data: Value, context: EventContext) -> Result<Value> {
        self.inner().update(id, data, context).await
    }

    async fn remove(&self, id: &str, context: EventContext) -> Result<Value> {
        self.inner().remove(id, context).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner().subscribe()
    }
}
