//! Source service backed by one service map of a partition document.
//!
//! Reads come from the partition snapshot and writes are document changes, so
//! a `DocumentService` works offline and converges through replication. Events
//! are derived from document changes, which means writes made by peers are
//! announced exactly like local ones.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{query, EventContext, EventKind, FindParams, Page, Pagination, ServiceEvent, SourceService};
use crate::catalog::Query;
use crate::doc::{DocChange, Document};
use crate::error::{Error, Result};
use crate::partition::{ensure_record_id, split_tag, with_tag, PartitionView, ServiceMeta};
use crate::tag::ChangeTag;

/// CRUD over `doc[path]`.
pub struct DocumentService {
    doc: Arc<Document>,
    path: String,
    meta: ServiceMeta,
    events: broadcast::Sender<ServiceEvent>,
    watcher: JoinHandle<()>,
}

impl DocumentService {
    /// Serve `doc[path]`, announcing document changes as events.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(doc: Arc<Document>, path: impl Into<String>, meta: ServiceMeta) -> Self {
        let path = path.into();
        let (events, _) = broadcast::channel(crate::DEFAULT_CHANNEL_CAPACITY);
        let watcher = tokio::spawn(watch_document(
            doc.subscribe(),
            path.clone(),
            events.clone(),
        ));
        Self {
            doc,
            path,
            meta,
            events,
            watcher,
        }
    }

    /// Serve `doc[path]` using the metadata stored in the partition.
    pub fn from_partition(doc: Arc<Document>, path: &str) -> Result<Self> {
        let meta = PartitionView::new(&doc.snapshot())
            .meta(path)
            .ok_or_else(|| Error::not_found(format!("partition has no service `{path}`")))?;
        Ok(Self::new(doc, path, meta))
    }

    /// The backing document
    #[must_use]
    pub fn document(&self) -> &Arc<Document> {
        &self.doc
    }

    /// The service path inside the document
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn payloads(&self) -> Vec<Value> {
        let snapshot = self.doc.snapshot();
        PartitionView::new(&snapshot)
            .records(&self.path)
            .map(|(_, record)| split_tag(record).0)
            .collect()
    }

    fn write(&self, id: &str, record: &Value, context: &EventContext) -> Result<()> {
        let tag = context
            .change_tag
            .clone()
            .unwrap_or_else(ChangeTag::generate);
        let stamped = with_tag(record, &tag);
        self.doc
            .change(|d| d.put(&[self.path.as_str(), id], &stamped))
    }
}

impl Drop for DocumentService {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_document(
    mut changes: broadcast::Receiver<DocChange>,
    path: String,
    events: broadcast::Sender<ServiceEvent>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                warn!(path = %path, skipped, "Document service fell behind, events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        for changed in change.changed.iter().filter(|p| p.key == path) {
            let Some(id) = changed.child.as_deref() else {
                continue;
            };
            let before = change.before.get(&path).and_then(|m| m.get(id));
            let after = change.after.get(&path).and_then(|m| m.get(id));
            let (kind, record) = match (before, after) {
                (None, Some(record)) => (EventKind::Created, record),
                (Some(_), Some(record)) => (EventKind::Patched, record),
                (Some(record), None) => (EventKind::Removed, record),
                (None, None) => continue,
            };
            let (payload, tag) = split_tag(record);
            let _ = events.send(ServiceEvent {
                kind,
                record: payload,
                context: EventContext::tagged(tag),
            });
        }
    }
    debug!(path = %path, "Document service watcher stopped");
}

#[async_trait]
impl SourceService for DocumentService {
    fn id_field(&self) -> &str {
        &self.meta.id_field
    }

    fn pagination(&self) -> Pagination {
        self.meta.paginate
    }

    async fn find(&self, query: &Query, params: FindParams) -> Result<Page> {
        Ok(query::paginate(self.payloads(), query, params, self.meta.paginate))
    }

    async fn get(&self, id: &str) -> Result<Value> {
        self.doc
            .get(&[self.path.as_str(), id])
            .map(|record| split_tag(&record).0)
            .ok_or_else(|| Error::not_found(format!("no record with id {id}")))
    }

    async fn create(&self, mut data: Value, context: EventContext) -> Result<Value> {
        if !data.is_object() {
            return Err(Error::apply("record must be a JSON object"));
        }
        let id = ensure_record_id(&mut data, &self.meta.id_field)
            .ok_or_else(|| Error::apply("record has no usable id"))?;
        self.write(&id, &data, &context)?;
        Ok(data)
    }

    async fn patch(&self, id: &str, data: Value, context: EventContext) -> Result<Value> {
        let Value::Object(changes) = data else {
            return Err(Error::apply("patch must be a JSON object"));
        };
        let mut record = self.get(id).await?;
        if let Some(fields) = record.as_object_mut() {
            fields.extend(changes.into_iter().filter(|(k, _)| *k != self.meta.id_field));
        }
        self.write(id, &record, &context)?;
        Ok(record)
    }

    async fn update(&self, id: &str, mut data: Value, context: EventContext) -> Result<Value> {
        let existing = self.get(id).await?;
        let fields = data
            .as_object_mut()
            .ok_or_else(|| Error::apply("record must be a JSON object"))?;
        if let Some(existing_id) = existing.get(&self.meta.id_field) {
            fields.insert(self.meta.id_field.clone(), existing_id.clone());
        }
        self.write(id, &data, &context)?;
        Ok(data)
    }

    async fn remove(&self, id: &str, _context: EventContext) -> Result<Value> {
        let existing = self.get(id).await?;
        self.doc.change(|d| d.delete(&[self.path.as_str(), id]))?;
        Ok(existing)
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }
}
