//! Document to service direction.
//!
//! Each bound partition gets a task that turns record-level document changes
//! into `create`, `patch` and `remove` calls on the owning service. Changes
//! carrying a tag the engine already handled are skipped, which is what
//! keeps the bridge's own writes from coming straight back.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{EngineInner, PendingRemoval};
use crate::doc::{ChangeOrigin, DocChange, Document, DocumentUrl};
use crate::error::{Error, Result};
use crate::partition::{split_tag, PartitionView, META_KEY};
use crate::service::{EventContext, SourceService};
use crate::tag::ChangeTag;

pub(super) async fn run(
    inner: Arc<EngineInner>,
    doc: Arc<Document>,
    mut changes: broadcast::Receiver<DocChange>,
    mut last_seen: Arc<Value>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let change = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            msg = changes.recv() => match msg {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(url = %doc.url(), skipped, "Partition binder lagged, reconciling from snapshot");
                    DocChange::between(
                        doc.url().clone(),
                        Arc::clone(&last_seen),
                        doc.snapshot(),
                        ChangeOrigin::Remote,
                    )
                }
                Err(RecvError::Closed) => break,
            }
        };

        last_seen = Arc::clone(&change.after);
        inner.reconcile(&change).await;
    }
    debug!(url = %doc.url(), "Partition binder stopped");
}

impl EngineInner {
    /// Make sure every record of a freshly bound partition exists in its
    /// service.
    ///
    /// Records the service already has are left alone. Every tag seen here is
    /// marked processed.
    pub(super) async fn initial_sync(&self, url: &DocumentUrl, snapshot: &Value) {
        let view = PartitionView::new(snapshot);
        for path in view.service_paths() {
            let Some(service) = self.services.get(path) else {
                debug!(url = %url, service = path, "Partition holds an unregistered service");
                continue;
            };

            for (id, record) in view.records(path) {
                let (payload, tag) = split_tag(record);
                match service.get(id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        let context = EventContext {
                            change_tag: tag.clone(),
                            initial_sync: true,
                        };
                        match service.create(payload, context).await {
                            Ok(_) => debug!(url = %url, service = path, id, "Seeded record from partition"),
                            Err(e) => warn!(url = %url, service = path, id, error = %e, "Failed to seed record"),
                        }
                    }
                    Err(e) => warn!(url = %url, service = path, id, error = %e, "Failed to look up record"),
                }
                if let Some(tag) = tag {
                    self.tracking.processed.insert(tag);
                }
            }
        }
    }

    /// Apply every record-level path of `change` to its service.
    ///
    /// Records are applied concurrently; one failing never stops the others.
    pub(super) async fn reconcile(&self, change: &DocChange) {
        let work = change
            .changed
            .iter()
            .filter(|path| path.key != META_KEY)
            .filter_map(|path| path.child.as_deref().map(|id| (path.key.as_str(), id)))
            .map(|(path, id)| self.apply(change, path, id));
        join_all(work).await;
    }

    async fn apply(&self, change: &DocChange, path: &str, id: &str) {
        let Some(service) = self.services.get(path) else {
            return;
        };
        let before = change.before.get(path).and_then(|records| records.get(id));
        let after = change.after.get(path).and_then(|records| records.get(id));

        let result = match (before, after) {
            (None, Some(record)) => self.apply_upsert(service.as_ref(), id, record, true).await,
            (Some(_), Some(record)) => self.apply_upsert(service.as_ref(), id, record, false).await,
            (Some(removed), None) => {
                self.apply_removal(service.as_ref(), &change.url, path, id, removed)
                    .await
            }
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!(url = %change.url, service = path, id, error = %e, "Failed to apply partition change");
        }
    }

    async fn apply_upsert(
        &self,
        service: &dyn SourceService,
        id: &str,
        record: &Value,
        created: bool,
    ) -> Result<()> {
        let (payload, tag) = split_tag(record);
        if let Some(tag) = &tag {
            if self.tracking.processed.contains(tag) {
                trace!(id, tag = %tag, "Skipping processed change");
                return Ok(());
            }
        }

        let context = EventContext::tagged(tag.clone());
        let result = if created {
            service.create(payload, context).await
        } else {
            match service.patch(id, payload.clone(), context.clone()).await {
                // Moved in from a partition this replica never saw.
                Err(e) if e.is_not_found() => service.create(payload, context).await,
                other => other,
            }
        };
        result.map_err(|e| Error::apply(format!("{id}: {e}")))?;

        if let Some(tag) = tag {
            self.tracking.processed.insert(tag);
        }
        Ok(())
    }

    async fn apply_removal(
        &self,
        service: &dyn SourceService,
        url: &DocumentUrl,
        path: &str,
        id: &str,
        removed: &Value,
    ) -> Result<()> {
        let pending = PendingRemoval {
            url: url.clone(),
            service: path.to_string(),
            id: id.to_string(),
        };
        if self.tracking.pending_removals.take(&pending) {
            trace!(url = %url, id, "Skipping removal made by the event bridge");
            return Ok(());
        }
        if self.superseded_elsewhere(url, path, id, removed) {
            debug!(url = %url, service = path, id, "Record moved to another partition");
            return Ok(());
        }

        match service.remove(id, EventContext::default()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(service = path, id, "Record already gone");
                Ok(())
            }
            Err(e) => Err(Error::apply(format!("{id}: {e}"))),
        }
    }

    /// Whether another partition holds a newer version of the removed record.
    ///
    /// A move writes the record to its new partition under a fresh tag and
    /// deletes it from the old one. When the new copy was applied first, the
    /// deletion is stale and removing from the service would lose the move.
    /// Copies carrying the removed version's own tag do not count.
    fn superseded_elsewhere(&self, url: &DocumentUrl, path: &str, id: &str, removed: &Value) -> bool {
        let removed_tag = ChangeTag::from_record(removed);
        self.open_partitions().iter().any(|(other, doc)| {
            other != url
                && doc
                    .get(&[path, id])
                    .and_then(|record| ChangeTag::from_record(&record))
                    .is_some_and(|tag| Some(&tag) != removed_tag.as_ref())
        })
    }
}
