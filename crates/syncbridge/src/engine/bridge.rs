//! Service to document direction.
//!
//! One task per registered service listens for mutation events and writes
//! the record into every open partition the strategy routes it to, deleting
//! it from partitions it no longer belongs in. Writes are stamped with the
//! event's tag, or a fresh one, and the tag is marked processed before any
//! partition is touched so the binders skip the resulting changes.
//!
//! If the bridge falls behind the service's event channel it rereads the
//! whole service and reconciles every open partition against it.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{EngineInner, PendingRemoval};
use crate::catalog::{CatalogEntry, Query};
use crate::doc::{Document, DocumentUrl};
use crate::error::Result;
use crate::partition::{record_id, split_tag, with_tag};
use crate::service::{EventKind, FindParams, ServiceEvent};
use crate::tag::ChangeTag;

pub(super) async fn run(
    inner: Arc<EngineInner>,
    path: String,
    mut events: broadcast::Receiver<ServiceEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = events.recv() => match msg {
                Ok(event) => {
                    if let Err(e) = inner.handle_event(&path, &event).await {
                        warn!(service = %path, error = %e, "Failed to bridge service event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(service = %path, skipped, "Event bridge lagged, resyncing service");
                    if let Err(e) = inner.resync_service(&path).await {
                        warn!(service = %path, error = %e, "Failed to resync service");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!(service = %path, "Event bridge stopped");
}

/// One record write, as seen by a single partition.
struct Outgoing<'a> {
    path: &'a str,
    id: &'a str,
    /// Tag the event arrived with.
    event_tag: Option<&'a ChangeTag>,
    /// Record stamped with the write's tag.
    record: &'a Value,
    removal: bool,
}

/// A service record as a resync writes it.
struct Resynced {
    id: String,
    payload: Value,
    record: Value,
    targets: HashSet<DocumentUrl>,
}

impl EngineInner {
    pub(super) async fn handle_event(&self, path: &str, event: &ServiceEvent) -> Result<()> {
        let Some(service) = self.services.get(path) else {
            return Ok(());
        };
        let Some(id) = record_id(&event.record, service.id_field()) else {
            warn!(service = path, "Service event record has no id, ignoring");
            return Ok(());
        };

        let entries = self.root.entries()?;
        let targets = self.targets(path, &event.record, &entries).await?;

        let event_tag = event.context.change_tag.as_ref();
        let tag = event_tag.cloned().unwrap_or_else(ChangeTag::generate);
        self.tracking.processed.insert(tag.clone());

        let (payload, _) = split_tag(&event.record);
        let stamped = with_tag(&payload, &tag);
        let outgoing = Outgoing {
            path,
            id: &id,
            event_tag,
            record: &stamped,
            removal: event.kind == EventKind::Removed,
        };

        for (url, doc) in self.open_partitions() {
            let wanted = targets.contains(&url);
            if let Err(e) = self.write_partition(&url, &doc, &outgoing, wanted) {
                warn!(url = %url, service = path, id, error = %e, "Failed to update partition");
            }
        }
        Ok(())
    }

    /// Reconcile every open partition with the service's current records.
    ///
    /// Each partition is rewritten in a single change. Copies that already
    /// match are left alone, as are copies from peers the binder has not
    /// applied yet. Records the service no longer has are dropped only when
    /// their tag is one this engine already handled.
    pub(super) async fn resync_service(&self, path: &str) -> Result<()> {
        let Some(service) = self.services.get(path) else {
            return Ok(());
        };
        let records = service.find(&Query::new(), FindParams::all()).await?.data;
        let entries = self.root.entries()?;

        let mut resynced = Vec::with_capacity(records.len());
        for record in &records {
            let Some(id) = record_id(record, service.id_field()) else {
                continue;
            };
            let targets = self.targets(path, record, &entries).await?;
            let tag = ChangeTag::generate();
            self.tracking.processed.insert(tag.clone());
            let (payload, _) = split_tag(record);
            let record = with_tag(&payload, &tag);
            resynced.push(Resynced {
                id,
                payload,
                record,
                targets,
            });
        }

        for (url, doc) in self.open_partitions() {
            match self.resync_partition(&url, &doc, path, &resynced) {
                Ok((written, dropped)) if written + dropped > 0 => {
                    debug!(url = %url, service = path, written, dropped, "Resynced partition");
                }
                Ok(_) => {}
                Err(e) => warn!(url = %url, service = path, error = %e, "Failed to resync partition"),
            }
        }
        debug!(service = path, records = resynced.len(), "Resynced service");
        Ok(())
    }

    async fn targets(
        &self,
        path: &str,
        record: &Value,
        entries: &[CatalogEntry],
    ) -> Result<HashSet<DocumentUrl>> {
        Ok(self
            .strategy
            .documents_for_data(path, record, entries)
            .await?
            .into_iter()
            .map(|entry| entry.url)
            .collect())
    }

    fn is_handled(&self, record: &Value) -> bool {
        ChangeTag::from_record(record).is_some_and(|tag| self.tracking.processed.contains(&tag))
    }

    fn resync_partition(
        &self,
        url: &DocumentUrl,
        doc: &Document,
        path: &str,
        resynced: &[Resynced],
    ) -> Result<(usize, usize)> {
        doc.change(|d| {
            let Some(Value::Object(present)) = d.get(&[path]) else {
                return Ok((0, 0));
            };
            let (mut written, mut dropped) = (0, 0);
            let mut held = HashSet::with_capacity(resynced.len());

            for item in resynced {
                held.insert(item.id.as_str());
                let existing = present.get(&item.id);
                if item.targets.contains(url) {
                    let current = existing.is_some_and(|existing| {
                        split_tag(existing).0 == item.payload || !self.is_handled(existing)
                    });
                    if !current {
                        d.put(&[path, item.id.as_str()], &item.record)?;
                        written += 1;
                    }
                } else if existing.is_some() {
                    self.pending_removal(url, path, &item.id);
                    d.delete(&[path, item.id.as_str()])?;
                    dropped += 1;
                }
            }

            for (id, record) in &present {
                if held.contains(id.as_str()) || !self.is_handled(record) {
                    continue;
                }
                self.pending_removal(url, path, id);
                d.delete(&[path, id.as_str()])?;
                dropped += 1;
            }
            Ok((written, dropped))
        })
    }

    fn pending_removal(&self, url: &DocumentUrl, path: &str, id: &str) {
        self.tracking.pending_removals.insert(PendingRemoval {
            url: url.clone(),
            service: path.to_string(),
            id: id.to_string(),
        });
    }

    fn write_partition(
        &self,
        url: &DocumentUrl,
        doc: &Document,
        outgoing: &Outgoing<'_>,
        wanted: bool,
    ) -> Result<()> {
        let (path, id) = (outgoing.path, outgoing.id);
        doc.change(|d| {
            if !d.is_map(&[path]) {
                return Ok(());
            }
            let existing = d.get(&[path, id]);

            // The partition this change came from already holds it.
            let existing_tag = existing.as_ref().and_then(ChangeTag::from_record);
            if outgoing.event_tag.is_some() && outgoing.event_tag == existing_tag.as_ref() {
                trace!(url = %url, id, "Partition already holds this change");
                return Ok(());
            }

            if outgoing.removal || !wanted {
                if existing.is_some() {
                    self.pending_removal(url, path, id);
                    d.delete(&[path, id])?;
                    debug!(url = %url, service = path, id, "Removed record from partition");
                }
                return Ok(());
            }
            d.put(&[path, id], outgoing.record)
        })
    }
}
