//! The sync engine.
//!
//! [`SyncEngine`] manages the root catalog and keeps every bound partition
//! and every registered source service in step:
//!
//! - **Catalog manager**: `find`, `get`, `create` and `remove` over
//!   partitions, gated by the strategy's access predicate
//! - **Partition binder** ([`binder`]): applies document changes to the
//!   source services
//! - **Event bridge** ([`bridge`]): applies source-service events to the
//!   partitions
//! - **Tracking** ([`tracking`]): remembers processed tags and pending removals
//!   so changes do not echo between the two sides
//!
//! # Tasks
//!
//! One task per bound partition, one per service and one watching the root
//! catalog for partitions that arrive or vanish through replication. All of
//! them stop on [`SyncEngine::shutdown`].

mod binder;
mod bridge;
pub mod tracking;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogEntry, Query, RootCatalog};
use crate::config::Config;
use crate::doc::{Document, DocumentUrl};
use crate::error::{Error, Result};
use crate::partition::{PartitionBuilder, ServiceMeta};
use crate::service::ServiceRegistry;
use crate::store::Store;
use crate::strategy::{Caller, SyncStrategy};

pub use tracking::{PendingRemoval, Tracking, TtlCache};

/// How long shutdown waits for each task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound partition and the task applying its changes.
struct Partition {
    doc: Arc<Document>,
    task: JoinHandle<()>,
}

/// State shared between the engine handle and its tasks.
pub(crate) struct EngineInner {
    store: Arc<Store>,
    root: RootCatalog,
    services: ServiceRegistry,
    strategy: Arc<dyn SyncStrategy>,
    tracking: Tracking,
    partitions: RwLock<HashMap<DocumentUrl, Partition>>,
    /// Urls some task is currently binding
    binding: Mutex<HashSet<DocumentUrl>>,
    /// Serializes in-process `create` calls
    create_lock: TokioMutex<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The synchronization engine.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Start the engine.
    ///
    /// Binds every partition already listed in `root`, then starts one bridge
    /// task per service and the catalog watcher. Fails with
    /// [`Error::Unavailable`] if the root catalog has not loaded.
    pub async fn start(
        store: Arc<Store>,
        root: RootCatalog,
        services: ServiceRegistry,
        strategy: Arc<dyn SyncStrategy>,
        config: &Config,
    ) -> Result<Self> {
        let entries = root.entries()?;
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            store,
            root,
            services,
            strategy,
            tracking: Tracking::new(config),
            partitions: RwLock::new(HashMap::new()),
            binding: Mutex::new(HashSet::new()),
            create_lock: TokioMutex::new(()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // Subscribe before binding so initial-sync writes are bridged to
        // other partitions.
        for (path, service) in inner.services.iter() {
            let task = tokio::spawn(bridge::run(
                Arc::clone(&inner),
                path.to_string(),
                service.subscribe(),
                inner.shutdown_tx.subscribe(),
            ));
            inner.tasks.lock().push(task);
        }

        let catalog_changes = inner.root.subscribe();
        for entry in &entries {
            if let Err(e) = inner.bind(entry).await {
                warn!(url = %entry.url, error = %e, "Failed to bind partition");
            }
        }

        let watcher = tokio::spawn(watch_catalog(
            Arc::clone(&inner),
            catalog_changes,
            inner.shutdown_tx.subscribe(),
        ));
        inner.tasks.lock().push(watcher);

        info!(
            root = %inner.root.url(),
            partitions = entries.len(),
            services = inner.services.len(),
            "Sync engine started"
        );
        Ok(Self { inner })
    }

    /// Partitions visible to `caller`. `None` is an internal caller and sees
    /// everything.
    pub async fn find(&self, caller: Option<&Caller>) -> Result<Vec<CatalogEntry>> {
        self.ensure_running()?;
        let entries = self.inner.root.entries()?;
        let Some(caller) = caller else {
            return Ok(entries);
        };

        let mut visible = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.inner.strategy.can_access(&entry.query, caller).await? {
                visible.push(entry);
            }
        }
        Ok(visible)
    }

    /// Snapshot of the partition at `url`.
    ///
    /// Partitions the caller may not see are reported as
    /// [`Error::NotFound`].
    pub async fn get(&self, url: &DocumentUrl, caller: Option<&Caller>) -> Result<Value> {
        let visible = self.find(caller).await?;
        if !visible.iter().any(|entry| &entry.url == url) {
            return Err(Error::not_found(format!("no partition {url}")));
        }
        let doc = self
            .partition(url)
            .ok_or_else(|| Error::not_found(format!("partition {url} is not open")))?;
        Ok(doc.snapshot().as_ref().clone())
    }

    /// Create the partition for `query`, or return the existing one.
    pub async fn create(&self, query: Query, caller: Option<&Caller>) -> Result<CatalogEntry> {
        self.ensure_running()?;
        self.check_access(&query, caller).await?;

        let inner = &self.inner;
        let _guard = inner.create_lock.lock().await;

        let entries = inner.root.entries()?;
        if let Some(existing) = entries.iter().find(|entry| entry.query == query) {
            debug!(url = %existing.url, "Partition already exists");
            return Ok(existing.clone());
        }

        let mut builder = PartitionBuilder::default();
        for (path, service) in inner.services.iter() {
            if let Some(records) = inner
                .strategy
                .initialize_document(path, &query, &entries)
                .await?
            {
                let meta = ServiceMeta {
                    id_field: service.id_field().to_string(),
                    paginate: service.pagination(),
                };
                builder = builder.with_service(path, &meta, records);
            }
        }

        let doc = inner.store.create(&builder.build())?;
        let entry = CatalogEntry {
            url: doc.url().clone(),
            query,
        };

        // Claim the url first so the catalog watcher leaves binding to us.
        inner.binding.lock().insert(entry.url.clone());
        let result = match inner.root.append(&entry) {
            Ok(()) => inner.bind_claimed(&entry).await,
            Err(e) => Err(e),
        };
        inner.binding.lock().remove(&entry.url);
        result?;

        info!(url = %entry.url, "Created partition");
        Ok(entry)
    }

    /// Delete the partition at `url`.
    pub async fn remove(&self, url: &DocumentUrl, caller: Option<&Caller>) -> Result<CatalogEntry> {
        self.ensure_running()?;
        let entry = self
            .inner
            .root
            .find_by_url(url)?
            .ok_or_else(|| Error::not_found(format!("no partition {url}")))?;
        self.check_access(&entry.query, caller).await?;

        self.inner.root.remove(url)?;
        self.inner.unbind(url);
        self.inner.store.delete(url).await?;

        info!(url = %url, "Removed partition");
        Ok(entry)
    }

    /// The root catalog
    #[must_use]
    pub fn root(&self) -> &RootCatalog {
        &self.inner.root
    }

    /// The document store
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Registered services
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    /// The engine's tracking caches
    #[doc(hidden)]
    #[must_use]
    pub fn tracking(&self) -> &Tracking {
        &self.inner.tracking
    }

    /// Handle of a bound partition.
    #[must_use]
    pub fn partition(&self, url: &DocumentUrl) -> Option<Arc<Document>> {
        self.inner
            .partitions
            .read()
            .get(url)
            .map(|partition| Arc::clone(&partition.doc))
    }

    /// Urls of all bound partitions.
    #[must_use]
    pub fn partition_urls(&self) -> Vec<DocumentUrl> {
        self.inner.partitions.read().keys().cloned().collect()
    }

    /// Stop every engine task.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Shutting down sync engine");

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        handles.extend(
            self.inner
                .partitions
                .write()
                .drain()
                .map(|(_, partition)| partition.task),
        );

        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("Engine task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("Sync engine stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.inner.shutdown_tx.borrow() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    async fn check_access(&self, query: &Query, caller: Option<&Caller>) -> Result<()> {
        let Some(caller) = caller else {
            return Ok(());
        };
        if self.inner.strategy.can_access(query, caller).await? {
            Ok(())
        } else {
            Err(Error::forbidden(format!(
                "{} may not access this partition",
                caller.user.as_deref().unwrap_or("anonymous caller")
            )))
        }
    }
}

impl EngineInner {
    /// Bind `entry` unless it is bound or being bound.
    async fn bind(self: &Arc<Self>, entry: &CatalogEntry) -> Result<()> {
        if self.partitions.read().contains_key(&entry.url) {
            return Ok(());
        }
        if !self.binding.lock().insert(entry.url.clone()) {
            return Ok(());
        }
        let result = self.bind_claimed(entry).await;
        self.binding.lock().remove(&entry.url);
        result
    }

    /// Bind `entry`; the caller holds its claim in `binding`.
    async fn bind_claimed(self: &Arc<Self>, entry: &CatalogEntry) -> Result<()> {
        let doc = self.store.find(&entry.url).await?;
        let changes = doc.subscribe();
        let snapshot = doc.snapshot();

        self.initial_sync(&entry.url, &snapshot).await;

        let task = tokio::spawn(binder::run(
            Arc::clone(self),
            Arc::clone(&doc),
            changes,
            snapshot,
            self.shutdown_tx.subscribe(),
        ));
        self.partitions
            .write()
            .insert(entry.url.clone(), Partition { doc, task });
        debug!(url = %entry.url, "Bound partition");
        Ok(())
    }

    fn unbind(&self, url: &DocumentUrl) {
        if let Some(partition) = self.partitions.write().remove(url) {
            partition.task.abort();
            debug!(url = %url, "Unbound partition");
        }
    }

    /// Bound partitions, cloned out of the lock.
    fn open_partitions(&self) -> Vec<(DocumentUrl, Arc<Document>)> {
        self.partitions
            .read()
            .iter()
            .map(|(url, partition)| (url.clone(), Arc::clone(&partition.doc)))
            .collect()
    }

    /// Bind new catalog entries. Vanished ones are unbound and deleted.
    async fn sync_catalog(self: &Arc<Self>) {
        let entries = match self.root.entries() {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Root catalog not readable");
                return;
            }
        };

        let listed: HashSet<&DocumentUrl> = entries.iter().map(|entry| &entry.url).collect();
        let stale: Vec<DocumentUrl> = self
            .partitions
            .read()
            .keys()
            .filter(|url| !listed.contains(url))
            .cloned()
            .collect();
        for url in stale {
            self.unbind(&url);
            // Tombstoned so replication does not push it back to peers.
            if let Err(e) = self.store.delete(&url).await {
                warn!(url = %url, error = %e, "Failed to delete removed partition");
            }
        }

        for entry in &entries {
            if let Err(e) = self.bind(entry).await {
                warn!(url = %entry.url, error = %e, "Failed to bind partition");
            }
        }
    }
}

async fn watch_catalog(
    inner: Arc<EngineInner>,
    mut changes: tokio::sync::broadcast::Receiver<crate::doc::DocChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = changes.recv() => match msg {
                Ok(_) | Err(RecvError::Lagged(_)) => inner.sync_catalog().await,
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("Catalog watcher stopped");
}
