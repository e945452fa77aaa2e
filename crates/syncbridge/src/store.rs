//! Local storage for documents
//!
//! The [`Store`] owns every open [`Document`] and persists them under
//! `{storage_path}/docs/{id}.automerge`.
//!
//! ## Features
//!
//! - **Atomic writes**: Documents are written to a temp file first, then renamed
//!   to prevent corruption on crash.
//! - **Deferred persistence**: Mutations only mark a document dirty; a flush
//!   loop writes dirty documents on an interval and once more on shutdown.
//! - **Placeholders**: [`Store::find`] hands out an empty document for an
//!   unknown url so replication can fill it in.
//! - **Tombstones**: deleted urls are recorded in `tombstones.json` next to the
//!   documents, so replication cannot bring a deleted document back after a
//!   restart.
//! - **Change feed**: [`Store::subscribe`] yields the url of every document that
//!   changed or was opened, which replication sessions use to push updates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use automerge::AutoCommit;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::doc::{Document, DocumentUrl, URL_PREFIX};
use crate::error::{Error, Result};

const DOC_EXTENSION: &str = "automerge";

/// File listing deleted urls, kept in the documents directory
const TOMBSTONES_FILE: &str = "tombstones.json";

/// Local storage for documents
pub struct Store {
    /// Path to the documents directory
    docs_path: PathBuf,
    /// Capacity of each document's change channel
    capacity: usize,
    /// Handles currently in memory
    open: RwLock<HashMap<DocumentUrl, Arc<Document>>>,
    /// Deleted urls, mirrored to the tombstones file
    deleted: RwLock<HashSet<DocumentUrl>>,
    /// Urls of changed or newly opened documents
    notifier: broadcast::Sender<DocumentUrl>,
    /// Serializes loads so a url never gets two handles
    load_lock: TokioMutex<()>,
    /// Serializes disk writes against deletes
    persist_lock: TokioMutex<()>,
}

impl Store {
    /// Create a new store from config
    pub fn new(config: &Config) -> Result<Self> {
        let docs_path = config.docs_path();

        std::fs::create_dir_all(&docs_path)
            .map_err(|e| Error::storage(format!("failed to create docs directory: {e}")))?;

        let deleted = load_tombstones(&docs_path.join(TOMBSTONES_FILE))?;
        if !deleted.is_empty() {
            debug!(count = deleted.len(), "Loaded tombstones");
        }

        let (notifier, _) = broadcast::channel(config.channel_capacity.max(1));
        Ok(Self {
            docs_path,
            capacity: config.channel_capacity,
            open: RwLock::new(HashMap::new()),
            deleted: RwLock::new(deleted),
            notifier,
            load_lock: TokioMutex::new(()),
            persist_lock: TokioMutex::new(()),
        })
    }

    /// Allocate a new document with `initial` as its root.
    ///
    /// `initial` must be a JSON object.
    pub fn create(&self, initial: &Value) -> Result<Arc<Document>> {
        let fields = initial
            .as_object()
            .ok_or_else(|| Error::document("initial document content must be an object"))?;

        let url = DocumentUrl::generate();
        let doc = Arc::new(self.handle(url.clone(), AutoCommit::new()));
        doc.change(|d| d.set_root(fields))?;
        doc.mark_dirty();

        self.open.write().insert(url.clone(), Arc::clone(&doc));
        let _ = self.notifier.send(url.clone());
        debug!(url = %url, "Created document");
        Ok(doc)
    }

    /// Get a handle, loading it from disk or creating an empty placeholder.
    pub async fn find(&self, url: &DocumentUrl) -> Result<Arc<Document>> {
        if let Some(doc) = self.find_local(url).await? {
            return Ok(doc);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(doc) = self.open_handle(url) {
            return Ok(doc);
        }

        debug!(url = %url, "Opening placeholder document");
        let doc = Arc::new(self.handle(url.clone(), AutoCommit::new()));
        self.open.write().insert(url.clone(), Arc::clone(&doc));
        let _ = self.notifier.send(url.clone());
        Ok(doc)
    }

    /// Get a handle if the document is open or persisted locally.
    pub async fn find_local(&self, url: &DocumentUrl) -> Result<Option<Arc<Document>>> {
        if self.is_deleted(url) {
            return Err(Error::not_found(format!("document {url} was deleted")));
        }
        if let Some(doc) = self.open_handle(url) {
            return Ok(Some(doc));
        }

        let _guard = self.load_lock.lock().await;
        if let Some(doc) = self.open_handle(url) {
            return Ok(Some(doc));
        }

        let path = self.doc_path(url);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::storage(format!("failed to read document: {e}")))?;
        let loaded = AutoCommit::load(&bytes)
            .map_err(|e| Error::storage(format!("failed to load document {url}: {e}")))?;

        let doc = Arc::new(self.handle(url.clone(), loaded));
        self.open.write().insert(url.clone(), Arc::clone(&doc));
        debug!(url = %url, path = %path.display(), "Loaded document");
        Ok(Some(doc))
    }

    /// Drop a document from memory and disk.
    ///
    /// The url is tombstoned on disk. Later lookups fail with
    /// [`Error::NotFound`], across restarts too, so replication cannot bring
    /// it back.
    pub async fn delete(&self, url: &DocumentUrl) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let added = self.deleted.write().insert(url.clone());
        self.open.write().remove(url);
        if added {
            self.save_tombstones().await?;
        }

        let path = self.doc_path(url);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| Error::storage(format!("failed to delete document: {e}")))?;
            info!(url = %url, "Document deleted");
        } else {
            debug!(url = %url, "Document not on disk, nothing to delete");
        }

        let temp_path = path.with_extension("automerge.tmp");
        if temp_path.exists() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        Ok(())
    }

    /// Whether `url` was deleted through this store, now or in an earlier run.
    #[must_use]
    pub fn is_deleted(&self, url: &DocumentUrl) -> bool {
        self.deleted.read().contains(url)
    }

    /// Every document known locally, open or on disk.
    pub fn list(&self) -> Result<Vec<DocumentUrl>> {
        let mut urls: BTreeSet<DocumentUrl> = self.open.read().keys().cloned().collect();

        let entries = std::fs::read_dir(&self.docs_path)
            .map_err(|e| Error::storage(format!("failed to read directory: {e}")))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::storage(format!("failed to read directory entry: {e}")))?;
            if let Some(url) = self.path_to_url(&entry.path()) {
                urls.insert(url);
            }
        }

        let deleted = self.deleted.read();
        Ok(urls.into_iter().filter(|url| !deleted.contains(url)).collect())
    }

    /// Subscribe to the urls of changed or newly opened documents.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentUrl> {
        self.notifier.subscribe()
    }

    /// Save a document atomically
    ///
    /// Writes to a temp file first, then renames to prevent corruption on crash.
    pub async fn save_doc_atomic(&self, doc: &Document) -> Result<()> {
        let path = doc.path();
        let temp_path = path.with_extension("automerge.tmp");

        let bytes = doc.save_bytes();

        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| Error::storage(format!("failed to write temp file: {e}")))?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::storage(format!("failed to rename temp file: {e}")))?;

        debug!(path = %path.display(), bytes = bytes.len(), "Document saved atomically");
        Ok(())
    }

    /// Write every dirty document to disk. Returns how many were saved.
    pub async fn flush(&self) -> Result<usize> {
        let docs: Vec<Arc<Document>> = self.open.read().values().cloned().collect();

        let mut saved = 0;
        for doc in docs {
            // Held across the check and the write so a delete cannot land
            // between them and have the file written back.
            let _guard = self.persist_lock.lock().await;
            if self.is_deleted(doc.url()) || !doc.take_dirty() {
                continue;
            }
            if let Err(e) = self.save_doc_atomic(&doc).await {
                doc.mark_dirty();
                return Err(e);
            }
            saved += 1;
        }
        Ok(saved)
    }

    /// Flush on `interval` until `shutdown` flips, then flush once more.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush().await {
                            warn!(error = %e, "Flush failed");
                        }
                    }
                }
            }

            match store.flush().await {
                Ok(saved) => debug!(saved, "Final flush complete"),
                Err(e) => warn!(error = %e, "Final flush failed"),
            }
        })
    }

    /// Get the documents directory
    #[must_use]
    pub fn docs_path(&self) -> &Path {
        &self.docs_path
    }

    /// Rewrite the tombstones file from the in-memory set.
    async fn save_tombstones(&self) -> Result<()> {
        let mut urls: Vec<DocumentUrl> = self.deleted.read().iter().cloned().collect();
        urls.sort();
        let bytes = serde_json::to_vec(&urls)
            .map_err(|e| Error::storage(format!("failed to encode tombstones: {e}")))?;

        let path = self.docs_path.join(TOMBSTONES_FILE);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| Error::storage(format!("failed to write tombstones: {e}")))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Error::storage(format!("failed to rename tombstones: {e}")))?;
        Ok(())
    }

    fn open_handle(&self, url: &DocumentUrl) -> Option<Arc<Document>> {
        self.open.read().get(url).cloned()
    }

    fn handle(&self, url: DocumentUrl, doc: AutoCommit) -> Document {
        let path = self.doc_path(&url);
        Document::new(url, path, doc, self.capacity).with_notifier(self.notifier.clone())
    }

    /// Get the path for a document
    fn doc_path(&self, url: &DocumentUrl) -> PathBuf {
        self.docs_path
            .join(format!("{}.{DOC_EXTENSION}", url.document_id()))
    }

    /// Convert a file path back to a document url
    fn path_to_url(&self, path: &Path) -> Option<DocumentUrl> {
        if path.extension()? != DOC_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        DocumentUrl::parse(&format!("{URL_PREFIX}{stem}")).ok()
    }
}

fn load_tombstones(path: &Path) -> Result<HashSet<DocumentUrl>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let bytes = std::fs::read(path)
        .map_err(|e| Error::storage(format!("failed to read tombstones: {e}")))?;
    let urls: Vec<DocumentUrl> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::storage(format!("failed to parse tombstones: {e}")))?;
    Ok(urls.into_iter().collect())
}
