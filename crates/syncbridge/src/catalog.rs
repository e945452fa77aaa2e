//! Root catalog.
//!
//! The root catalog is the one document per sync domain that lists every
//! partition as `{url, query}`:
//!
//! ```text
//! { "documents": [ { "url": "automerge:…", "query": { "username": "alice" } } ] }
//! ```
//!
//! Its url is kept in `{storage_path}/syncbridge.json` so a restarted node
//! reopens the same catalog.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::doc::{DocChange, Document, DocumentUrl};
use crate::error::{Error, Result};
use crate::store::Store;

/// Key of the entry list in the root catalog.
pub const DOCUMENTS_KEY: &str = "documents";

/// A partition predicate. Two partitions are the same iff their queries are
/// deep-equal.
pub type Query = Map<String, Value>;

/// One partition listed in the root catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Partition document url.
    pub url: DocumentUrl,
    /// Predicate selecting the partition's records.
    pub query: Query,
}

/// Contents of `syncbridge.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootRecord {
    /// Url of the root catalog document.
    pub root_document_id: DocumentUrl,
}

impl RootRecord {
    /// Read the record, or `None` if the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::storage(format!("failed to read root record: {e}")))?;
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| Error::storage(format!("invalid root record: {e}")))?;
        Ok(Some(record))
    }

    /// Write the record atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::storage(format!("failed to encode root record: {e}")))?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, bytes)
            .await
            .map_err(|e| Error::storage(format!("failed to write root record: {e}")))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::storage(format!("failed to rename root record: {e}")))?;
        Ok(())
    }
}

/// Handle to the root catalog document.
#[derive(Debug, Clone)]
pub struct RootCatalog {
    doc: Arc<Document>,
}

impl RootCatalog {
    /// Wrap an already opened document.
    #[must_use]
    pub fn new(doc: Arc<Document>) -> Self {
        Self { doc }
    }

    /// Allocate a new, empty catalog.
    pub fn create(store: &Store) -> Result<Self> {
        let doc = store.create(&json!({ DOCUMENTS_KEY: [] }))?;
        Ok(Self { doc })
    }

    /// Open the catalog at `url`, as a placeholder if it is not local yet.
    pub async fn open(store: &Store, url: &DocumentUrl) -> Result<Self> {
        Ok(Self {
            doc: store.find(url).await?,
        })
    }

    /// Hub startup: reopen the persisted catalog or create and persist one.
    ///
    /// Fails with [`Error::Unavailable`] when the record names a catalog whose
    /// document is missing or empty.
    pub async fn load_or_create(store: &Store, config: &Config) -> Result<Self> {
        let record_path = config.root_record_path();

        if let Some(record) = RootRecord::load(&record_path).await? {
            let catalog = Self::open(store, &record.root_document_id).await?;
            // A fresh entry list here would conflict with the one peers hold.
            if !catalog.is_available() {
                return Err(Error::unavailable(format!(
                    "persisted root catalog {} has no entry list; restore its document or remove {}",
                    catalog.url(),
                    record_path.display()
                )));
            }
            info!(url = %catalog.url(), "Loaded root catalog");
            return Ok(catalog);
        }

        let catalog = Self::create(store)?;
        store.save_doc_atomic(&catalog.doc).await?;
        RootRecord {
            root_document_id: catalog.url().clone(),
        }
        .save(&record_path)
        .await?;
        info!(url = %catalog.url(), "Created root catalog");
        Ok(catalog)
    }

    /// Url of the catalog document
    #[must_use]
    pub fn url(&self) -> &DocumentUrl {
        self.doc.url()
    }

    /// The underlying document
    #[must_use]
    pub fn document(&self) -> &Arc<Document> {
        &self.doc
    }

    /// Whether the entry list has arrived.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.doc
            .get(&[DOCUMENTS_KEY])
            .is_some_and(|documents| documents.is_array())
    }

    /// All entries in append order.
    ///
    /// Malformed entries are skipped.
    pub fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let snapshot = self.doc.snapshot();
        let documents = snapshot
            .get(DOCUMENTS_KEY)
            .and_then(Value::as_array)
            .ok_or_else(|| Error::unavailable("root catalog not loaded"))?;

        Ok(documents
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed catalog entry");
                    None
                }
            })
            .collect())
    }

    /// First entry whose query is deep-equal to `query`.
    pub fn find_by_query(&self, query: &Query) -> Result<Option<CatalogEntry>> {
        Ok(self.entries()?.into_iter().find(|e| &e.query == query))
    }

    /// Entry for `url`.
    pub fn find_by_url(&self, url: &DocumentUrl) -> Result<Option<CatalogEntry>> {
        Ok(self.entries()?.into_iter().find(|e| &e.url == url))
    }

    /// Append an entry.
    pub fn append(&self, entry: &CatalogEntry) -> Result<()> {
        let value = serde_json::to_value(entry)
            .map_err(|e| Error::document(format!("failed to encode catalog entry: {e}")))?;
        self.doc.change(|d| d.push(&[DOCUMENTS_KEY], &value))?;
        debug!(url = %entry.url, "Appended catalog entry");
        Ok(())
    }

    /// Remove every entry for `url`. Returns whether one existed.
    pub fn remove(&self, url: &DocumentUrl) -> Result<bool> {
        let removed = self.doc.change(|d| {
            d.retain(&[DOCUMENTS_KEY], |item| {
                item.get("url").and_then(Value::as_str) != Some(url.as_str())
            })
        })?;
        Ok(removed > 0)
    }

    /// Subscribe to catalog changes.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DocChange> {
        self.doc.subscribe()
    }

    /// Wait until the entry list has arrived through replication.
    pub async fn wait_available(&self, timeout: Duration) -> Result<()> {
        let mut changes = self.subscribe();
        let wait = async {
            loop {
                if self.is_available() {
                    return Ok(());
                }
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(Error::Shutdown),
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::unavailable(format!(
                "root catalog {} did not arrive within {timeout:?}",
                self.url()
            ))
        })?
    }
}
