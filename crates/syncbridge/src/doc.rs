//! Document handles.
//!
//! A [`Document`] owns one Automerge document and exposes it as JSON. Reads go
//! through a cached [`snapshot`](Document::snapshot); writes go through
//! [`change`](Document::change), which applies a closure atomically and
//! publishes a [`DocChange`] describing which `[key, child]` paths differ
//! between the old and new snapshot.
//!
//! # Example
//!
//! ```rust
//! use syncbridge::doc::{Document, DocumentUrl};
//! use serde_json::json;
//!
//! # fn example() -> syncbridge::Result<()> {
//! let doc = Document::new(
//!     DocumentUrl::generate(),
//!     "/tmp/doc.automerge".into(),
//!     automerge::AutoCommit::new(),
//!     16,
//! );
//! let mut changes = doc.subscribe();
//!
//! doc.change(|d| d.put(&["todos", "1"], &json!({"title": "milk"})))?;
//!
//! assert_eq!(doc.get(&["todos", "1", "title"]), Some(json!("milk")));
//! assert_eq!(changes.try_recv().unwrap().changed.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use automerge::sync::SyncDoc;
use automerge::{
    transaction::Transactable, AutoCommit, AutomergeError, ChangeHash, ObjId, ObjType, Prop,
    ReadDoc, ScalarValue, ROOT,
};
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Scheme prefix of every [`DocumentUrl`].
pub const URL_PREFIX: &str = "automerge:";

/// Address of a replicated document: `automerge:<32 lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentUrl(String);

impl DocumentUrl {
    /// Allocate a fresh url.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{URL_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Parse and validate a url.
    pub fn parse(s: &str) -> Result<Self> {
        let id = s
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| Error::invalid_url(format!("missing `{URL_PREFIX}` prefix: {s}")))?;
        let valid = id.len() == 32
            && id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(Error::invalid_url(format!("malformed document id: {s}")));
        }
        Ok(Self(s.to_string()))
    }

    /// The full url
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex id without the scheme, used as the file stem on disk.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.0[URL_PREFIX.len()..]
    }
}

impl fmt::Display for DocumentUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentUrl {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DocumentUrl> for String {
    fn from(url: DocumentUrl) -> Self {
        url.0
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Made through [`Document::change`] in this process.
    Local,
    /// Merged from a peer's sync message.
    Remote,
}

/// A changed top-level key, or a changed child of a top-level map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangedPath {
    /// Top-level key.
    pub key: String,
    /// Child key when both sides are maps (or absent).
    pub child: Option<String>,
}

impl ChangedPath {
    #[cfg(test)]
    pub(crate) fn child(key: &str, child: &str) -> Self {
        Self {
            key: key.to_string(),
            child: Some(child.to_string()),
        }
    }
}

/// Notification published after every effective mutation.
#[derive(Debug, Clone)]
pub struct DocChange {
    /// The mutated document.
    pub url: DocumentUrl,
    /// Snapshot before the change.
    pub before: Arc<Value>,
    /// Snapshot after the change.
    pub after: Arc<Value>,
    /// Paths whose value differs between `before` and `after`.
    pub changed: Vec<ChangedPath>,
    /// Local or replicated.
    pub origin: ChangeOrigin,
}

impl DocChange {
    /// Build a change by diffing two snapshots.
    #[must_use]
    pub fn between(
        url: DocumentUrl,
        before: Arc<Value>,
        after: Arc<Value>,
        origin: ChangeOrigin,
    ) -> Self {
        let changed = diff_paths(&before, &after);
        Self {
            url,
            before,
            after,
            changed,
            origin,
        }
    }
}

/// Two-level structural diff of JSON objects.
///
/// A top-level key whose old and new values are both maps (or missing) is
/// reported per child; anything else is reported as the key alone.
#[must_use]
pub fn diff_paths(before: &Value, after: &Value) -> Vec<ChangedPath> {
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    let mut changed = Vec::new();
    for key in keys {
        let (old, new) = (before.get(key), after.get(key));
        if old == new {
            continue;
        }
        let nested = matches!(old, None | Some(Value::Object(_)))
            && matches!(new, None | Some(Value::Object(_)));
        if !nested {
            changed.push(ChangedPath {
                key: key.clone(),
                child: None,
            });
            continue;
        }
        let old = old.and_then(Value::as_object).unwrap_or(&empty);
        let new = new.and_then(Value::as_object).unwrap_or(&empty);
        let children: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for child in children {
            if old.get(child) != new.get(child) {
                changed.push(ChangedPath {
                    key: key.clone(),
                    child: Some(child.clone()),
                });
            }
        }
    }
    changed
}

/// A handle to an Automerge document.
///
/// All mutations take the document's write lock, so changes to one document
/// are serialized. Notifications are sent while the lock is held, which keeps
/// their order identical to the order of the snapshots they describe.
pub struct Document {
    url: DocumentUrl,
    path: PathBuf,
    doc: RwLock<AutoCommit>,
    snapshot: RwLock<Arc<Value>>,
    dirty: RwLock<bool>,
    changes: broadcast::Sender<DocChange>,
    notifier: Option<broadcast::Sender<DocumentUrl>>,
}

impl Document {
    /// Create a new document handle
    ///
    /// This is primarily for internal use. Applications should go through
    /// [`Store`](crate::Store).
    #[doc(hidden)]
    #[must_use]
    pub fn new(url: DocumentUrl, path: PathBuf, doc: AutoCommit, capacity: usize) -> Self {
        let snapshot = Arc::new(doc_to_json(&doc));
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            url,
            path,
            doc: RwLock::new(doc),
            snapshot: RwLock::new(snapshot),
            dirty: RwLock::new(false),
            changes,
            notifier: None,
        }
    }

    /// Also announce this document's url on `notifier` whenever it changes.
    pub(crate) fn with_notifier(mut self, notifier: broadcast::Sender<DocumentUrl>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Get the document url
    #[must_use]
    pub fn url(&self) -> &DocumentUrl {
        &self.url
    }

    /// Get the document path on disk
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Current contents as JSON.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.snapshot.read())
    }

    /// Whether the document has no content yet (e.g. a placeholder waiting
    /// for replication).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot
            .read()
            .as_object()
            .map_or(true, Map::is_empty)
    }

    /// Read the value at `path` from the current snapshot.
    #[must_use]
    pub fn get(&self, path: &[&str]) -> Option<Value> {
        let snapshot = self.snapshot.read();
        let mut current: &Value = &snapshot;
        for segment in path {
            current = current.get(*segment)?;
        }
        Some(current.clone())
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }

    /// Apply `f` atomically.
    ///
    /// If `f` returns an error every operation it made is rolled back and no
    /// notification is sent.
    pub fn change<T>(&self, f: impl FnOnce(&mut DocMut<'_>) -> Result<T>) -> Result<T> {
        let mut doc = self.doc.write();
        let heads = doc.get_heads();
        match f(&mut DocMut { doc: &mut *doc }) {
            Ok(value) => {
                self.publish(&mut *doc, &heads, ChangeOrigin::Local);
                Ok(value)
            }
            Err(e) => {
                doc.rollback();
                Err(e)
            }
        }
    }

    /// Check if the document has unsaved changes
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        *self.dirty.read()
    }

    pub(crate) fn mark_dirty(&self) {
        *self.dirty.write() = true;
    }

    /// Clear the dirty flag, returning its previous value.
    pub(crate) fn take_dirty(&self) -> bool {
        std::mem::replace(&mut *self.dirty.write(), false)
    }

    /// Get the raw Automerge document bytes
    pub(crate) fn save_bytes(&self) -> Vec<u8> {
        self.doc.write().save()
    }

    /// Generate a sync message for the given sync state
    ///
    /// Returns `None` if there is nothing to send.
    pub(crate) fn generate_sync_message(
        &self,
        sync_state: &mut automerge::sync::State,
    ) -> Option<automerge::sync::Message> {
        self.doc.write().sync().generate_sync_message(sync_state)
    }

    /// Merge a peer's sync message, publishing any resulting change.
    pub(crate) fn receive_sync_message(
        &self,
        sync_state: &mut automerge::sync::State,
        message: automerge::sync::Message,
    ) -> Result<()> {
        let mut doc = self.doc.write();
        let heads = doc.get_heads();
        doc.sync()
            .receive_sync_message(sync_state, message)
            .map_err(|e| Error::sync(format!("failed to receive sync message: {e}")))?;
        self.publish(&mut *doc, &heads, ChangeOrigin::Remote);
        Ok(())
    }

    /// Get the heads (version vector) of this document
    ///
    /// This is useful for verifying that two replicas are in sync.
    #[doc(hidden)]
    pub fn get_heads(&self) -> Vec<ChangeHash> {
        self.doc.write().get_heads()
    }

    fn publish(&self, doc: &mut AutoCommit, heads_before: &[ChangeHash], origin: ChangeOrigin) {
        if doc.get_heads() == heads_before {
            return;
        }
        *self.dirty.write() = true;

        let after = Arc::new(doc_to_json(doc));
        let before = std::mem::replace(&mut *self.snapshot.write(), Arc::clone(&after));
        let change = DocChange::between(self.url.clone(), before, after, origin);
        if !change.changed.is_empty() {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(self.url.clone());
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("url", &self.url)
            .field("path", &self.path)
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

/// Mutable view handed to [`Document::change`].
///
/// Paths are sequences of map keys starting at the document root.
pub struct DocMut<'a> {
    doc: &'a mut AutoCommit,
}

impl DocMut<'_> {
    /// Read the value at `path`.
    #[must_use]
    pub fn get(&self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let doc: &AutoCommit = self.doc;
        let obj = resolve(doc, parents)?;
        let (value, id) = doc.get(&obj, *last).ok()??;
        Some(read_value(doc, value, &id))
    }

    /// Whether anything is stored at `path`.
    #[must_use]
    pub fn contains(&self, path: &[&str]) -> bool {
        let doc: &AutoCommit = self.doc;
        path.split_last()
            .and_then(|(last, parents)| {
                let obj = resolve(doc, parents)?;
                doc.get(&obj, *last).ok().flatten().map(|_| ())
            })
            .is_some()
    }

    /// Whether a map is stored at `path`.
    #[must_use]
    pub fn is_map(&self, path: &[&str]) -> bool {
        resolve(&*self.doc, path).is_some()
    }

    /// Write `value` at `path`, creating missing parent maps.
    ///
    /// Objects are merged field by field into an existing map; fields that
    /// are absent from `value` are deleted and unchanged fields are left
    /// untouched.
    pub fn put(&mut self, path: &[&str], value: &Value) -> Result<()> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| Error::document("cannot put at an empty path"))?;
        let obj = ensure_maps(self.doc, parents)?;
        put_at(self.doc, &obj, Prop::from(*last), value)
    }

    /// Replace the root with `fields`.
    pub fn set_root(&mut self, fields: &Map<String, Value>) -> Result<()> {
        reconcile_map(self.doc, &ROOT, fields)
    }

    /// Delete the value at `path`. Returns whether anything was removed.
    pub fn delete(&mut self, path: &[&str]) -> Result<bool> {
        let Some((last, parents)) = path.split_last() else {
            return Ok(false);
        };
        let Some(obj) = resolve(&*self.doc, parents) else {
            return Ok(false);
        };
        if self.doc.get(&obj, *last).map_err(am_err)?.is_none() {
            return Ok(false);
        }
        self.doc.delete(&obj, *last).map_err(am_err)?;
        Ok(true)
    }

    /// Append `value` to the list at `path`, creating the list if missing.
    pub fn push(&mut self, path: &[&str], value: &Value) -> Result<()> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| Error::document("cannot push at an empty path"))?;
        let obj = ensure_maps(self.doc, parents)?;
        let list = match slot(&*self.doc, &obj, Prop::from(*last))? {
            Slot::List(id) => id,
            _ => self
                .doc
                .put_object(&obj, *last, ObjType::List)
                .map_err(am_err)?,
        };
        let len = self.doc.length(&list);
        insert_item(self.doc, &list, len, value)
    }

    /// Remove every item of the list at `path` for which `keep` is false.
    /// Returns the number of removed items.
    pub fn retain(&mut self, path: &[&str], mut keep: impl FnMut(&Value) -> bool) -> Result<usize> {
        let Some((last, parents)) = path.split_last() else {
            return Ok(0);
        };
        let Some(obj) = resolve(&*self.doc, parents) else {
            return Ok(0);
        };
        let Slot::List(list) = slot(&*self.doc, &obj, Prop::from(*last))? else {
            return Ok(0);
        };

        let mut removed = 0;
        for index in (0..self.doc.length(&list)).rev() {
            let doc: &AutoCommit = self.doc;
            let item = match doc.get(&list, index).map_err(am_err)? {
                Some((value, id)) => read_value(doc, value, &id),
                None => continue,
            };
            if !keep(&item) {
                self.doc.delete(&list, index).map_err(am_err)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// =============================================================================
// Automerge <-> JSON
// =============================================================================

enum Slot {
    Missing,
    Map(ObjId),
    List(ObjId),
    Text,
    Scalar(ScalarValue),
}

fn am_err(e: AutomergeError) -> Error {
    Error::document(e.to_string())
}

fn slot(doc: &AutoCommit, obj: &ObjId, prop: Prop) -> Result<Slot> {
    Ok(match doc.get(obj, prop).map_err(am_err)? {
        None => Slot::Missing,
        Some((automerge::Value::Object(ObjType::List), id)) => Slot::List(id),
        Some((automerge::Value::Object(ObjType::Text), _)) => Slot::Text,
        Some((automerge::Value::Object(_), id)) => Slot::Map(id),
        Some((automerge::Value::Scalar(s), _)) => Slot::Scalar(s.into_owned()),
    })
}

fn resolve(doc: &AutoCommit, path: &[&str]) -> Option<ObjId> {
    let mut obj = ROOT;
    for segment in path {
        match slot(doc, &obj, Prop::from(*segment)).ok()? {
            Slot::Map(id) => obj = id,
            _ => return None,
        }
    }
    Some(obj)
}

fn ensure_maps(doc: &mut AutoCommit, path: &[&str]) -> Result<ObjId> {
    let mut obj = ROOT;
    for segment in path {
        obj = match slot(doc, &obj, Prop::from(*segment))? {
            Slot::Map(id) => id,
            _ => doc
                .put_object(&obj, *segment, ObjType::Map)
                .map_err(am_err)?,
        };
    }
    Ok(obj)
}

fn put_at(doc: &mut AutoCommit, obj: &ObjId, prop: Prop, value: &Value) -> Result<()> {
    match (value, slot(doc, obj, prop.clone())?) {
        (Value::Object(fields), Slot::Map(id)) => reconcile_map(doc, &id, fields),
        (Value::Object(fields), _) => {
            let id = doc.put_object(obj, prop, ObjType::Map).map_err(am_err)?;
            reconcile_map(doc, &id, fields)
        }
        (Value::Array(items), Slot::List(id)) => reconcile_list(doc, &id, items),
        (Value::Array(items), _) => {
            let id = doc.put_object(obj, prop, ObjType::List).map_err(am_err)?;
            for (index, item) in items.iter().enumerate() {
                insert_item(doc, &id, index, item)?;
            }
            Ok(())
        }
        (scalar, Slot::Scalar(existing)) if scalar_to_json(&existing) == *scalar => Ok(()),
        (scalar, _) => doc.put(obj, prop, json_to_scalar(scalar)).map_err(am_err),
    }
}

fn reconcile_map(doc: &mut AutoCommit, obj: &ObjId, fields: &Map<String, Value>) -> Result<()> {
    let stale: Vec<String> = doc
        .keys(obj)
        .filter(|key| !fields.contains_key(key.as_str()))
        .collect();
    for key in stale {
        doc.delete(obj, key.as_str()).map_err(am_err)?;
    }
    for (key, value) in fields {
        put_at(doc, obj, Prop::from(key.as_str()), value)?;
    }
    Ok(())
}

fn reconcile_list(doc: &mut AutoCommit, obj: &ObjId, items: &[Value]) -> Result<()> {
    let len = doc.length(obj);
    for (index, item) in items.iter().enumerate() {
        if index < len {
            put_at(doc, obj, Prop::from(index), item)?;
        } else {
            insert_item(doc, obj, index, item)?;
        }
    }
    for index in (items.len()..len).rev() {
        doc.delete(obj, index).map_err(am_err)?;
    }
    Ok(())
}

fn insert_item(doc: &mut AutoCommit, list: &ObjId, index: usize, value: &Value) -> Result<()> {
    match value {
        Value::Object(fields) => {
            let id = doc
                .insert_object(list, index, ObjType::Map)
                .map_err(am_err)?;
            reconcile_map(doc, &id, fields)
        }
        Value::Array(items) => {
            let id = doc
                .insert_object(list, index, ObjType::List)
                .map_err(am_err)?;
            for (i, item) in items.iter().enumerate() {
                insert_item(doc, &id, i, item)?;
            }
            Ok(())
        }
        scalar => doc
            .insert(list, index, json_to_scalar(scalar))
            .map_err(am_err),
    }
}

/// Read a whole document as JSON.
pub(crate) fn doc_to_json(doc: &AutoCommit) -> Value {
    read_object(doc, &ROOT, ObjType::Map)
}

fn read_object(doc: &AutoCommit, obj: &ObjId, kind: ObjType) -> Value {
    match kind {
        ObjType::List => {
            let items = (0..doc.length(obj))
                .filter_map(|index| doc.get(obj, index).ok().flatten())
                .map(|(value, id)| read_value(doc, value, &id))
                .collect();
            Value::Array(items)
        }
        ObjType::Text => Value::String(doc.text(obj).unwrap_or_default()),
        _ => {
            let mut map = Map::new();
            for key in doc.keys(obj) {
                if let Ok(Some((value, id))) = doc.get(obj, key.as_str()) {
                    let value = read_value(doc, value, &id);
                    map.insert(key, value);
                }
            }
            Value::Object(map)
        }
    }
}

fn read_value(doc: &AutoCommit, value: automerge::Value<'_>, id: &ObjId) -> Value {
    match value {
        automerge::Value::Object(kind) => read_object(doc, id, kind),
        automerge::Value::Scalar(scalar) => scalar_to_json(&scalar),
    }
}

/// Convert a JSON scalar to an Automerge scalar
fn json_to_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => ScalarValue::Str(s.as_str().into()),
        Value::Null | Value::Array(_) | Value::Object(_) => ScalarValue::Null,
    }
}

/// Convert an Automerge scalar to JSON
fn scalar_to_json(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Null => Value::Null,
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Int(i) => Value::from(*i),
        ScalarValue::Uint(u) => Value::from(*u),
        ScalarValue::F64(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        ScalarValue::Str(s) => Value::String(s.to_string()),
        ScalarValue::Bytes(b) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        other => other.to_i64().map_or(Value::Null, Value::from),
    }
}
