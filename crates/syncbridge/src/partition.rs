//! Partition document layout.
//!
//! ```text
//! {
//!   "__meta": { "todos": { "idField": "id", "paginate": { "default": 10, "max": 10 } } },
//!   "todos":  { "1": { "id": 1, "title": "milk", "__change": "…" } }
//! }
//! ```
//!
//! Records are keyed by the string form of their id field. Every record
//! carries the [`ChangeTag`] of the write that produced it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::service::Pagination;
use crate::tag::{ChangeTag, CHANGE_TAG_FIELD};

/// Reserved top-level key holding per-service metadata.
pub const META_KEY: &str = "__meta";

/// Per-service metadata stored under [`META_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeta {
    /// Name of the record id field.
    pub id_field: String,
    /// Page sizes for document-backed `find`.
    pub paginate: Pagination,
}

/// String key of a record, if its id field is a string or number.
#[must_use]
pub fn record_id(record: &Value, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Return the record's key, writing a fresh UUID into `id_field` if absent.
pub fn ensure_record_id(record: &mut Value, id_field: &str) -> Option<String> {
    if let Some(id) = record_id(record, id_field) {
        return Some(id);
    }
    let fields = record.as_object_mut()?;
    let id = Uuid::new_v4().to_string();
    fields.insert(id_field.to_string(), Value::String(id.clone()));
    Some(id)
}

/// Split a stored record into its payload and tag.
#[must_use]
pub fn split_tag(record: &Value) -> (Value, Option<ChangeTag>) {
    let tag = ChangeTag::from_record(record);
    let mut payload = record.clone();
    if let Some(fields) = payload.as_object_mut() {
        fields.remove(CHANGE_TAG_FIELD);
    }
    (payload, tag)
}

/// A copy of `record` stamped with `tag`.
#[must_use]
pub fn with_tag(record: &Value, tag: &ChangeTag) -> Value {
    let mut stamped = record.clone();
    if let Some(fields) = stamped.as_object_mut() {
        fields.insert(
            CHANGE_TAG_FIELD.to_string(),
            Value::String(tag.as_str().to_string()),
        );
    }
    stamped
}

/// Assembles the initial contents of a partition.
#[derive(Debug, Default)]
pub struct PartitionBuilder {
    meta: Map<String, Value>,
    services: Map<String, Value>,
}

impl PartitionBuilder {
    /// Add a service map seeded with `records`, each stamped with its own
    /// fresh tag. Records that are not objects are dropped.
    #[must_use]
    pub fn with_service(mut self, path: &str, meta: &ServiceMeta, records: Vec<Value>) -> Self {
        let mut map = Map::new();
        for mut record in records {
            let Some(id) = ensure_record_id(&mut record, &meta.id_field) else {
                continue;
            };
            map.insert(id, with_tag(&record, &ChangeTag::generate()));
        }
        self.meta.insert(
            path.to_string(),
            serde_json::to_value(meta).unwrap_or(Value::Null),
        );
        self.services.insert(path.to_string(), Value::Object(map));
        self
    }

    /// The partition document as JSON.
    #[must_use]
    pub fn build(self) -> Value {
        let mut root = self.services;
        root.insert(META_KEY.to_string(), Value::Object(self.meta));
        Value::Object(root)
    }
}

/// Read-only view over a partition snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PartitionView<'a> {
    root: &'a Value,
}

impl<'a> PartitionView<'a> {
    /// Wrap a snapshot.
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// Service paths that have a record map.
    pub fn service_paths(&self) -> impl Iterator<Item = &'a str> {
        self.root
            .as_object()
            .into_iter()
            .flat_map(|fields| fields.iter())
            .filter(|(key, value)| key.as_str() != META_KEY && value.is_object())
            .map(|(key, _)| key.as_str())
    }

    /// Metadata recorded for `path`.
    #[must_use]
    pub fn meta(&self, path: &str) -> Option<ServiceMeta> {
        let meta = self.root.get(META_KEY)?.get(path)?;
        serde_json::from_value(meta.clone()).ok()
    }

    /// Records stored for `path`, keyed by id.
    pub fn records(&self, path: &str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.root
            .get(path)
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|records| records.iter())
            .map(|(id, record)| (id.as_str(), record))
    }

    /// One record.
    #[must_use]
    pub fn record(&self, path: &str, id: &str) -> Option<&'a Value> {
        self.root.get(path)?.get(id)
    }
}
