//! In-memory source service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{query, EventContext, EventKind, FindParams, Page, Pagination, ServiceEvent, SourceService};
use crate::catalog::Query;
use crate::error::{Error, Result};
use crate::partition::ensure_record_id;
use crate::DEFAULT_CHANNEL_CAPACITY;

/// Records kept in a map, keyed by the string form of their id.
///
/// `create` with an id that already exists replaces the record.
pub struct MemoryService {
    id_field: String,
    pagination: Pagination,
    records: RwLock<BTreeMap<String, Value>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl MemoryService {
    /// Empty service using `id_field` as the id.
    #[must_use]
    pub fn new(id_field: impl Into<String>) -> Self {
        Self::with_capacity(id_field, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Empty service whose event channel holds `capacity` events.
    #[must_use]
    pub fn with_capacity(id_field: impl Into<String>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            id_field: id_field.into(),
            pagination: Pagination::default(),
            records: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Set the page sizes.
    #[must_use]
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Preload records without emitting events.
    #[must_use]
    pub fn with_records(self, records: impl IntoIterator<Item = Value>) -> Self {
        {
            let mut map = self.records.write();
            for mut record in records {
                if let Some(id) = ensure_record_id(&mut record, &self.id_field) {
                    map.insert(id, record);
                }
            }
        }
        self
    }

    /// Every record in id order.
    #[must_use]
    pub fn records(&self) -> Vec<Value> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the service holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn emit(&self, kind: EventKind, record: &Value, context: EventContext) {
        // Nobody listening is fine.
        let _ = self.events.send(ServiceEvent {
            kind,
            record: record.clone(),
            context,
        });
    }

    fn require_object(data: &Value) -> Result<()> {
        if data.is_object() {
            Ok(())
        } else {
            Err(Error::apply("record must be a JSON object"))
        }
    }
}

#[async_trait]
impl SourceService for MemoryService {
    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn pagination(&self) -> Pagination {
        self.pagination
    }

    async fn find(&self, query: &Query, params: FindParams) -> Result<Page> {
        Ok(query::paginate(self.records(), query, params, self.pagination))
    }

    async fn get(&self, id: &str) -> Result<Value> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no record with id {id}")))
    }

    async fn create(&self, mut data: Value, context: EventContext) -> Result<Value> {
        Self::require_object(&data)?;
        let id = ensure_record_id(&mut data, &self.id_field)
            .ok_or_else(|| Error::apply("record has no usable id"))?;
        self.records.write().insert(id, data.clone());
        self.emit(EventKind::Created, &data, context);
        Ok(data)
    }

    async fn patch(&self, id: &str, data: Value, context: EventContext) -> Result<Value> {
        let Value::Object(changes) = data else {
            return Err(Error::apply("patch must be a JSON object"));
        };
        let patched = {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no record with id {id}")))?;
            if let Some(fields) = record.as_object_mut() {
                for (key, value) in changes {
                    if key != self.id_field {
                        fields.insert(key, value);
                    }
                }
            }
            record.clone()
        };
        self.emit(EventKind::Patched, &patched, context);
        Ok(patched)
    }

    async fn update(&self, id: &str, mut data: Value, context: EventContext) -> Result<Value> {
        Self::require_object(&data)?;
        let updated = {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no record with id {id}")))?;
            if let (Some(fields), Some(existing_id)) =
                (data.as_object_mut(), record.get(&self.id_field))
            {
                fields.insert(self.id_field.clone(), existing_id.clone());
            }
            *record = data;
            record.clone()
        };
        self.emit(EventKind::Updated, &updated, context);
        Ok(updated)
    }

    async fn remove(&self, id: &str, context: EventContext) -> Result<Value> {
        let removed = self
            .records
            .write()
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("no record with id {id}")))?;
        self.emit(EventKind::Removed, &removed, context);
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_emits_events() {
        let service = MemoryService::new("id");
        let mut events = service.subscribe();

        let created = service
            .create(json!({"id": 1, "title": "milk"}), EventContext::default())
            .await
            .unwrap();
        assert_eq!(created, json!({"id": 1, "title": "milk"}));

        let patched = service
            .patch("1", json!({"done": true, "id": 99}), EventContext::default())
            .await
            .unwrap();
        assert_eq!(patched, json!({"id": 1, "title": "milk", "done": true}));

        let updated = service
            .update("1", json!({"title": "eggs"}), EventContext::default())
            .await
            .unwrap();
        assert_eq!(updated, json!({"id": 1, "title": "eggs"}));

        service.remove("1", EventContext::default()).await.unwrap();
        assert!(service.get("1").await.unwrap_err().is_not_found());

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Created,
                EventKind::Patched,
                EventKind::Updated,
                EventKind::Removed
            ]
        );
    }

    #[tokio::test]
    async fn test_create_generates_id_and_keeps_context() {
        let service = MemoryService::new("_id");
        let mut events = service.subscribe();
        let context = EventContext {
            change_tag: Some("t1".into()),
            initial_sync: true,
        };

        let created = service
            .create(json!({"title": "milk"}), context.clone())
            .await
            .unwrap();

        assert!(created["_id"].is_string());
        assert_eq!(events.try_recv().unwrap().context, context);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let service = MemoryService::new("id");
        assert!(service
            .patch("x", json!({}), EventContext::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(service
            .remove("x", EventContext::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(service
            .create(json!("scalar"), EventContext::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_find_with_preloaded_records() {
        let service = MemoryService::new("id").with_records(vec![
            json!({"id": 1, "username": "alice"}),
            json!({"id": 2, "username": "bob"}),
            json!({"id": 3, "username": "alice"}),
        ]);
        let query = json!({"username": "alice"}).as_object().unwrap().clone();

        let page = service.find(&query, FindParams::all()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(service.len(), 3);
    }
}
