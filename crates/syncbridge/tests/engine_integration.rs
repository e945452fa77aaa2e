//! Integration tests for the sync engine on a single node
//!
//! Partition documents are mutated directly to stand in for changes
//! replicated from a peer.
//!
//! Run: `cargo test -p syncbridge --test engine_integration`

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::{eventually, eventually_within, hub, hub_with, query, registry, settle, Counting};
use syncbridge::catalog::CatalogEntry;
use syncbridge::partition::{split_tag, with_tag, PartitionBuilder, ServiceMeta, META_KEY};
use syncbridge::service::query as service_query;
use syncbridge::{
    Caller, ChangeTag, Config, Document, Error, EventContext, Query, QueryMatchStrategy,
    RootCatalog, SourceService, Store, SyncEngine, SyncStrategy, DEFAULT_CHANNEL_CAPACITY,
};

/// Write `record` into a partition as a peer would, with a fresh tag.
fn remote_put(doc: &Document, id: &str, record: Value) {
    let stamped = with_tag(&record, &ChangeTag::generate());
    doc.change(|d| d.put(&["todos", id], &stamped)).unwrap();
}

fn tag_of(doc: &Document, id: &str) -> Option<ChangeTag> {
    doc.get(&["todos", id])
        .as_ref()
        .and_then(ChangeTag::from_record)
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let node = hub(Vec::new()).await;

    let first = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let second = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(node.engine.find(None).await.unwrap(), vec![first]);
    // Root catalog plus one partition
    assert_eq!(node.store.list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_partition_seeded_from_service() {
    let node = hub(vec![
        json!({"id": 1, "title": "a", "username": "alice"}),
        json!({"id": 2, "title": "b", "username": "bob"}),
    ])
    .await;

    let entry = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let snapshot = node.engine.get(&entry.url, None).await.unwrap();

    let records = snapshot["todos"].as_object().unwrap();
    assert_eq!(records.len(), 1);
    let (payload, tag) = split_tag(&records["1"]);
    assert_eq!(payload, json!({"id": 1, "title": "a", "username": "alice"}));
    assert!(tag.is_some());
    assert_eq!(snapshot[META_KEY]["todos"]["idField"], json!("id"));

    settle().await;
    assert_eq!(node.todos.creates(), 0);
}

#[tokio::test]
async fn test_service_create_does_not_echo() {
    let node = hub(Vec::new()).await;
    let entry = node.engine.create(Query::new(), None).await.unwrap();
    let doc = node.engine.partition(&entry.url).unwrap();

    node.todos
        .create(json!({"id": "t1", "title": "write tests"}), EventContext::default())
        .await
        .unwrap();

    eventually(|| doc.get(&["todos", "t1"]).is_some()).await;
    assert!(tag_of(&doc, "t1").is_some());
    assert_eq!(doc.snapshot()["todos"].as_object().unwrap().len(), 1);

    settle().await;
    assert_eq!(node.todos.creates(), 1);
    assert_eq!(node.todos.patches(), 0);
    assert_eq!(node.todos.inner.len(), 1);
}

#[tokio::test]
async fn test_document_changes_reach_service() {
    let node = hub(Vec::new()).await;
    let entry = node.engine.create(Query::new(), None).await.unwrap();
    let doc = node.engine.partition(&entry.url).unwrap();

    remote_put(&doc, "r1", json!({"id": "r1", "title": "remote", "done": false}));
    eventually(|| node.todos.record("r1").is_some()).await;
    assert_eq!(
        node.todos.record("r1").unwrap(),
        json!({"id": "r1", "title": "remote", "done": false})
    );

    remote_put(&doc, "r1", json!({"id": "r1", "title": "remote", "done": true}));
    eventually(|| node.todos.record("r1").is_some_and(|r| r["done"] == json!(true))).await;

    doc.change(|d| d.delete(&["todos", "r1"])).unwrap();
    eventually(|| node.todos.record("r1").is_none()).await;

    settle().await;
    assert_eq!(node.todos.creates(), 1);
    assert_eq!(node.todos.patches(), 1);
    assert_eq!(node.todos.removes(), 1);
}

#[tokio::test]
async fn test_service_changes_reach_document() {
    let node = hub(vec![json!({"id": "1", "title": "seed"})]).await;
    let entry = node.engine.create(Query::new(), None).await.unwrap();
    let doc = node.engine.partition(&entry.url).unwrap();
    let seeded_tag = tag_of(&doc, "1").unwrap();

    node.todos
        .patch("1", json!({"title": "renamed"}), EventContext::default())
        .await
        .unwrap();
    eventually(|| doc.get(&["todos", "1", "title"]) == Some(json!("renamed"))).await;
    assert_ne!(tag_of(&doc, "1").unwrap(), seeded_tag);

    node.todos.remove("1", EventContext::default()).await.unwrap();
    eventually(|| doc.get(&["todos", "1"]).is_none()).await;

    settle().await;
    assert_eq!(node.todos.removes(), 1);
    assert_eq!(node.todos.patches(), 1);
}

#[tokio::test]
async fn test_repartitioning_moves_record() {
    let node = hub(Vec::new()).await;
    let alice = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let bob = node
        .engine
        .create(query(json!({"username": "bob"})), None)
        .await
        .unwrap();
    let alice_doc = node.engine.partition(&alice.url).unwrap();
    let bob_doc = node.engine.partition(&bob.url).unwrap();

    node.todos
        .create(json!({"id": "1", "username": "alice"}), EventContext::default())
        .await
        .unwrap();
    eventually(|| alice_doc.get(&["todos", "1"]).is_some()).await;
    assert!(bob_doc.get(&["todos", "1"]).is_none());

    node.todos
        .patch("1", json!({"username": "bob"}), EventContext::default())
        .await
        .unwrap();
    eventually(|| alice_doc.get(&["todos", "1"]).is_none()).await;
    eventually(|| bob_doc.get(&["todos", "1", "username"]) == Some(json!("bob"))).await;

    settle().await;
    assert_eq!(node.todos.removes(), 0);
    assert!(node.todos.record("1").is_some());
}

#[tokio::test]
async fn test_peer_move_keeps_record() {
    let node = hub(Vec::new()).await;
    let alice = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let bob = node
        .engine
        .create(query(json!({"username": "bob"})), None)
        .await
        .unwrap();
    let alice_doc = node.engine.partition(&alice.url).unwrap();
    let bob_doc = node.engine.partition(&bob.url).unwrap();

    node.todos
        .create(json!({"id": "1", "username": "alice"}), EventContext::default())
        .await
        .unwrap();
    eventually(|| alice_doc.get(&["todos", "1"]).is_some()).await;

    // A peer moved the record: new version in bob's partition, then the
    // stale copy deleted from alice's.
    remote_put(&bob_doc, "1", json!({"id": "1", "username": "bob"}));
    alice_doc.change(|d| d.delete(&["todos", "1"])).unwrap();

    eventually(|| {
        node.todos
            .record("1")
            .is_some_and(|record| record["username"] == json!("bob"))
    })
    .await;
    settle().await;
    assert_eq!(node.todos.removes(), 0);
    assert!(alice_doc.get(&["todos", "1"]).is_none());
    assert_eq!(bob_doc.get(&["todos", "1", "username"]), Some(json!("bob")));
}

#[tokio::test]
async fn test_record_routed_to_two_partitions() {
    let node = hub(Vec::new()).await;
    let all = node.engine.create(Query::new(), None).await.unwrap();
    let alice = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let all_doc = node.engine.partition(&all.url).unwrap();
    let alice_doc = node.engine.partition(&alice.url).unwrap();

    node.todos
        .create(json!({"id": "1", "username": "alice"}), EventContext::default())
        .await
        .unwrap();
    node.todos
        .create(json!({"id": "2", "username": "bob"}), EventContext::default())
        .await
        .unwrap();

    eventually(|| all_doc.get(&["todos", "1"]).is_some()).await;
    eventually(|| alice_doc.get(&["todos", "1"]).is_some()).await;
    eventually(|| all_doc.get(&["todos", "2"]).is_some()).await;
    assert!(alice_doc.get(&["todos", "2"]).is_none());
    assert_eq!(tag_of(&all_doc, "1"), tag_of(&alice_doc, "1"));

    // An edit from either partition reaches the other one through the service.
    remote_put(&alice_doc, "1", json!({"id": "1", "username": "alice", "done": true}));
    eventually(|| all_doc.get(&["todos", "1", "done"]) == Some(json!(true))).await;
    assert_eq!(tag_of(&all_doc, "1"), tag_of(&alice_doc, "1"));

    settle().await;
    assert_eq!(node.todos.creates(), 2);
    assert_eq!(node.todos.patches(), 1);
    assert_eq!(node.todos.removes(), 0);
}

#[tokio::test]
async fn test_delete_from_one_of_two_partitions() {
    let node = hub(Vec::new()).await;
    let all = node.engine.create(Query::new(), None).await.unwrap();
    let alice = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let all_doc = node.engine.partition(&all.url).unwrap();
    let alice_doc = node.engine.partition(&alice.url).unwrap();

    node.todos
        .create(json!({"id": "1", "username": "alice"}), EventContext::default())
        .await
        .unwrap();
    eventually(|| all_doc.get(&["todos", "1"]).is_some()).await;
    eventually(|| alice_doc.get(&["todos", "1"]).is_some()).await;

    // Deleted by a peer from alice's partition only
    alice_doc.change(|d| d.delete(&["todos", "1"])).unwrap();

    eventually(|| node.todos.record("1").is_none()).await;
    eventually(|| all_doc.get(&["todos", "1"]).is_none()).await;
    settle().await;
    assert_eq!(node.todos.removes(), 1);
    assert!(alice_doc.get(&["todos", "1"]).is_none());
}

#[tokio::test]
async fn test_bridge_catches_up_after_burst() {
    let node = hub(Vec::new()).await;
    let entry = node.engine.create(Query::new(), None).await.unwrap();
    let doc = node.engine.partition(&entry.url).unwrap();
    let burst = DEFAULT_CHANNEL_CAPACITY + DEFAULT_CHANNEL_CAPACITY / 2;

    // No await point yields here, so the bridge falls behind the channel.
    for i in 0..burst {
        node.todos
            .create(json!({"id": format!("r{i}"), "n": i}), EventContext::default())
            .await
            .unwrap();
    }
    let held = || {
        doc.get(&["todos"])
            .and_then(|records| records.as_object().map(|records| records.len()))
            .unwrap_or(0)
    };
    eventually_within(Duration::from_secs(60), || held() == burst).await;
    assert_eq!(doc.get(&["todos", "r0", "n"]), Some(json!(0)));
    let last = format!("r{}", burst - 1);
    assert_eq!(doc.get(&["todos", last.as_str(), "n"]), Some(json!(burst - 1)));

    // Removals made while lagging are caught up the same way.
    for i in 0..burst {
        node.todos
            .remove(&format!("r{i}"), EventContext::default())
            .await
            .unwrap();
    }
    eventually_within(Duration::from_secs(60), || held() == 0).await;

    settle().await;
    assert_eq!(node.todos.creates(), burst);
    assert_eq!(node.todos.removes(), burst);
    assert_eq!(node.todos.patches(), 0);
}

#[tokio::test]
async fn test_access_control() {
    let todos = Counting::new(Vec::new());
    let strategy = Arc::new(QueryMatchStrategy::new(registry(&todos)).with_owner_field("username"));
    let node = hub_with(todos, strategy).await;
    let alice = Caller::new("rest").with_user("alice");

    let denied = node
        .engine
        .create(query(json!({"username": "bob"})), Some(&alice))
        .await;
    assert!(matches!(denied, Err(Error::Forbidden(_))));
    assert!(node.engine.find(None).await.unwrap().is_empty());

    let bobs = node
        .engine
        .create(query(json!({"username": "bob"})), None)
        .await
        .unwrap();
    let alices = node
        .engine
        .create(query(json!({"username": "alice"})), Some(&alice))
        .await
        .unwrap();

    assert_eq!(node.engine.find(Some(&alice)).await.unwrap(), vec![alices.clone()]);
    assert_eq!(node.engine.find(None).await.unwrap().len(), 2);
    assert!(matches!(
        node.engine.get(&bobs.url, Some(&alice)).await,
        Err(Error::NotFound(_))
    ));
    assert!(node.engine.get(&bobs.url, None).await.is_ok());
    assert!(node.engine.get(&alices.url, Some(&alice)).await.is_ok());
    assert!(matches!(
        node.engine.remove(&bobs.url, Some(&alice)).await,
        Err(Error::Forbidden(_))
    ));
    assert!(node.engine.remove(&bobs.url, None).await.is_ok());
}

#[tokio::test]
async fn test_remove_partition() {
    let node = hub(vec![json!({"id": "1"})]).await;
    let entry = node.engine.create(Query::new(), None).await.unwrap();

    let removed = node.engine.remove(&entry.url, None).await.unwrap();
    assert_eq!(removed, entry);
    assert!(node.engine.partition(&entry.url).is_none());
    assert!(node.engine.find(None).await.unwrap().is_empty());
    assert!(!node.store.list().unwrap().contains(&entry.url));
    assert!(matches!(
        node.engine.remove(&entry.url, None).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        node.engine.get(&entry.url, None).await,
        Err(Error::NotFound(_))
    ));

    // Records are untouched by dropping their partition.
    settle().await;
    assert!(node.todos.record("1").is_some());
}

#[tokio::test]
async fn test_catalog_entries_bind_and_unbind() {
    let node = hub(Vec::new()).await;
    let meta = ServiceMeta {
        id_field: "id".into(),
        paginate: node.todos.pagination(),
    };
    let content = PartitionBuilder::default()
        .with_service("todos", &meta, vec![json!({"id": "x", "title": "replicated"})])
        .build();
    let doc = node.store.create(&content).unwrap();
    let entry = CatalogEntry {
        url: doc.url().clone(),
        query: Query::new(),
    };

    // As if the entry had arrived from a peer
    node.engine.root().append(&entry).unwrap();
    eventually(|| node.engine.partition(&entry.url).is_some()).await;
    eventually(|| node.todos.record("x").is_some()).await;

    node.engine.root().remove(&entry.url).unwrap();
    eventually(|| node.engine.partition(&entry.url).is_none()).await;
}

#[tokio::test]
async fn test_restart_rebinds_partitions() {
    let node = hub(Vec::new()).await;
    let entry = node.engine.create(Query::new(), None).await.unwrap();
    node.engine.shutdown().await;
    assert!(matches!(
        node.engine.find(None).await,
        Err(Error::Shutdown)
    ));
    node.store.flush().await.unwrap();

    let config = Config::new(node.dir.path());
    let store = Arc::new(Store::new(&config).unwrap());
    let root = RootCatalog::load_or_create(&store, &config).await.unwrap();
    assert_eq!(root.url(), node.engine.root().url());

    let todos = Counting::new(Vec::new());
    let strategy = Arc::new(QueryMatchStrategy::new(registry(&todos)));
    let engine = SyncEngine::start(Arc::clone(&store), root, registry(&todos), strategy, &config)
        .await
        .unwrap();
    assert_eq!(engine.find(None).await.unwrap(), vec![entry.clone()]);

    let doc = engine.partition(&entry.url).unwrap();
    remote_put(&doc, "after", json!({"id": "after"}));
    eventually(|| todos.record("after").is_some()).await;
    engine.shutdown().await;
}

/// Seeds new `todos` partitions with one unsaved record.
struct SeedingStrategy;

#[async_trait]
impl SyncStrategy for SeedingStrategy {
    async fn can_access(&self, _query: &Query, _caller: &Caller) -> syncbridge::Result<bool> {
        Ok(true)
    }

    async fn initialize_document(
        &self,
        service_path: &str,
        _query: &Query,
        _entries: &[CatalogEntry],
    ) -> syncbridge::Result<Option<Vec<Value>>> {
        Ok((service_path == "todos")
            .then(|| vec![json!({"title": "t1", "completed": false, "username": "alice"})]))
    }

    async fn documents_for_data(
        &self,
        _service_path: &str,
        record: &Value,
        entries: &[CatalogEntry],
    ) -> syncbridge::Result<Vec<CatalogEntry>> {
        Ok(entries
            .iter()
            .filter(|entry| service_query::matches(record, &entry.query))
            .cloned()
            .collect())
    }
}

#[tokio::test]
async fn test_alice_todos_scenario() {
    let todos = Counting::new(Vec::new());
    let node = hub_with(Arc::clone(&todos), Arc::new(SeedingStrategy)).await;

    let entry = node
        .engine
        .create(query(json!({"username": "alice"})), None)
        .await
        .unwrap();
    let doc = node.engine.partition(&entry.url).unwrap();

    let records = doc.snapshot()["todos"].as_object().unwrap().clone();
    assert_eq!(records.len(), 1);
    let (id, record) = records.iter().next().unwrap();
    let id = id.clone();
    assert_eq!(record["id"], json!(id));
    let first_tag = ChangeTag::from_record(record).unwrap();

    // Binding seeds the service with the generated id.
    eventually(|| todos.record(&id).is_some()).await;

    todos
        .patch(&id, json!({"completed": true}), EventContext::default())
        .await
        .unwrap();
    eventually(|| doc.get(&["todos", id.as_str(), "completed"]) == Some(json!(true))).await;
    assert_eq!(doc.snapshot()["todos"].as_object().unwrap().len(), 1);
    assert_ne!(tag_of(&doc, &id).unwrap(), first_tag);

    doc.change(|d| d.delete(&["todos", id.as_str()])).unwrap();
    eventually(|| todos.record(&id).is_none()).await;
    settle().await;
    assert_eq!(todos.removes(), 1);
    assert_eq!(todos.creates(), 1);
}
