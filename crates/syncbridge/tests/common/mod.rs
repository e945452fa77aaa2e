//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch};

use syncbridge::partition::record_id;
use syncbridge::service::{FindParams, Page, Pagination};
use syncbridge::sync::{run_session, SessionRole};
use syncbridge::{
    Config, EventContext, MemoryService, Query, QueryMatchStrategy, RootCatalog, ServiceEvent,
    ServiceRegistry, SourceService, Store, SyncEngine, SyncStrategy,
};

/// A memory service that counts the mutating calls made on it.
pub struct Counting {
    pub inner: MemoryService,
    pub creates: AtomicUsize,
    pub patches: AtomicUsize,
    pub removes: AtomicUsize,
}

impl Counting {
    pub fn new(records: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryService::new("id").with_records(records),
            creates: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        })
    }

    pub fn record(&self, id: &str) -> Option<Value> {
        self.inner
            .records()
            .into_iter()
            .find(|record| record_id(record, "id").as_deref() == Some(id))
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceService for Counting {
    fn id_field(&self) -> &str {
        self.inner.id_field()
    }

    fn pagination(&self) -> Pagination {
        self.inner.pagination()
    }

    async fn find(&self, query: &Query, params: FindParams) -> syncbridge::Result<Page> {
        self.inner.find(query, params).await
    }

    async fn get(&self, id: &str) -> syncbridge::Result<Value> {
        self.inner.get(id).await
    }

    async fn create(&self, data: Value, context: EventContext) -> syncbridge::Result<Value> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(data, context).await
    }

    async fn patch(&self, id: &str, data: Value, context: EventContext) -> syncbridge::Result<Value> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        self.inner.patch(id, data, context).await
    }

    async fn update(&self, id: &str, data: Value, context: EventContext) -> syncbridge::Result<Value> {
        self.inner.update(id, data, context).await
    }

    async fn remove(&self, id: &str, context: EventContext) -> syncbridge::Result<Value> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(id, context).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.subscribe()
    }
}

/// One engine with a `todos` service, backed by its own directory.
pub struct Node {
    pub dir: TempDir,
    pub config: Config,
    pub store: Arc<Store>,
    pub engine: SyncEngine,
    pub todos: Arc<Counting>,
}

pub fn registry(todos: &Arc<Counting>) -> ServiceRegistry {
    let service: Arc<dyn SourceService> = Arc::clone(todos) as Arc<dyn SourceService>;
    ServiceRegistry::new().with("todos", service).unwrap()
}

/// Start a hub node with the default query-matching strategy.
pub async fn hub(records: Vec<Value>) -> Node {
    let todos = Counting::new(records);
    let strategy = Arc::new(QueryMatchStrategy::new(registry(&todos)));
    hub_with(todos, strategy).await
}

/// Route engine logs to the test output; set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a hub node with a custom strategy.
pub async fn hub_with(todos: Arc<Counting>, strategy: Arc<dyn SyncStrategy>) -> Node {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path());
    let store = Arc::new(Store::new(&config).unwrap());
    let root = RootCatalog::load_or_create(&store, &config).await.unwrap();
    let engine = SyncEngine::start(Arc::clone(&store), root, registry(&todos), strategy, &config)
        .await
        .unwrap();
    Node {
        dir,
        config,
        store,
        engine,
        todos,
    }
}

/// Wire two stores together with a replication session on each end.
///
/// Sending `true` on the returned channel disconnects them.
pub fn link(initiator: &Arc<Store>, responder: &Arc<Store>) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (to_responder, from_initiator) = mpsc::channel(1024);
    let (to_initiator, from_responder) = mpsc::channel(1024);
    tokio::spawn(run_session(
        Arc::clone(initiator),
        SessionRole::Initiator,
        to_responder,
        from_responder,
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_session(
        Arc::clone(responder),
        SessionRole::Responder,
        to_initiator,
        from_initiator,
        shutdown_rx,
    ));
    shutdown_tx
}

/// Start a spoke replicating `hub`'s root catalog over an in-process link.
pub async fn spoke(hub: &Node) -> (Node, watch::Sender<bool>) {
    init_tracing();
    let todos = Counting::new(Vec::new());
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path()).with_remote_url("ws://hub.invalid");
    let store = Arc::new(Store::new(&config).unwrap());

    let connection = link(&store, &hub.store);
    let root = RootCatalog::open(&store, hub.engine.root().url()).await.unwrap();
    root.wait_available(Duration::from_secs(5)).await.unwrap();

    let strategy = Arc::new(QueryMatchStrategy::new(registry(&todos)));
    let engine = SyncEngine::start(Arc::clone(&store), root, registry(&todos), strategy, &config)
        .await
        .unwrap();
    let node = Node {
        dir,
        config,
        store,
        engine,
        todos,
    };
    (node, connection)
}

/// Shut a node down and start it again from its data directory.
///
/// The `todos` service is kept, as an external database would be. Spokes
/// reopen the root catalog they replicate; hubs reload their own.
pub async fn restart(node: Node) -> Node {
    let root_url = node.engine.root().url().clone();
    node.engine.shutdown().await;
    node.store.flush().await.unwrap();
    let Node {
        dir, config, todos, ..
    } = node;

    let store = Arc::new(Store::new(&config).unwrap());
    let root = if config.is_spoke() {
        let root = RootCatalog::open(&store, &root_url).await.unwrap();
        root.wait_available(Duration::from_secs(5)).await.unwrap();
        root
    } else {
        RootCatalog::load_or_create(&store, &config).await.unwrap()
    };
    assert_eq!(root.url(), &root_url);

    let strategy = Arc::new(QueryMatchStrategy::new(registry(&todos)));
    let engine = SyncEngine::start(Arc::clone(&store), root, registry(&todos), strategy, &config)
        .await
        .unwrap();
    Node {
        dir,
        config,
        store,
        engine,
        todos,
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(check: impl FnMut() -> bool) {
    eventually_within(Duration::from_secs(5), check).await;
}

/// Poll `check` every 10ms until it holds, failing the test after `limit`.
pub async fn eventually_within(limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached in time");
}

/// Give background tasks time to do anything they still might.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

pub fn query(value: Value) -> Query {
    value.as_object().cloned().unwrap_or_default()
}
