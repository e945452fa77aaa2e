//! Hub/spoke link
//!
//! A hub owns the root catalog and accepts WebSocket sync connections (see
//! [`crate::api`]). A spoke discovers the hub's root catalog, keeps a
//! WebSocket to the hub open with capped exponential backoff and waits for
//! the catalog to replicate before the engine starts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use syncbridge::auth::with_timeout;
use syncbridge::catalog::RootRecord;
use syncbridge::sync::{run_session, SessionRole};
use syncbridge::{AccessTokenProvider, CatalogEntry, Config, Error, Query, Result, RootCatalog, Store};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as ClientMessage;
use tracing::{debug, info, warn};

/// Frames buffered per direction on one socket
const SOCKET_BUFFER: usize = 256;

/// First reconnect delay
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// How long `stop` waits for the connect loop
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Hub URLs derived from the configured remote url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// `GET` the root catalog reference
    pub catalog: String,
    /// `POST` new partitions
    pub partitions: String,
    /// WebSocket sync endpoint
    pub sync: String,
}

impl Endpoints {
    /// Accepts `http(s)://` or `ws(s)://` base urls.
    pub fn from_remote(remote: &str) -> Result<Self> {
        let remote = remote.trim_end_matches('/');
        let (http, ws) = if let Some(rest) = remote.strip_prefix("https://") {
            (remote.to_string(), format!("wss://{rest}"))
        } else if let Some(rest) = remote.strip_prefix("http://") {
            (remote.to_string(), format!("ws://{rest}"))
        } else if let Some(rest) = remote.strip_prefix("wss://") {
            (format!("https://{rest}"), remote.to_string())
        } else if let Some(rest) = remote.strip_prefix("ws://") {
            (format!("http://{rest}"), remote.to_string())
        } else {
            return Err(Error::config(format!("unsupported remote url `{remote}`")));
        };

        Ok(Self {
            catalog: format!("{http}/catalog"),
            partitions: format!("{http}/automerge"),
            sync: format!("{ws}/sync"),
        })
    }
}

/// This node's place in the topology, plus the root catalog it serves.
pub struct Link {
    root: RootCatalog,
    task: Option<JoinHandle<()>>,
}

impl Link {
    /// Hub startup: reopen or create the root catalog.
    pub async fn hub(store: &Store, config: &Config) -> Result<Self> {
        let root = RootCatalog::load_or_create(store, config).await?;
        info!(root = %root.url(), "Running as hub");
        Ok(Self { root, task: None })
    }

    /// Spoke startup.
    ///
    /// Resolves the root catalog reference (persisted, or discovered from
    /// the hub), asks the hub for `initial_queries`, starts the connect loop
    /// and waits for the root catalog to arrive.
    pub async fn spoke(
        store: Arc<Store>,
        config: &Config,
        tokens: Arc<dyn AccessTokenProvider>,
        initial_queries: &[Query],
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let remote = config
            .remote_url
            .as_deref()
            .ok_or_else(|| Error::config("spoke mode needs a remote url"))?;
        let endpoints = Endpoints::from_remote(remote)?;
        let http = reqwest::Client::new();
        let auth_timeout = config.auth_timeout();

        let token = with_timeout(auth_timeout, "access token", tokens.access_token()).await?;

        let record_path = config.root_record_path();
        let record = if let Some(record) = RootRecord::load(&record_path).await? {
            record
        } else {
            let record = with_timeout(
                auth_timeout,
                "catalog discovery",
                discover(&http, &endpoints, &token),
            )
            .await?;
            record.save(&record_path).await?;
            info!(root = %record.root_document_id, "Discovered root catalog");
            record
        };

        for query in initial_queries {
            match with_timeout(
                auth_timeout,
                "partition request",
                request_partition(&http, &endpoints, &token, query),
            )
            .await
            {
                Ok(entry) => debug!(url = %entry.url, "Hub holds initial partition"),
                Err(e) => warn!(error = %e, "Failed to request initial partition"),
            }
        }

        let root = RootCatalog::open(&store, &record.root_document_id).await?;
        let task = tokio::spawn(connect_loop(
            store,
            endpoints.sync.clone(),
            tokens,
            auth_timeout,
            config.max_reconnect_backoff(),
            shutdown,
        ));

        if let Err(e) = root.wait_available(config.root_wait_timeout()).await {
            task.abort();
            return Err(e);
        }
        info!(root = %root.url(), hub = %endpoints.sync, "Running as spoke");
        Ok(Self {
            root,
            task: Some(task),
        })
    }

    /// The root catalog
    #[must_use]
    pub fn root(&self) -> &RootCatalog {
        &self.root
    }

    /// Whether this node follows a hub
    #[must_use]
    pub fn is_spoke(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the connect loop to finish after shutdown has fired.
    pub async fn stop(self) {
        let Some(task) = self.task else {
            return;
        };
        let abort = task.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
            warn!("Sync connection did not stop in time, aborting");
            abort.abort();
        }
    }
}

async fn discover(http: &reqwest::Client, endpoints: &Endpoints, token: &str) -> Result<RootRecord> {
    let response = http
        .get(&endpoints.catalog)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| Error::connection(format!("catalog discovery failed: {e}")))?;
    check_status(response)?
        .json()
        .await
        .map_err(|e| Error::connection(format!("invalid catalog response: {e}")))
}

async fn request_partition(
    http: &reqwest::Client,
    endpoints: &Endpoints,
    token: &str,
    query: &Query,
) -> Result<CatalogEntry> {
    let response = http
        .post(&endpoints.partitions)
        .bearer_auth(token)
        .json(query)
        .send()
        .await
        .map_err(|e| Error::connection(format!("partition request failed: {e}")))?;
    check_status(response)?
        .json()
        .await
        .map_err(|e| Error::connection(format!("invalid partition response: {e}")))
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        reqwest::StatusCode::UNAUTHORIZED => Err(Error::unauthorized("hub rejected the access token")),
        reqwest::StatusCode::FORBIDDEN => Err(Error::forbidden("hub denied the request")),
        status if !status.is_success() => Err(Error::connection(format!("hub answered {status}"))),
        _ => Ok(response),
    }
}

async fn connect_loop(
    store: Arc<Store>,
    sync_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
    auth_timeout: Duration,
    max_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_once(&store, &sync_url, tokens.as_ref(), auth_timeout, shutdown.clone()).await {
            Ok(()) => {
                info!(hub = %sync_url, "Sync connection closed");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => warn!(hub = %sync_url, error = %e, retry_in = ?backoff, "Sync connection failed"),
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(max_backoff);
    }
    debug!("Spoke connect loop stopped");
}

async fn connect_once(
    store: &Arc<Store>,
    sync_url: &str,
    tokens: &dyn AccessTokenProvider,
    auth_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let token = with_timeout(auth_timeout, "access token", tokens.access_token()).await?;
    let request = client_request(sync_url, &token)?;
    let (socket, _) = with_timeout(auth_timeout, "sync connection", async {
        tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::connection(format!("failed to connect: {e}")))
    })
    .await?;

    info!(hub = %sync_url, "Connected to hub");
    pump(
        socket,
        Arc::clone(store),
        SessionRole::Initiator,
        shutdown,
        |bytes| ClientMessage::Binary(bytes.into()),
        |message| match message {
            ClientMessage::Binary(bytes) => Inbound::Frame(bytes.to_vec()),
            ClientMessage::Close(_) => Inbound::Close,
            _ => Inbound::Ignore,
        },
    )
    .await
}

fn client_request(url: &str, token: &str) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::config(format!("invalid sync url: {e}")))?;
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| Error::config("access token is not a valid header value"))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

/// Run a responder session over an accepted WebSocket.
pub async fn serve_socket(socket: WebSocket, store: Arc<Store>, shutdown: watch::Receiver<bool>) {
    let result = pump(
        socket,
        store,
        SessionRole::Responder,
        shutdown,
        |bytes| AxumMessage::Binary(bytes.into()),
        |message| match message {
            AxumMessage::Binary(bytes) => Inbound::Frame(bytes.to_vec()),
            AxumMessage::Close(_) => Inbound::Close,
            _ => Inbound::Ignore,
        },
    )
    .await;

    match result {
        Ok(()) => debug!("Sync connection closed"),
        Err(e) => warn!(error = %e, "Sync connection ended with error"),
    }
}

/// What a socket message means to the session.
enum Inbound {
    Frame(Vec<u8>),
    Close,
    Ignore,
}

/// Bridge a message socket to a replication session.
async fn pump<S, M, E>(
    socket: S,
    store: Arc<Store>,
    role: SessionRole,
    shutdown: watch::Receiver<bool>,
    outbound: fn(Vec<u8>) -> M,
    inbound: fn(M) -> Inbound,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<M, E>> + Sink<M> + Send + 'static,
    <S as Sink<M>>::Error: fmt::Display + Send + 'static,
    M: Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(SOCKET_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(SOCKET_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if let Err(e) = sink.send(outbound(bytes)).await {
                debug!(error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) => match inbound(message) {
                    Inbound::Frame(bytes) => {
                        if in_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Inbound::Close => break,
                    Inbound::Ignore => {}
                },
                Err(e) => {
                    debug!(error = %e, "Socket read failed");
                    break;
                }
            }
        }
    });

    let result = run_session(store, role, out_tx, in_rx, shutdown).await;
    reader.abort();
    let abort = writer.abort_handle();
    if tokio::time::timeout(STOP_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
    result
}
