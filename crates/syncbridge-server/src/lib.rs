//! syncbridge server library
//!
//! Re-exports the server modules for use by the binary and integration tests.

use std::sync::Arc;
use std::time::Duration;

use syncbridge::{Authenticator, Store, SyncEngine};
use tokio::sync::watch;

pub mod api;
pub mod db;
pub mod link;

/// Shared application state
pub struct AppState {
    /// The running sync engine
    pub engine: SyncEngine,
    /// Document store replicated over `/sync`
    pub store: Arc<Store>,
    /// Issued access tokens
    pub tokens: Arc<db::TokenRegistry>,
    /// Checks bearer tokens on every authenticated route
    pub authenticator: Arc<dyn Authenticator>,
    /// Password guarding token management
    pub admin_password: String,
    /// Limit on a single authentication call
    pub auth_timeout: Duration,
    /// Fires when the server is shutting down
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// State that authenticates callers against `tokens`.
    pub fn new(
        engine: SyncEngine,
        store: Arc<Store>,
        tokens: Arc<db::TokenRegistry>,
        admin_password: impl Into<String>,
        auth_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let authenticator: Arc<dyn Authenticator> = Arc::clone(&tokens) as Arc<dyn Authenticator>;
        Self {
            engine,
            store,
            tokens,
            authenticator,
            admin_password: admin_password.into(),
            auth_timeout,
            shutdown,
        }
    }
}
