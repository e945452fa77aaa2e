//! Configuration for a syncbridge node.
//!
//! This module provides the [`Config`] struct. Configuration covers the storage
//! location, the optional upstream hub, the size and lifetime of the engine's
//! tracking caches, and the timeouts applied to external calls.
//!
//! # Example
//!
//! ```rust
//! use syncbridge::Config;
//!
//! // Hub: only a storage path
//! let config = Config::new("/path/to/storage");
//!
//! // Spoke: replicate from a hub
//! let config = Config::new("/path/to/storage")
//!     .with_remote_url("http://hub.internal:3030")
//!     .with_auth_timeout(10);
//!
//! // Default configuration (uses platform-specific data directory)
//! let config = Config::default();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_AUTH_TIMEOUT_SECS, DEFAULT_CHANNEL_CAPACITY, DEFAULT_FLUSH_INTERVAL_SECS,
    DEFAULT_TRACKING_CAPACITY, DEFAULT_TRACKING_TTL_SECS,
};

/// Name of the file holding the root catalog reference.
pub const ROOT_RECORD_FILE: &str = "syncbridge.json";

/// Configuration for a syncbridge node.
///
/// # Storage Layout
///
/// ```text
/// {storage_path}/
/// ├── syncbridge.json   # {"rootDocumentId": "automerge:..."}
/// ├── tokens.db         # access tokens (server only)
/// └── docs/             # Automerge documents
///     └── *.automerge
/// ```
///
/// # Defaults
///
/// - `remote_url`: `None` (hub mode)
/// - `storage_path`: Platform-specific data directory + "syncbridge"
/// - `flush_interval_secs`: 1 second
/// - `auth_timeout_secs`: 10 seconds
/// - `root_wait_timeout_secs`: 30 seconds
/// - `processed_tag_capacity` / `pending_removal_capacity`: 65536
/// - `tracking_ttl_secs`: 600 seconds
/// - `channel_capacity`: 1024
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the hub to replicate from.
    ///
    /// When set the node runs as a spoke and never creates its own root
    /// catalog. When `None` the node is a hub.
    pub remote_url: Option<String>,

    /// Path to store documents and the root reference.
    ///
    /// This directory will be created if it doesn't exist.
    pub storage_path: PathBuf,

    /// How often dirty documents are written to disk, in seconds.
    pub flush_interval_secs: u64,

    /// Limit for authenticating a peer or fetching an access token, in seconds.
    pub auth_timeout_secs: u64,

    /// How long a spoke waits for the replicated root catalog, in seconds.
    pub root_wait_timeout_secs: u64,

    /// Maximum number of change tags remembered as processed.
    pub processed_tag_capacity: usize,

    /// Maximum number of pending removals remembered.
    pub pending_removal_capacity: usize,

    /// Lifetime of a tracking cache entry, in seconds.
    pub tracking_ttl_secs: u64,

    /// Capacity of the per-document and per-service notification channels.
    ///
    /// A subscriber that falls further behind than this reconciles from the
    /// current snapshot instead of replaying every notification.
    pub channel_capacity: usize,

    /// Upper bound for the spoke reconnect backoff, in seconds.
    pub max_reconnect_backoff_secs: u64,
}

impl Config {
    /// Create a new configuration with the given storage path
    #[must_use]
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: None,
            storage_path: storage_path.into(),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            root_wait_timeout_secs: 30,
            processed_tag_capacity: DEFAULT_TRACKING_CAPACITY,
            pending_removal_capacity: DEFAULT_TRACKING_CAPACITY,
            tracking_ttl_secs: DEFAULT_TRACKING_TTL_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_reconnect_backoff_secs: 30,
        }
    }

    /// Set the hub URL, switching the node to spoke mode
    #[must_use]
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Set the flush interval
    #[must_use]
    pub const fn with_flush_interval(mut self, secs: u64) -> Self {
        self.flush_interval_secs = secs;
        self
    }

    /// Set the authentication timeout
    #[must_use]
    pub const fn with_auth_timeout(mut self, secs: u64) -> Self {
        self.auth_timeout_secs = secs;
        self
    }

    /// Set how long a spoke waits for the root catalog
    #[must_use]
    pub const fn with_root_wait_timeout(mut self, secs: u64) -> Self {
        self.root_wait_timeout_secs = secs;
        self
    }

    /// Set the tracking cache capacities and entry lifetime
    #[must_use]
    pub const fn with_tracking(mut self, capacity: usize, ttl_secs: u64) -> Self {
        self.processed_tag_capacity = capacity;
        self.pending_removal_capacity = capacity;
        self.tracking_ttl_secs = ttl_secs;
        self
    }

    /// Set the notification channel capacity
    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Whether this node replicates from a hub
    #[must_use]
    pub fn is_spoke(&self) -> bool {
        self.remote_url.is_some()
    }

    /// Get the default storage path
    #[must_use]
    pub fn default_storage_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("syncbridge")
    }

    /// Path to the documents directory
    #[must_use]
    pub fn docs_path(&self) -> PathBuf {
        self.storage_path.join("docs")
    }

    /// Path to the root catalog reference
    #[must_use]
    pub fn root_record_path(&self) -> PathBuf {
        self.storage_path.join(ROOT_RECORD_FILE)
    }

    /// Path to the access token database
    #[must_use]
    pub fn tokens_db_path(&self) -> PathBuf {
        self.storage_path.join("tokens.db")
    }

    /// Flush interval as a [`Duration`]
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Authentication timeout as a [`Duration`]
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Root wait timeout as a [`Duration`]
    #[must_use]
    pub fn root_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.root_wait_timeout_secs)
    }

    /// Tracking entry lifetime as a [`Duration`]
    #[must_use]
    pub fn tracking_ttl(&self) -> Duration {
        Duration::from_secs(self.tracking_ttl_secs)
    }

    /// Reconnect backoff cap as a [`Duration`]
    #[must_use]
    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_backoff_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_storage_path())
    }
}
