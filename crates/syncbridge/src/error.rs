//! Error types for syncbridge.
//!
//! This module defines the [`enum@Error`] enum and [`Result`] type alias used
//! throughout the library.
//!
//! # Error Categories
//!
//! Errors returned to callers of the catalog operations:
//!
//! - [`Error::Forbidden`] - The access predicate rejected the caller
//! - [`Error::NotFound`] - No such partition, record or document
//! - [`Error::Unavailable`] - The root catalog has not loaded yet
//! - [`Error::InvalidUrl`] - A document url failed to parse
//!
//! Errors raised by the machinery underneath:
//!
//! - [`Error::Apply`] - A source service rejected a replicated change
//! - [`Error::Document`] - Automerge document operations
//! - [`Error::Storage`] - Filesystem operations
//! - [`Error::Sync`] - Replication session failures
//! - [`Error::Connection`] - Transport failures
//! - [`Error::Unauthorized`] - Authentication failures
//! - [`Error::Timeout`] - An external call did not finish in time
//! - [`Error::Config`] - Configuration issues
//! - [`Error::Shutdown`] - Operation on a stopped engine
//!
//! # Example
//!
//! ```rust,no_run
//! use syncbridge::{Error, SyncEngine};
//!
//! # async fn example(engine: &SyncEngine, url: &syncbridge::DocumentUrl) {
//! match engine.get(url, None).await {
//!     Ok(snapshot) => println!("{snapshot}"),
//!     Err(Error::NotFound(msg)) => eprintln!("missing: {msg}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # }
//! ```

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for syncbridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in syncbridge operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The caller may not see or change this partition
    #[error("forbidden: {0}")]
    Forbidden(Arc<str>),

    /// The requested entity does not exist
    #[error("not found: {0}")]
    NotFound(Arc<str>),

    /// The root catalog is not loaded yet
    #[error("unavailable: {0}")]
    Unavailable(Arc<str>),

    /// Applying a replicated change to a source service failed
    #[error("apply failed: {0}")]
    Apply(Arc<str>),

    /// A document url could not be parsed
    #[error("invalid document url: {0}")]
    InvalidUrl(Arc<str>),

    /// Document operation failed
    #[error("document error: {0}")]
    Document(Arc<str>),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(Arc<str>),

    /// Replication failed
    #[error("sync failed: {0}")]
    Sync(Arc<str>),

    /// Failed to reach a peer
    #[error("connection failed: {0}")]
    Connection(Arc<str>),

    /// Authentication was rejected
    #[error("unauthorized: {0}")]
    Unauthorized(Arc<str>),

    /// An external call timed out
    #[error("timed out: {0}")]
    Timeout(Arc<str>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Arc<str>),

    /// The engine has been shut down
    #[error("engine has been shut down")]
    Shutdown,
}

impl Error {
    /// Create a forbidden error
    #[inline]
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(Arc::from(msg.into()))
    }

    /// Create a not-found error
    #[inline]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(Arc::from(msg.into()))
    }

    /// Create an unavailable error
    #[inline]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(Arc::from(msg.into()))
    }

    /// Create an apply error
    #[inline]
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(Arc::from(msg.into()))
    }

    /// Create an invalid-url error
    #[inline]
    pub fn invalid_url(msg: impl Into<String>) -> Self {
        Self::InvalidUrl(Arc::from(msg.into()))
    }

    /// Create a document error
    #[inline]
    pub fn document(msg: impl Into<String>) -> Self {
        Self::Document(Arc::from(msg.into()))
    }

    /// Create a storage error
    #[inline]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(Arc::from(msg.into()))
    }

    /// Create a sync error
    #[inline]
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(Arc::from(msg.into()))
    }

    /// Create a connection error
    #[inline]
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(Arc::from(msg.into()))
    }

    /// Create an unauthorized error
    #[inline]
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(Arc::from(msg.into()))
    }

    /// Create a timeout error
    #[inline]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(Arc::from(msg.into()))
    }

    /// Create a configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }

    /// Whether this is a [`Error::NotFound`]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
