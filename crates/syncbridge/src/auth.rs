//! Authentication hooks.
//!
//! Hubs check inbound connections with an [`Authenticator`]; spokes obtain
//! the token they present to their hub from an [`AccessTokenProvider`]. Both
//! calls run under the configured `auth_timeout`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::strategy::Caller;

/// Validates access tokens presented by peers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The caller behind `token`, or `None` if the token is not accepted.
    async fn authenticate(&self, token: &str) -> Result<Option<Caller>>;
}

/// Supplies the token a spoke presents to its hub.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, for deployments that provision one out of band.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AccessTokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Run `future`, failing with [`Error::Timeout`] after `limit`.
pub async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| Error::timeout(format!("{what} took longer than {limit:?}")))?
}

/// Authenticate `token`, treating rejection and timeout alike as
/// [`Error::Unauthorized`].
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    token: &str,
    limit: Duration,
) -> Result<Caller> {
    match with_timeout(limit, "authentication", authenticator.authenticate(token)).await {
        Ok(Some(caller)) => Ok(caller),
        Ok(None) => Err(Error::unauthorized("access token rejected")),
        Err(e) => Err(Error::unauthorized(e.to_string())),
    }
}
