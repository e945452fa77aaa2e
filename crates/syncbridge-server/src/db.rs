//! Access token database

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use syncbridge::{Authenticator, Caller};
use tracing::debug;
use uuid::Uuid;

/// Provider name given to callers authenticated by token
pub const TOKEN_PROVIDER: &str = "token";

/// Token metadata stored in the database
#[derive(Debug, Clone)]
pub struct TokenRecord {
    /// Unique token name
    pub name: String,
    /// User the token acts as
    pub user: Option<String>,
    /// When the token was issued
    pub created_at: DateTime<Utc>,
    /// When the token was last presented
    pub last_used: Option<DateTime<Utc>>,
}

/// SQLite database of issued access tokens
///
/// Only SHA-256 hashes of tokens are stored.
pub struct TokenRegistry {
    conn: Mutex<Connection>,
}

impl TokenRegistry {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tokens (
                name TEXT PRIMARY KEY,
                token_hash TEXT NOT NULL UNIQUE,
                user TEXT,
                created_at TEXT NOT NULL,
                last_used TEXT
            )",
            [],
        )
        .context("Failed to create tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Issue a new token under `name`, replacing any token of that name.
    ///
    /// Returns the plaintext token; it cannot be recovered later.
    pub fn issue(&self, name: &str, user: Option<&str>) -> Result<String> {
        let token = format!("sb_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tokens (name, token_hash, user, created_at, last_used)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![name, hash_token(&token), user, now],
        )
        .context("Failed to insert token")?;

        debug!(name, user = ?user, "Token issued");
        Ok(token)
    }

    /// Revoke the token called `name`
    pub fn revoke(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM tokens WHERE name = ?1", [name])
            .context("Failed to delete token")?;

        debug!(name, removed = rows > 0, "Token revocation attempted");
        Ok(rows > 0)
    }

    /// Find the record for a presented token, updating its last use time
    pub fn lookup(&self, token: &str) -> Result<Option<TokenRecord>> {
        let hash = hash_token(token);
        let now = Utc::now();

        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, user, created_at FROM tokens WHERE token_hash = ?1",
                [&hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to look up token")?;

        let Some((name, user, created_at)) = row else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE tokens SET last_used = ?1 WHERE token_hash = ?2",
            params![now.to_rfc3339(), hash],
        )
        .context("Failed to update token")?;

        Ok(Some(TokenRecord {
            name,
            user,
            created_at: parse_time(&created_at)?,
            last_used: Some(now),
        }))
    }

    /// Get all issued tokens
    pub fn list(&self) -> Result<Vec<TokenRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, user, created_at, last_used FROM tokens ORDER BY name")
            .context("Failed to prepare statement")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .context("Failed to query tokens")?;

        let mut result = Vec::new();
        for row in rows {
            let (name, user, created_at, last_used) = row.context("Failed to read token row")?;
            result.push(TokenRecord {
                name,
                user,
                created_at: parse_time(&created_at)?,
                last_used: last_used.as_deref().map(parse_time).transpose()?,
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl Authenticator for TokenRegistry {
    async fn authenticate(&self, token: &str) -> syncbridge::Result<Option<Caller>> {
        let record = self
            .lookup(token)
            .map_err(|e| syncbridge::Error::storage(format!("{e:#}")))?;
        Ok(record.map(|record| Caller {
            provider: TOKEN_PROVIDER.to_string(),
            user: record.user,
        }))
    }
}

fn hash_token(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .context("Failed to parse timestamp")?
        .with_timezone(&Utc))
}
