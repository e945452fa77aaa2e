//! Automerge document sync over a message channel
//!
//! A session multiplexes the Automerge sync protocol for any number of
//! documents over one ordered, bidirectional channel of binary messages
//! (a WebSocket in production, an in-process channel in tests).
//!
//! # Protocol
//!
//! Every message is one frame:
//! - 1 byte message type:
//!   - 0x01: Sync message
//!   - 0x03: Error
//! - 2 byte big-endian url length, then the document url
//! - the payload (an encoded Automerge sync message, or UTF-8 error text)
//!
//! # Flow
//!
//! 1. The initiator (a spoke) announces every document it holds locally
//! 2. Whoever receives a sync message for a document applies it, marks the
//!    document shared with this peer and answers if it has anything to say
//! 3. Local changes to shared documents are pushed as they happen; the
//!    initiator also pushes documents it opens later
//!
//! Per-document failures are reported with an error frame and the session
//! carries on. The session ends when either channel closes or on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use automerge::sync;
use tokio::sync::{broadcast::error::RecvError, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::doc::DocumentUrl;
use crate::error::{Error, Result};
use crate::store::Store;

/// Maximum frame size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Type byte, url length and nothing else.
const HEADER_LEN: usize = 3;

/// Message types for the sync protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A sync message containing Automerge sync data
    SyncMessage = 0x01,
    /// The peer failed to handle a document
    Error = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SyncMessage),
            0x03 => Ok(Self::Error),
            _ => Err(Error::sync(format!("unknown message type: {value}"))),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type
    pub kind: MessageType,
    /// Document the frame is about
    pub url: DocumentUrl,
    /// Sync message bytes or error text
    pub payload: Vec<u8>,
}

impl Frame {
    /// A sync message for `url`.
    #[must_use]
    pub fn sync(url: &DocumentUrl, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageType::SyncMessage,
            url: url.clone(),
            payload,
        }
    }

    /// An error report for `url`.
    #[must_use]
    pub fn error(url: &DocumentUrl, message: &str) -> Self {
        Self {
            kind: MessageType::Error,
            url: url.clone(),
            payload: message.as_bytes().to_vec(),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let url = self.url.as_str().as_bytes();
        let url_len = u16::try_from(url.len()).map_err(|_| Error::sync("document url too long"))?;

        let total_len = HEADER_LEN + url.len() + self.payload.len();
        if total_len > MAX_MESSAGE_SIZE {
            return Err(Error::sync("message too large"));
        }

        let mut bytes = Vec::with_capacity(total_len);
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&url_len.to_be_bytes());
        bytes.extend_from_slice(url);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::sync(format!(
                "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                bytes.len()
            )));
        }
        if bytes.len() < HEADER_LEN {
            return Err(Error::sync("truncated frame header"));
        }

        let kind = MessageType::try_from(bytes[0])?;
        let url_len = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let url_end = HEADER_LEN + url_len;
        let url_bytes = bytes
            .get(HEADER_LEN..url_end)
            .ok_or_else(|| Error::sync("truncated document url"))?;
        let url = std::str::from_utf8(url_bytes)
            .map_err(|e| Error::sync(format!("invalid document url encoding: {e}")))?;

        Ok(Self {
            kind,
            url: DocumentUrl::parse(url)?,
            payload: bytes[url_end..].to_vec(),
        })
    }
}

/// Which side of the link a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// The connecting spoke: announces every local document.
    Initiator,
    /// The accepting hub: only answers for documents the peer asked about.
    Responder,
}

struct Session {
    store: Arc<Store>,
    role: SessionRole,
    states: HashMap<DocumentUrl, sync::State>,
    /// Documents the peer has sent us messages for
    shared: HashSet<DocumentUrl>,
    outgoing: mpsc::Sender<Vec<u8>>,
}

/// Run one replication session until a channel closes or `shutdown` fires.
///
/// Frames received on `incoming` are applied to documents in `store`; frames
/// for `outgoing` are produced as documents change.
pub async fn run_session(
    store: Arc<Store>,
    role: SessionRole,
    outgoing: mpsc::Sender<Vec<u8>>,
    mut incoming: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut notifications = store.subscribe();
    let mut session = Session {
        store,
        role,
        states: HashMap::new(),
        shared: HashSet::new(),
        outgoing,
    };
    debug!(role = ?role, "Sync session started");

    if role == SessionRole::Initiator {
        for url in session.store.list()? {
            session.push(&url).await?;
        }
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Sync session shutting down");
                    return Ok(());
                }
            }
            frame = incoming.recv() => match frame {
                Some(bytes) => session.receive(&bytes).await?,
                None => {
                    debug!("Peer closed the sync session");
                    return Ok(());
                }
            },
            notification = notifications.recv() => match notification {
                Ok(url) => {
                    if session.wants(&url) {
                        session.push(&url).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Sync session lagged, pushing every shared document");
                    let shared: Vec<DocumentUrl> = session.shared.iter().cloned().collect();
                    for url in shared {
                        session.push(&url).await?;
                    }
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

impl Session {
    fn wants(&self, url: &DocumentUrl) -> bool {
        self.role == SessionRole::Initiator || self.shared.contains(url)
    }

    /// Send whatever the peer still needs for `url`.
    async fn push(&mut self, url: &DocumentUrl) -> Result<()> {
        let doc = match self.store.find_local(url).await {
            Ok(Some(doc)) => doc,
            Ok(None) | Err(_) => return Ok(()),
        };
        let state = self.states.entry(url.clone()).or_insert_with(sync::State::new);
        if let Some(message) = doc.generate_sync_message(state) {
            let payload = message.encode();
            trace!(url = %url, size = payload.len(), "Sending sync message");
            self.send(&Frame::sync(url, payload)).await?;
        }
        Ok(())
    }

    async fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed sync frame");
                return Ok(());
            }
        };

        match frame.kind {
            MessageType::Error => {
                warn!(
                    url = %frame.url,
                    error = %String::from_utf8_lossy(&frame.payload),
                    "Peer failed to sync document"
                );
                Ok(())
            }
            MessageType::SyncMessage => {
                if self.store.is_deleted(&frame.url) {
                    trace!(url = %frame.url, "Ignoring sync message for deleted document");
                    return Ok(());
                }
                if let Err(e) = self.apply(&frame).await {
                    warn!(url = %frame.url, error = %e, "Failed to apply sync message");
                    self.send(&Frame::error(&frame.url, &e.to_string())).await?;
                }
                Ok(())
            }
        }
    }

    async fn apply(&mut self, frame: &Frame) -> Result<()> {
        let doc = self.store.find(&frame.url).await?;
        let message = sync::Message::decode(&frame.payload)
            .map_err(|e| Error::sync(format!("failed to decode sync message: {e}")))?;

        let state = self
            .states
            .entry(frame.url.clone())
            .or_insert_with(sync::State::new);
        doc.receive_sync_message(state, message)?;
        trace!(url = %frame.url, size = frame.payload.len(), "Applied sync message");

        self.shared.insert(frame.url.clone());
        self.push(&frame.url).await
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        self.outgoing
            .send(frame.encode()?)
            .await
            .map_err(|_| Error::connection("sync channel closed"))
    }
}
