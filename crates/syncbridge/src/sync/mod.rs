//! Replication between a hub and its spokes
//!
//! This module handles the Automerge sync protocol for every document a pair
//! of peers shares, over any ordered binary message channel. Connecting the
//! channel (WebSocket, authentication, reconnects) is the server's job.

pub mod session;

pub use self::session::{run_session, Frame, MessageType, SessionRole, MAX_MESSAGE_SIZE};
