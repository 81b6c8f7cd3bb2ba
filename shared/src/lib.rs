//! # Shared Networking Library
//!
//! Everything both ends of a session agree on: the wire format, the
//! connection machinery and the replicated object model.
//!
//! ## Wire Format
//!
//! A TCP stream carries frames: a big-endian `u16` length followed by at most
//! 32767 payload bytes ([`frame`]). The first payload byte selects the
//! message type and the rest is a fixed big-endian body ([`message`]). Right
//! after accepting a socket the server writes the assigned client id as four
//! big-endian bytes, before any frame.
//!
//! ## Connections
//!
//! A [`Connection`] owns one socket plus a reader and a writer task. Received
//! payloads land on a [`HandoffQueue`] that the owning tick loop drains a
//! bounded number of items at a time, so socket I/O never blocks the game
//! loop and one noisy peer cannot starve the others.
//!
//! ## Networked Objects
//!
//! The server owns a [`ServerDirectory`] of authoritative objects, clients
//! mirror it in a [`ClientDirectory`]. Objects are created from a shared
//! [`Templates`] table and serialize themselves through the [`Replica`] trait.
//! The [`avatar`] module is a small demo replica used by the binaries and tests.

pub mod avatar;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod frame;
pub mod ids;
pub mod message;
pub mod queue;

pub use config::{NetworkConfig, MAX_CLIENT_REQUESTS, MAX_FRAME_LEN};
pub use connection::{
    Connection, ConnectionHandle, ConnectionObserver, ConnectionState, DisconnectReason,
};
pub use directory::{ApplyError, ClientDirectory, Replica, ServerDirectory, Templates};
pub use error::{DirectoryError, FrameError, ProtocolError};
pub use frame::{encode_frame, read_frame, write_frame, DISCONNECT_FRAME};
pub use ids::{ClientId, EventId, ObjectId, Owner, RequestId, TemplateId};
pub use message::{Message, MessageType};
pub use queue::{handoff_queue, HandoffQueue, HandoffSender};
