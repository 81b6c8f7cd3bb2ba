//! # Game Client Library
//!
//! This library provides the client side of the networked object layer. It
//! connects to a server, mirrors the server's object directory and reports
//! session events to a game mode through [`ClientListener`].
//!
//! ## Session Flow
//!
//! A [`ClientSession`] walks through a small state machine:
//! - `connect` resolves the address, opens the socket and reads the client id
//! - The session waits in the lobby until the server announces the game start
//! - The game mode loads, calls `notify_loaded` and starts receiving replication
//! - Losing the connection, or calling `dispose`, returns it to `Disconnected`
//!
//! ## Architecture Design
//!
//! ### Tick-Driven Processing
//! Socket tasks only queue raw payloads. Everything visible to the game mode
//! (directory changes, listener callbacks, disconnect detection) happens inside
//! [`ClientSession::process_tick`], on the task that owns the session.
//!
//! ### Read-Only Replicas
//! Objects in the client directory are owned by the server. A client changes
//! the world only by sending requests for objects it owns; the server applies
//! them and replicates the result.
//!
//! ### Local Prediction
//! The demo [`ClientGame`] applies its own move requests to a copy of its
//! avatar so the player sees movement before the server confirms it.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Connecting, handshake, message dispatch, request sending, disposal.
//!
//! ### Game Module (`game`)
//! The demo listener: tracks its own avatar, builds move requests and counts
//! the jump events the server broadcasts.

pub mod game;
pub mod network;

pub use game::ClientGame;
pub use network::{ClientListener, ClientSession, SessionError, SessionHandle, SessionState};
