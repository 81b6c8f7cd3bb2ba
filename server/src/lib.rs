//! # Game Server Library
//!
//! This library provides the authoritative side of the networked object
//! layer. It accepts TCP clients, hands out client ids, owns the canonical
//! object directory and replicates it to every client that finished loading.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! The [`registry`] moves every connection through a fixed pipeline:
//! - A background task accepts raw sockets into a pending queue
//! - Each tick promotes pending sockets while below `max_clients`
//! - Promoted connections receive their id and join the active set next tick
//! - Lost connections are reported by their socket tasks and removed on the tick
//!
//! ### Bounded Per-Tick Work
//! Each active client contributes at most `max_client_requests` messages per
//! tick. Anything beyond that stays queued for the following ticks, so a
//! flooding client delays only itself.
//!
//! ### Replication
//! The [`network`] layer keeps the authoritative object directory. Loaded
//! clients get a spawn plus a full update for every object they have not seen
//! yet, then updates whenever an object changes or changes owner.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick Loop
//! All mutable state (active set, directory, game mode) is owned by the task
//! that calls [`NetworkServer::tick`]. Socket tasks only push onto handoff
//! queues, which removes the need for locks around game state.
//!
//! ### Capability-Based Listeners
//! Game modes implement [`ServerListener`], overriding only the callbacks they
//! need. Each callback receives a [`ServerContext`] for spawning objects and
//! sending messages while the tick is in progress.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Accept task, pending queues, client id allocation, active set, shutdown.
//!
//! ### Network Module (`network`)
//! Listener dispatch, ownership checks on client requests, replication and
//! server state broadcast, lobby and game start.
//!
//! ### Game Module (`game`)
//! The demo arena: one avatar per loaded client, driven by move requests.

pub mod game;
pub mod network;
pub mod registry;

pub use game::Arena;
pub use network::{GameState, NetworkServer, Recipients, ServerContext, ServerListener};
pub use registry::{RegistryHandle, RegistryTick, ServerError, ServerRegistry};
