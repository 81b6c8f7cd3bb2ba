//! Server network layer coupling the registry with the object directory
//!
//! [`NetworkServer`] runs one registry tick per game loop iteration and turns
//! its output into [`ServerListener`] callbacks. It also owns replication:
//! loaded clients receive spawns and updates for the authoritative
//! [`ServerDirectory`] whenever [`NetworkServer::broadcast_updates`] runs.

use crate::registry::{RegistryTick, ServerError, ServerRegistry};
use log::{debug, error, info, warn};
use shared::{
    ClientId, DirectoryError, EventId, Message, NetworkConfig, ObjectId, Owner, RequestId,
    ServerDirectory, TemplateId, Templates,
};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::ToSocketAddrs;

/// Lobby until the host starts the game; no new clients join afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Lobby,
    InProgress,
}

/// Which clients receive a server event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    /// Only the client owning the object
    Owner,
    /// One specific client
    Client(ClientId),
    /// Every loaded client
    Loaded,
}

/// Game-mode hooks. Every method has an empty default so implementations
/// only pick the events they care about.
pub trait ServerListener {
    /// A socket is about to receive a client id; returning false closes it
    fn client_connection_attempt(&mut self, _peer: SocketAddr) -> bool {
        true
    }

    /// The client received its id and is now in the active set
    fn client_fully_connected(&mut self, _ctx: &mut ServerContext<'_>, _client: ClientId) {}

    /// The client finished loading after `HostStarted` and now receives replication
    fn client_loaded(&mut self, _ctx: &mut ServerContext<'_>, _client: ClientId) {}

    fn client_disconnected(&mut self, _ctx: &mut ServerContext<'_>, _client: ClientId) {}

    /// A request against an object the client owns
    fn client_component_request(
        &mut self,
        _ctx: &mut ServerContext<'_>,
        _client: ClientId,
        _object: ObjectId,
        _request: RequestId,
        _body: &[u8],
    ) {
    }
}

/// What listener callbacks may touch while the server is mid-tick
pub struct ServerContext<'a> {
    registry: &'a mut ServerRegistry,
    directory: &'a mut ServerDirectory,
}

impl<'a> ServerContext<'a> {
    /// Spawns an object; clients see it with the next [`NetworkServer::broadcast_updates`]
    pub fn spawn_object(&mut self, owner: Owner, template: TemplateId) -> Result<ObjectId, DirectoryError> {
        self.directory.spawn(owner, template)
    }

    pub fn directory(&self) -> &ServerDirectory {
        &*self.directory
    }

    pub fn directory_mut(&mut self) -> &mut ServerDirectory {
        &mut *self.directory
    }

    pub fn send_to(&self, client: ClientId, message: &Message) -> Result<(), ServerError> {
        self.registry.send_to(client, message)
    }

    pub fn broadcast(&self, message: &Message) -> Result<(), ServerError> {
        self.registry.broadcast(message)
    }

    pub fn send_event(
        &self,
        object: ObjectId,
        event: EventId,
        body: Vec<u8>,
        recipients: Recipients,
    ) -> Result<(), ServerError> {
        send_event(&*self.registry, &*self.directory, object, event, body, recipients)
    }

    /// Active clients in processing order, with their loaded flag
    pub fn clients(&self) -> Vec<(ClientId, bool)> {
        self.registry.clients().collect()
    }

    pub fn player_count(&self) -> usize {
        self.registry.active_len()
    }
}

fn send_event(
    registry: &ServerRegistry,
    directory: &ServerDirectory,
    object: ObjectId,
    event: EventId,
    body: Vec<u8>,
    recipients: Recipients,
) -> Result<(), ServerError> {
    let owner = directory
        .owner(object)
        .ok_or(DirectoryError::UnknownObjectId(object))?;

    let message = Message::ServerEvent {
        object,
        event,
        body,
    };
    match recipients {
        Recipients::Owner => match owner {
            Owner::Client(client) => registry.send_to(client, &message),
            Owner::Server => Ok(()),
        },
        Recipients::Client(client) => registry.send_to(client, &message),
        Recipients::Loaded => {
            for (client, loaded) in registry.clients() {
                if loaded {
                    registry.send_to(client, &message)?;
                }
            }
            Ok(())
        }
    }
}

/// Authoritative server: registry, object directory and game-mode listener
pub struct NetworkServer<L: ServerListener> {
    registry: ServerRegistry,
    directory: ServerDirectory,
    listener: L,
    state: GameState,
    started: Instant,
}

impl<L: ServerListener> NetworkServer<L> {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: NetworkConfig,
        templates: Templates,
        listener: L,
    ) -> Result<Self, ServerError> {
        let registry = ServerRegistry::bind(addr, config).await?;
        Ok(Self {
            registry,
            directory: ServerDirectory::new(templates),
            listener,
            state: GameState::Lobby,
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.registry.local_addr()
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &ServerDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut ServerDirectory {
        &mut self.directory
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn player_count(&self) -> usize {
        self.registry.active_len()
    }

    /// Seconds since the server started
    pub fn server_time(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }

    pub fn spawn_object(&mut self, owner: Owner, template: TemplateId) -> Result<ObjectId, DirectoryError> {
        self.directory.spawn(owner, template)
    }

    pub fn send_event(
        &self,
        object: ObjectId,
        event: EventId,
        body: Vec<u8>,
        recipients: Recipients,
    ) -> Result<(), ServerError> {
        send_event(&self.registry, &self.directory, object, event, body, recipients)
    }

    /// Runs the registry tick and dispatches its events to the listener.
    ///
    /// Returns the number of client messages dispatched.
    pub async fn tick(&mut self) -> usize {
        let RegistryTick {
            disconnected,
            connected,
            messages,
        } = {
            let listener = &mut self.listener;
            self.registry
                .tick_with(|peer| listener.client_connection_attempt(peer))
                .await
        };

        let mut ctx = ServerContext {
            registry: &mut self.registry,
            directory: &mut self.directory,
        };

        for client in disconnected {
            ctx.directory.forget_client(client);
            self.listener.client_disconnected(&mut ctx, client);
        }
        for client in connected {
            self.listener.client_fully_connected(&mut ctx, client);
        }

        let count = messages.len();
        for (client, message) in messages {
            match message {
                Message::ClientLoaded => {
                    if ctx.registry.set_loaded(client) {
                        info!("Client {} finished loading", client);
                        self.listener.client_loaded(&mut ctx, client);
                    }
                }
                Message::ClientRequest {
                    object,
                    request,
                    body,
                } => match ctx.directory.owner(object) {
                    Some(owner) if owner.is_client(client) => {
                        self.listener
                            .client_component_request(&mut ctx, client, object, request, &body);
                    }
                    Some(owner) => {
                        error!(
                            "Client {} sent request {:?} for object {} owned by {}",
                            client, request, object, owner
                        );
                    }
                    None => debug!("Client {} sent request for unknown object {}", client, object),
                },
                other => debug!("Ignoring {:?} from client {}", other.kind(), client),
            }
        }

        count
    }

    /// Lets the listener act outside of a tick, e.g. to simulate the world
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut L, &mut ServerContext<'_>) -> R) -> R {
        let mut ctx = ServerContext {
            registry: &mut self.registry,
            directory: &mut self.directory,
        };
        f(&mut self.listener, &mut ctx)
    }

    /// Replicates the directory to loaded clients and broadcasts the server state
    pub fn broadcast_updates(&mut self) {
        let loaded: Vec<ClientId> = self
            .registry
            .clients()
            .filter(|(_, loaded)| *loaded)
            .map(|(id, _)| id)
            .collect();

        for client in loaded {
            let registry = &self.registry;
            self.directory.replicate(client, |message| {
                if let Err(e) = registry.send_to(client, &message) {
                    warn!("Failed to replicate to client {}: {}", client, e);
                }
            });
        }
        self.directory.clear_dirty();

        let state = Message::UpdateServerState {
            time: self.server_time(),
            player_count: self.registry.active_len() as i32,
        };
        if let Err(e) = self.registry.broadcast(&state) {
            warn!("Failed to broadcast server state: {}", e);
        }
    }

    /// Leaves the lobby: tells every client to load and stops admitting new ones
    pub fn start_game(&mut self) -> Result<(), ServerError> {
        if self.state == GameState::InProgress {
            return Ok(());
        }
        info!("Starting game with {} players", self.registry.active_len());
        self.state = GameState::InProgress;
        self.registry.set_accepting(false);
        self.registry.broadcast(&Message::HostStarted)
    }

    pub async fn shutdown(&mut self) {
        self.registry.shutdown().await;
    }
}
