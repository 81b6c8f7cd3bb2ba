//! Server-side connection registry
//!
//! This module owns the lifecycle of every client connection:
//! - Accepting raw sockets on a background task
//! - Promoting sockets to connections while capacity allows
//! - Handing out unique client ids from any thread
//! - Moving connections into the active set and out again on disconnect
//! - Draining a bounded number of messages per client per tick
//!
//! Socket tasks never touch the active set. They communicate with the tick
//! loop exclusively through three handoff queues (pending sockets, pending
//! connected, pending disconnected) that [`ServerRegistry::tick`] drains.

use log::{debug, error, info, warn};
use shared::{
    handoff_queue, ClientId, Connection, ConnectionHandle, ConnectionObserver, DirectoryError,
    FrameError, HandoffQueue, HandoffSender, Message, NetworkConfig,
};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An active client and its connection
#[derive(Debug)]
struct Client {
    connection: Connection,
    /// Set once the client reported that it finished loading
    loaded: bool,
}

impl Client {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            loaded: false,
        }
    }
}

/// What happened during one registry tick, in processing order
#[derive(Debug, Default)]
pub struct RegistryTick {
    pub disconnected: Vec<ClientId>,
    pub connected: Vec<ClientId>,
    /// Decoded messages in ascending client order, FIFO per client
    pub messages: Vec<(ClientId, Message)>,
}

/// Forwards loss notifications from socket tasks to the tick loop
struct DisconnectSink {
    disconnected: HandoffSender<ConnectionHandle>,
}

impl ConnectionObserver for DisconnectSink {
    fn disconnected(&self, connection: &ConnectionHandle) {
        if !self.disconnected.push(connection.clone()) {
            debug!("Registry gone, dropping disconnect of {}", connection.peer_addr());
        }
    }
}

struct RegistryShared {
    config: NetworkConfig,
    next_client_id: AtomicU32,
    /// Connections counted against `max_clients`, from activation until closed by the registry
    live: AtomicUsize,
    connected: HandoffSender<Connection>,
    observer: Arc<dyn ConnectionObserver>,
}

/// Cloneable, thread-safe entry point for registering connections
#[derive(Clone)]
pub struct RegistryHandle {
    shared: Arc<RegistryShared>,
}

impl RegistryHandle {
    /// Registers an established connection and returns its new id.
    ///
    /// Safe to call concurrently from any thread. The connection is activated
    /// (the id handshake is queued) right away and joins the active set on
    /// the next tick.
    pub fn add_connected_client(&self, connection: Connection) -> ClientId {
        let id = ClientId(self.shared.next_client_id.fetch_add(1, Ordering::AcqRel));
        connection.activate(id);
        self.shared.live.fetch_add(1, Ordering::AcqRel);

        if !self.shared.connected.push(connection) {
            warn!("Registry gone, dropping client {}", id);
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
        id
    }

    /// Wraps a raw socket in a connection wired to this registry and registers it
    pub fn accept_stream(&self, stream: TcpStream) -> io::Result<ClientId> {
        let connection = Connection::accept(stream, &self.shared.config, self.observer())?;
        Ok(self.add_connected_client(connection))
    }

    /// Observer new connections must report to
    pub fn observer(&self) -> Arc<dyn ConnectionObserver> {
        Arc::clone(&self.shared.observer)
    }

    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }
}

/// Owns the listener, the pending queues and the active client set
pub struct ServerRegistry {
    handle: RegistryHandle,
    local_addr: SocketAddr,
    pending_sockets: HandoffQueue<TcpStream>,
    pending_connected: HandoffQueue<Connection>,
    pending_disconnected: HandoffQueue<ConnectionHandle>,
    /// Disconnect notices held back until the client's queue is drained
    draining: Vec<ConnectionHandle>,
    /// Ordered by id, which is also arrival order
    active: BTreeMap<ClientId, Client>,
    accepting: bool,
    shutdown_tx: watch::Sender<bool>,
    acceptor: Option<JoinHandle<()>>,
}

impl ServerRegistry {
    /// Binds the listener and starts the accept task
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: NetworkConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (socket_tx, pending_sockets) = handoff_queue();
        let (connected_tx, pending_connected) = handoff_queue();
        let (disconnected_tx, pending_disconnected) = handoff_queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let acceptor = tokio::spawn(accept_loop(
            listener,
            socket_tx,
            shutdown_rx,
            config.accept_timeout,
        ));

        let handle = RegistryHandle {
            shared: Arc::new(RegistryShared {
                config,
                next_client_id: AtomicU32::new(0),
                live: AtomicUsize::new(0),
                connected: connected_tx,
                observer: Arc::new(DisconnectSink {
                    disconnected: disconnected_tx,
                }),
            }),
        };

        Ok(Self {
            handle,
            local_addr,
            pending_sockets,
            pending_connected,
            pending_disconnected,
            draining: Vec::new(),
            active: BTreeMap::new(),
            accepting: true,
            shutdown_tx,
            acceptor: Some(acceptor),
        })
    }

    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.handle.shared.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_connected_client(&self, connection: Connection) -> ClientId {
        self.handle.add_connected_client(connection)
    }

    /// Pending plus active connections
    pub fn live_connections(&self) -> usize {
        self.handle.live_connections()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_sockets(&self) -> usize {
        self.pending_sockets.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// While not accepting, incoming sockets are closed on the next tick
    pub fn set_accepting(&mut self, accepting: bool) {
        if self.accepting != accepting {
            info!("Server {} new clients", if accepting { "accepting" } else { "rejecting" });
        }
        self.accepting = accepting;
    }

    /// Active client ids in processing order, with their loaded flag
    pub fn clients(&self) -> impl Iterator<Item = (ClientId, bool)> + '_ {
        self.active.iter().map(|(id, client)| (*id, client.loaded))
    }

    /// Messages received from `id` and not yet drained
    pub fn queued(&self, id: ClientId) -> Option<usize> {
        self.active.get(&id).map(|client| client.connection.queued())
    }

    /// Marks a client as loaded; returns false if it is not active
    pub fn set_loaded(&mut self, id: ClientId) -> bool {
        match self.active.get_mut(&id) {
            Some(client) => {
                client.loaded = true;
                true
            }
            None => false,
        }
    }

    pub fn send_to(&self, id: ClientId, message: &Message) -> Result<(), ServerError> {
        let client = self.active.get(&id).ok_or(ServerError::UnknownClient(id))?;
        client.connection.send_message(message)?;
        Ok(())
    }

    /// Sends `message` to every active client
    pub fn broadcast(&self, message: &Message) -> Result<(), ServerError> {
        let payload = message.encode();
        for client in self.active.values() {
            client.connection.send(&payload)?;
        }
        Ok(())
    }

    /// Runs one registry step on the tick loop, admitting every socket.
    ///
    /// Order: disconnects, then newly connected clients, then promotion of
    /// pending sockets, then a bounded drain of every active client.
    pub async fn tick(&mut self) -> RegistryTick {
        self.tick_with(|_| true).await
    }

    /// Like [`ServerRegistry::tick`], but asks `admit` about every pending
    /// socket before it is promoted. Refused sockets are closed.
    pub async fn tick_with<F>(&mut self, admit: F) -> RegistryTick
    where
        F: FnMut(SocketAddr) -> bool,
    {
        let mut tick = RegistryTick::default();
        self.process_disconnects(&mut tick).await;
        self.process_connects(&mut tick).await;
        self.promote_pending_sockets(admit);

        let max = self.config().max_client_requests;
        let messages = &mut tick.messages;
        for (&id, client) in self.active.iter_mut() {
            client.connection.drain(max, |payload| match Message::decode(&payload) {
                Ok(message) if message.kind().is_client_to_server() => messages.push((id, message)),
                Ok(message) => warn!("Client {} sent server-only message {:?}", id, message.kind()),
                Err(e) => warn!("Dropping malformed message from client {}: {}", id, e),
            });
        }
        tick
    }

    async fn process_disconnects(&mut self, tick: &mut RegistryTick) {
        let mut notices = std::mem::take(&mut self.draining);
        self.pending_disconnected.drain(usize::MAX, |handle| notices.push(handle));

        for handle in notices {
            let Some(id) = handle.client_id() else {
                debug!("Disconnect from unregistered peer {}", handle.peer_addr());
                continue;
            };

            let matches = self
                .active
                .get(&id)
                .map(|client| client.connection.handle().same(&handle));
            match matches {
                Some(true) => {
                    let queued = self.queued(id).unwrap_or(0);
                    if queued > 0 {
                        // Messages sent before the goodbye are still delivered.
                        debug!("Client {} disconnecting with {} queued messages", id, queued);
                        self.draining.push(handle);
                        continue;
                    }
                    if let Some(mut client) = self.active.remove(&id) {
                        client.connection.close().await;
                        self.release();
                        info!("Client {} disconnected", id);
                        tick.disconnected.push(id);
                    }
                }
                Some(false) => {
                    error!("Client {} in the active set does not match its disconnect notice", id);
                    debug_assert!(false, "client id bookkeeping mismatch for {}", id);
                }
                // Still pending; the connect step closes it.
                None => debug!("Disconnect notice for inactive client {}", id),
            }
        }
    }

    async fn process_connects(&mut self, tick: &mut RegistryTick) {
        let mut fresh = Vec::new();
        self.pending_connected.drain(usize::MAX, |connection| fresh.push(connection));

        for mut connection in fresh {
            let id = match connection.client_id() {
                Some(id) if connection.is_open() => id,
                id => {
                    debug!("Connection {:?} dropped before joining", id);
                    connection.close().await;
                    self.release();
                    continue;
                }
            };

            if let Some(mut previous) = self.active.insert(id, Client::new(connection)) {
                error!("Client id {} was already active", id);
                debug_assert!(false, "duplicate client id {}", id);
                previous.connection.close().await;
                self.release();
            }
            info!("Client {} connected", id);
            tick.connected.push(id);
        }
    }

    fn promote_pending_sockets<F>(&mut self, mut admit: F)
    where
        F: FnMut(SocketAddr) -> bool,
    {
        if !self.accepting {
            let rejected = self.pending_sockets.drain(usize::MAX, drop);
            if rejected > 0 {
                info!("Rejected {} connection attempts", rejected);
            }
            return;
        }

        while self.live_connections() < self.config().max_clients {
            let Some(stream) = self.pending_sockets.pop() else {
                break;
            };
            match stream.peer_addr() {
                Ok(peer) if admit(peer) => {}
                Ok(peer) => {
                    info!("Refused connection attempt from {}", peer);
                    continue;
                }
                Err(e) => {
                    debug!("Pending socket already gone: {}", e);
                    continue;
                }
            }
            match self.handle.accept_stream(stream) {
                Ok(id) => debug!("Promoted pending socket to client {}", id),
                Err(e) => warn!("Could not set up connection: {}", e),
            }
        }
    }

    fn release(&self) {
        let released = self
            .handle
            .shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            error!("Live connection count underflow");
            debug_assert!(false, "live connection count underflow");
        }
    }

    /// Stops accepting, closes every connection and drops pending sockets.
    ///
    /// Leaves the live connection count at zero.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                error!("Accept task failed: {}", e);
            }
        }

        for (id, mut client) in std::mem::take(&mut self.active) {
            client.connection.close().await;
            self.release();
            debug!("Closed client {}", id);
        }
        while let Some(mut connection) = self.pending_connected.pop() {
            connection.close().await;
            self.release();
        }
        self.pending_disconnected.drain(usize::MAX, drop);
        self.draining.clear();
        let sockets = self.pending_sockets.drain(usize::MAX, drop);

        let live = self.live_connections();
        if live != 0 {
            error!("{} connections still live after shutdown", live);
            debug_assert_eq!(live, 0, "live connections after shutdown");
        }
        info!("Registry shut down, {} pending sockets dropped", sockets);
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sockets: HandoffSender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
    accept_timeout: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = tokio::time::timeout(accept_timeout, listener.accept()) => match accepted {
                Err(_) => continue,
                Ok(Ok((stream, addr))) => {
                    debug!("Accepted socket from {}", addr);
                    if !sockets.push(stream) {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}
