//! Client side of a session: one connection to one server
//!
//! [`ClientSession`] connects, reads the id the server assigned, then turns
//! every [`ClientSession::process_tick`] into directory updates and
//! [`ClientListener`] callbacks. Loss of the connection is noticed on the tick
//! after the last queued message has been handled, so nothing the server sent
//! before hanging up is lost.

use log::{debug, info, warn};
use shared::{
    ClientDirectory, ClientId, Connection, ConnectionHandle, ConnectionObserver, DisconnectReason,
    EventId, FrameError, Message, NetworkConfig, ObjectId, Owner, RequestId, Templates,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown host {0}")]
    UnknownHost(String),

    #[error("connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("server did not send a client id: {0}")]
    Handshake(#[source] io::Error),

    #[error("connection to the server was lost")]
    ConnectionLost,

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where the session is in the join flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Connected and waiting in the lobby
    Connected,
    /// The host started; the client is loading and should call `notify_loaded`
    Loading,
    InGame,
}

/// Session events. All methods default to doing nothing.
pub trait ClientListener {
    fn connected(&mut self, _client: ClientId) {}

    /// Fires exactly once per established connection
    fn disconnected(&mut self) {}

    fn unknown_host(&mut self, _host: &str) {}

    fn could_not_connect(&mut self, _error: &SessionError) {}

    /// The transport failed; followed by `disconnected`
    fn error(&mut self, _error: &SessionError) {}

    fn host_started(&mut self) {}

    fn server_event(
        &mut self,
        _directory: &ClientDirectory,
        _object: ObjectId,
        _event: EventId,
        _body: &[u8],
    ) {
    }
}

/// Cloneable sender usable from other tasks, e.g. a shutdown hook
#[derive(Debug, Clone)]
pub struct SessionHandle {
    connection: ConnectionHandle,
}

impl SessionHandle {
    pub fn send(&self, message: &Message) -> Result<(), FrameError> {
        self.connection.send_message(message)
    }

    /// Starts closing the connection; the session notices on its next tick
    pub fn disconnect(&self) {
        self.connection.request_close();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }
}

/// Set by the connection's socket tasks when the server goes away
#[derive(Debug, Default)]
struct ConnectionLoss {
    reported: AtomicBool,
}

impl ConnectionLoss {
    fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }
}

impl ConnectionObserver for ConnectionLoss {
    fn disconnected(&self, connection: &ConnectionHandle) {
        debug!("Connection to {} reported lost", connection.peer_addr());
        self.reported.store(true, Ordering::Release);
    }
}

pub struct ClientSession<L: ClientListener> {
    config: NetworkConfig,
    directory: ClientDirectory,
    listener: L,
    connection: Option<Connection>,
    loss: Arc<ConnectionLoss>,
    state: SessionState,
    client_id: Option<ClientId>,
    server_time: f32,
    player_count: i32,
}

impl<L: ClientListener> ClientSession<L> {
    pub fn new(config: NetworkConfig, templates: Templates, listener: L) -> Self {
        Self {
            config,
            directory: ClientDirectory::new(templates),
            listener,
            connection: None,
            loss: Arc::default(),
            state: SessionState::Disconnected,
            client_id: None,
            server_time: 0.0,
            player_count: 0,
        }
    }

    /// Resolves `addr`, connects within the configured timeout and reads the
    /// assigned client id. Failures are reported to the listener as well as
    /// returned.
    pub async fn connect(&mut self, addr: &str) -> Result<ClientId, SessionError> {
        self.dispose().await;
        info!("Connecting to {}...", addr);

        let stream = match self.open_stream(addr).await {
            Ok(stream) => stream,
            Err(SessionError::UnknownHost(host)) => {
                warn!("Unknown host {}", host);
                self.listener.unknown_host(&host);
                return Err(SessionError::UnknownHost(host));
            }
            Err(e) => {
                warn!("Could not connect to {}: {}", addr, e);
                self.listener.could_not_connect(&e);
                return Err(e);
            }
        };

        let loss = Arc::new(ConnectionLoss::default());
        let connection = match self.handshake(stream, Arc::clone(&loss)).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Handshake with {} failed: {}", addr, e);
                self.listener.could_not_connect(&e);
                return Err(e);
            }
        };

        let id = connection.client_id().ok_or(SessionError::NotConnected)?;
        self.connection = Some(connection);
        self.loss = loss;
        self.client_id = Some(id);
        self.state = SessionState::Connected;
        info!("Connected! Client ID: {}", id);
        self.listener.connected(id);
        Ok(id)
    }

    async fn open_stream(&self, addr: &str) -> Result<TcpStream, SessionError> {
        let limit = self.config.connect_timeout;
        let candidates: Vec<SocketAddr> = match timeout(limit, lookup_host(addr)).await {
            Err(_) => return Err(SessionError::Timeout(addr.to_string())),
            Ok(Err(e)) => {
                debug!("Lookup of {} failed: {}", addr, e);
                return Err(SessionError::UnknownHost(addr.to_string()));
            }
            Ok(Ok(found)) => found.collect(),
        };

        let mut last_error = SessionError::UnknownHost(addr.to_string());
        for candidate in candidates {
            match timeout(limit, TcpStream::connect(candidate)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    last_error = SessionError::ConnectionRefused(candidate);
                }
                Ok(Err(e)) => last_error = SessionError::Io(e),
                Err(_) => last_error = SessionError::Timeout(candidate.to_string()),
            }
        }
        Err(last_error)
    }

    async fn handshake(
        &self,
        mut stream: TcpStream,
        loss: Arc<ConnectionLoss>,
    ) -> Result<Connection, SessionError> {
        let mut raw = [0u8; 4];
        match timeout(self.config.connect_timeout, stream.read_exact(&mut raw)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(SessionError::Handshake(e)),
            Err(_) => {
                return Err(SessionError::Handshake(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no client id before timeout",
                )))
            }
        }

        let id = ClientId(u32::from_be_bytes(raw));
        let connection = Connection::establish(stream, id, &self.config, loss)?;
        Ok(connection)
    }

    /// Handles up to `max_server_messages` queued messages and returns how
    /// many were processed. Tears the session down once the connection is
    /// gone and its queue is empty.
    pub async fn process_tick(&mut self) -> usize {
        let Some(connection) = self.connection.as_mut() else {
            return 0;
        };

        let mut payloads = Vec::new();
        let processed = connection.drain(self.config.max_server_messages, |p| payloads.push(p));
        for payload in payloads {
            match Message::decode(&payload) {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!("Dropping malformed server message: {}", e),
            }
        }

        // A close requested through a SessionHandle is not reported as a loss.
        let loss = &self.loss;
        let finished = self
            .connection
            .as_ref()
            .map_or(false, |c| (loss.is_reported() || !c.is_open()) && c.queued() == 0);
        if finished {
            self.teardown().await;
        }
        processed
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::SpawnObject { object, template } => {
                if let Err(e) = self.directory.spawn(object, template) {
                    warn!("Dropping spawn: {}", e);
                }
            }
            Message::UpdateObject {
                object,
                owner,
                body,
            } => {
                if let Err(e) = self.directory.update(object, owner, &body) {
                    warn!("Dropping update: {}", e);
                }
            }
            Message::UpdateServerState { time, player_count } => {
                self.server_time = time;
                self.player_count = player_count;
            }
            Message::ServerEvent {
                object,
                event,
                body,
            } => {
                if self.directory.contains(object) {
                    self.listener
                        .server_event(&self.directory, object, event, &body);
                } else {
                    debug!("Event {:?} for unknown object {}", event, object);
                }
            }
            Message::HostStarted => {
                info!("Host started the game");
                self.state = SessionState::Loading;
                self.listener.host_started();
            }
            other => warn!("Server sent client-only message {:?}", other.kind()),
        }
    }

    /// Closes the connection after it dropped on its own
    async fn teardown(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        let reason = connection.handle().disconnect_reason();
        connection.close().await;
        self.reset();

        if reason == Some(DisconnectReason::Transport) {
            self.listener.error(&SessionError::ConnectionLost);
        }
        info!("Disconnected from server");
        self.listener.disconnected();
    }

    /// Closes the session. Safe to call repeatedly; only the first call
    /// reports `disconnected`.
    pub async fn dispose(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        connection.close().await;
        self.reset();
        info!("Session closed");
        self.listener.disconnected();
    }

    fn reset(&mut self) {
        self.directory.clear();
        self.state = SessionState::Disconnected;
        self.client_id = None;
        self.server_time = 0.0;
        self.player_count = 0;
    }

    pub fn send(&self, message: &Message) -> Result<(), SessionError> {
        let connection = self.connection.as_ref().ok_or(SessionError::NotConnected)?;
        connection.send_message(message)?;
        Ok(())
    }

    /// Sends a request for an object this client owns
    pub fn request(&self, object: ObjectId, request: RequestId, body: Vec<u8>) -> Result<(), SessionError> {
        self.send(&Message::ClientRequest {
            object,
            request,
            body,
        })
    }

    /// Tells the server loading finished; replication starts after this
    pub fn notify_loaded(&mut self) -> Result<(), SessionError> {
        self.send(&Message::ClientLoaded)?;
        self.state = SessionState::InGame;
        Ok(())
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.connection.as_ref().map(|connection| SessionHandle {
            connection: connection.handle().clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().map_or(false, Connection::is_open)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn directory(&self) -> &ClientDirectory {
        &self.directory
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// Gives the listener access to the directory between ticks
    pub fn with_listener<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut L, &ClientDirectory) -> R,
    {
        f(&mut self.listener, &self.directory)
    }

    pub fn owns(&self, object: ObjectId) -> bool {
        match (self.client_id, self.directory.owner(object)) {
            (Some(id), Some(owner)) => owner == Owner::Client(id),
            _ => false,
        }
    }

    /// Server clock as of the last state update
    pub fn server_time(&self) -> f32 {
        self.server_time
    }

    pub fn player_count(&self) -> i32 {
        self.player_count
    }
}
