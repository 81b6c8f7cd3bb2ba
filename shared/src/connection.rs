//! One TCP connection, split into a socket side and a tick side
//!
//! Each connection runs a reader task and a writer task. The reader turns
//! frames into payloads on a [`HandoffQueue`] that the tick loop drains; the
//! writer serializes outbound frames in order. Neither task touches anything
//! owned by the tick loop: a lost connection is reported exactly once through
//! the [`ConnectionObserver`] and the owner reacts on its next tick.
//!
//! [`Connection`] is the tick-side owner (queue consumer, task handles).
//! [`ConnectionHandle`] is the cheap, cloneable view the tasks, observers and
//! other threads use to send, query state or request a close.

use crate::config::NetworkConfig;
use crate::error::FrameError;
use crate::frame::{encode_frame, read_frame, DISCONNECT_FRAME};
use crate::ids::ClientId;
use crate::message::{Message, MessageType};
use crate::queue::{handoff_queue, HandoffQueue, HandoffSender};
use log::{debug, warn};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const NO_CLIENT_ID: u32 = u32::MAX;

/// Lifecycle of a connection; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Accepting = 0,
    Active = 1,
    Disconnecting = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Accepting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection stopped being open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// This side asked for the close
    Local = 1,
    /// The peer sent a disconnect message
    Remote = 2,
    /// The socket failed or hit end of stream
    Transport = 3,
}

impl DisconnectReason {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(DisconnectReason::Local),
            2 => Some(DisconnectReason::Remote),
            3 => Some(DisconnectReason::Transport),
            _ => None,
        }
    }
}

/// Receives the single loss notification of a connection.
///
/// Called from socket tasks, so implementations must only enqueue work.
pub trait ConnectionObserver: Send + Sync {
    fn disconnected(&self, connection: &ConnectionHandle);
}

#[derive(Debug)]
enum Outbound {
    Handshake(ClientId),
    Frame(Vec<u8>),
    Close,
}

struct Shared {
    peer: SocketAddr,
    client_id: AtomicU32,
    state: AtomicU8,
    reason: AtomicU8,
    reported: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    observer: Arc<dyn ConnectionObserver>,
}

/// Thread-safe view of a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.shared.peer)
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Assigned id; `None` until the connection has been activated
    pub fn client_id(&self) -> Option<ClientId> {
        match self.shared.client_id.load(Ordering::Acquire) {
            NO_CLIENT_ID => None,
            id => Some(ClientId(id)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Accepting or active
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Accepting | ConnectionState::Active
        )
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        DisconnectReason::from_u8(self.shared.reason.load(Ordering::Acquire))
    }

    /// True if both handles refer to the same connection
    pub fn same(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Queues `payload` as one frame.
    ///
    /// Only an oversized payload is reported to the caller. If the transport
    /// is already gone the connection is marked as disconnecting and the
    /// payload is dropped.
    pub fn send(&self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload)?;
        if !self.is_open() {
            debug!("Dropping {} byte frame for closed peer {}", payload.len(), self.peer_addr());
            return Ok(());
        }
        if self.shared.outbound.send(Outbound::Frame(frame)).is_err() {
            self.lost(DisconnectReason::Transport);
        }
        Ok(())
    }

    pub fn send_message(&self, message: &Message) -> Result<(), FrameError> {
        self.send(&message.encode())
    }

    /// Asks the writer to send the disconnect frame and shut the socket down.
    ///
    /// Safe from any thread; the owner still has to call [`Connection::close`]
    /// to join the tasks.
    pub fn request_close(&self) {
        self.set_reason(DisconnectReason::Local);
        self.advance(ConnectionState::Disconnecting);
        let _ = self.shared.outbound.send(Outbound::Close);
    }

    /// Marks the transport as gone and notifies the observer once
    fn lost(&self, reason: DisconnectReason) {
        self.set_reason(reason);
        self.advance(ConnectionState::Disconnecting);
        self.report();
    }

    fn report(&self) {
        if !self.shared.reported.swap(true, Ordering::AcqRel) {
            self.shared.observer.disconnected(self);
        }
    }

    fn set_reason(&self, reason: DisconnectReason) {
        let _ = self
            .shared
            .reason
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Moves the state forward to `next`, never backward
    fn advance(&self, next: ConnectionState) -> bool {
        self.shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < next as u8 {
                    Some(next as u8)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Tick-side owner of a connection
pub struct Connection {
    handle: ConnectionHandle,
    inbound: HandoffQueue<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("queued", &self.inbound.len())
            .finish()
    }
}

impl Connection {
    /// Wraps a freshly accepted socket; the connection stays in `Accepting`
    /// until [`Connection::activate`] hands it an id.
    pub fn accept(
        stream: TcpStream,
        config: &NetworkConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> io::Result<Self> {
        Self::start(stream, None, config, observer)
    }

    /// Wraps a client socket whose handshake has already been read
    pub fn establish(
        stream: TcpStream,
        client_id: ClientId,
        config: &NetworkConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> io::Result<Self> {
        Self::start(stream, Some(client_id), config, observer)
    }

    fn start(
        stream: TcpStream,
        client_id: Option<ClientId>,
        config: &NetworkConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = handoff_queue();

        let state = match client_id {
            Some(_) => ConnectionState::Active,
            None => ConnectionState::Accepting,
        };
        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                peer,
                client_id: AtomicU32::new(client_id.map_or(NO_CLIENT_ID, |id| id.0)),
                state: AtomicU8::new(state as u8),
                reason: AtomicU8::new(0),
                reported: AtomicBool::new(false),
                outbound: outbound_tx,
                observer,
            }),
        };

        let reader = tokio::spawn(read_loop(
            read_half,
            inbound_tx,
            handle.clone(),
            config.read_timeout,
        ));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx, handle.clone()));

        Ok(Self {
            handle,
            inbound,
            reader: Some(reader),
            writer: Some(writer),
            close_timeout: config.close_timeout,
        })
    }

    /// Assigns the id, queues the handshake and enters `Active`.
    ///
    /// A connection that already dropped keeps its id but stays disconnecting.
    pub fn activate(&self, client_id: ClientId) {
        self.handle
            .shared
            .client_id
            .store(client_id.0, Ordering::Release);
        let _ = self
            .handle
            .shared
            .outbound
            .send(Outbound::Handshake(client_id));
        if !self.handle.advance(ConnectionState::Active) {
            debug!("Connection {} dropped before activation", self.handle.peer_addr());
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.handle.client_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), FrameError> {
        self.handle.send(payload)
    }

    pub fn send_message(&self, message: &Message) -> Result<(), FrameError> {
        self.handle.send_message(message)
    }

    /// Hands up to `max` received payloads to `f`
    pub fn drain<F>(&mut self, max: usize, f: F) -> usize
    where
        F: FnMut(Vec<u8>),
    {
        self.inbound.drain(max, f)
    }

    /// Payloads received but not yet drained
    pub fn queued(&self) -> usize {
        self.inbound.len()
    }

    /// Sends the disconnect frame, shuts the socket down and joins both tasks.
    ///
    /// Idempotent; the observer hears about the connection at most once no
    /// matter how many times this runs or whether the peer left first.
    pub async fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.handle.request_close();

        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(self.close_timeout, &mut writer).await.is_err() {
                warn!("Writer for {} did not finish in time", self.handle.peer_addr());
                writer.abort();
                let _ = writer.await;
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        self.handle.advance(ConnectionState::Closed);
        self.handle.report();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: HandoffSender<Vec<u8>>,
    handle: ConnectionHandle,
    timeout: Option<Duration>,
) {
    loop {
        match read_frame(&mut reader, timeout).await {
            Ok(payload) => {
                if payload.first() == Some(&(MessageType::Disconnect.code() as u8)) {
                    debug!("Peer {} sent disconnect", handle.peer_addr());
                    handle.lost(DisconnectReason::Remote);
                    return;
                }
                if !inbound.push(payload) {
                    return;
                }
            }
            Err(FrameError::TooLarge { len }) => {
                warn!("Dropped {} byte frame from {}", len, handle.peer_addr());
            }
            Err(e) => {
                if handle.is_open() {
                    debug!("Connection to {} lost: {}", handle.peer_addr(), e);
                }
                handle.lost(DisconnectReason::Transport);
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handle: ConnectionHandle,
) {
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Handshake(id) => writer.write_all(&id.0.to_be_bytes()).await,
            Outbound::Frame(frame) => writer.write_all(&frame).await,
            Outbound::Close => {
                if let Err(e) = writer.write_all(&DISCONNECT_FRAME).await {
                    debug!("Could not send disconnect to {}: {}", handle.peer_addr(), e);
                }
                let _ = writer.shutdown().await;
                return;
            }
        };

        if let Err(e) = result {
            debug!("Write to {} failed: {}", handle.peer_addr(), e);
            handle.lost(DisconnectReason::Transport);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct CountingObserver {
        calls: AtomicUsize,
    }

    impl CountingObserver {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ConnectionObserver for CountingObserver {
        fn disconnected(&self, _connection: &ConnectionHandle) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Server-side and client-side connections over loopback, handshake done
    async fn pair(
        server_observer: Arc<CountingObserver>,
        client_observer: Arc<CountingObserver>,
    ) -> (Connection, Connection) {
        let config = NetworkConfig::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client_stream = connected.unwrap();
        let (server_stream, _) = accepted.unwrap();

        let server = Connection::accept(server_stream, &config, server_observer).unwrap();
        assert_eq!(server.state(), ConnectionState::Accepting);
        server.activate(ClientId(7));

        let mut id = [0u8; 4];
        client_stream.read_exact(&mut id).await.unwrap();
        assert_eq!(u32::from_be_bytes(id), 7);

        let client = Connection::establish(
            client_stream,
            ClientId(u32::from_be_bytes(id)),
            &config,
            client_observer,
        )
        .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (server, mut client) = pair(Arc::default(), Arc::default()).await;
        assert_eq!(server.state(), ConnectionState::Active);
        assert_eq!(client.client_id(), Some(ClientId(7)));

        for i in 0..50u8 {
            server.send(&[i, i]).unwrap();
        }
        wait_until(|| client.queued() == 50).await;

        let mut received = Vec::new();
        assert_eq!(client.drain(100, |p| received.push(p[0])), 50);
        assert_eq!(received, (0..50).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn double_close_reports_once() {
        let server_observer = Arc::new(CountingObserver::default());
        let (mut server, _client) = pair(server_observer.clone(), Arc::default()).await;

        server.close().await;
        server.close().await;

        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(server.handle().disconnect_reason(), Some(DisconnectReason::Local));
        assert_eq!(server_observer.calls(), 1);
    }

    #[tokio::test]
    async fn peer_close_is_reported_as_remote() {
        let server_observer = Arc::new(CountingObserver::default());
        let client_observer = Arc::new(CountingObserver::default());
        let (mut server, mut client) = pair(server_observer.clone(), client_observer.clone()).await;

        client.close().await;
        wait_until(|| !server.is_open()).await;

        assert_eq!(server.state(), ConnectionState::Disconnecting);
        assert_eq!(server.handle().disconnect_reason(), Some(DisconnectReason::Remote));
        assert_eq!(server_observer.calls(), 1);

        server.close().await;
        assert_eq!(server_observer.calls(), 1);
        assert_eq!(client_observer.calls(), 1);
    }

    #[tokio::test]
    async fn dropped_socket_is_a_transport_loss() {
        let server_observer = Arc::new(CountingObserver::default());
        let (server, client) = pair(server_observer.clone(), Arc::default()).await;

        drop(client);
        wait_until(|| server_observer.calls() == 1).await;
        assert_eq!(server.handle().disconnect_reason(), Some(DisconnectReason::Transport));
    }

    #[tokio::test]
    async fn send_after_close_is_silent_and_oversize_is_reported() {
        let (mut server, _client) = pair(Arc::default(), Arc::default()).await;

        assert!(matches!(
            server.send(&vec![0u8; 40_000]),
            Err(FrameError::TooLarge { len: 40_000 })
        ));

        server.close().await;
        assert!(server.send(&[1, 2, 3]).is_ok());
        server.handle().request_close();
        assert_eq!(server.state(), ConnectionState::Closed);
    }
}
