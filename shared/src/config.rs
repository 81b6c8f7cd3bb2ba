//! Protocol constants and runtime configuration shared by server and client

use std::time::Duration;

/// Largest payload a single frame may carry (the length prefix is a signed short on the wire)
pub const MAX_FRAME_LEN: usize = 32767;

/// Maximum client messages processed per client per server tick
pub const MAX_CLIENT_REQUESTS: usize = 32;

/// Maximum server messages processed per client tick
pub const MAX_SERVER_MESSAGES: usize = 4096;

/// Default number of simultaneously live connections
pub const MAX_CLIENTS: usize = 16;

/// How long the accept loop blocks before re-checking the shutdown signal
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(400);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Tunables for both ends of a connection.
///
/// Every field has a sensible default; tests and binaries override what they
/// need through the `with_*` setters.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Live connections (pending + active) the server admits at once
    pub max_clients: usize,
    /// Messages drained from each client per server tick
    pub max_client_requests: usize,
    /// Messages drained from the server per client tick
    pub max_server_messages: usize,
    pub accept_timeout: Duration,
    pub connect_timeout: Duration,
    /// Deadline for a single frame read; `None` blocks until the peer sends or closes
    pub read_timeout: Option<Duration>,
    /// Upper bound on waiting for the writer to flush during close
    pub close_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_CLIENTS,
            max_client_requests: MAX_CLIENT_REQUESTS,
            max_server_messages: MAX_SERVER_MESSAGES,
            accept_timeout: ACCEPT_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: None,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

impl NetworkConfig {
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_max_client_requests(mut self, max: usize) -> Self {
        self.max_client_requests = max;
        self
    }

    pub fn with_max_server_messages(mut self, max: usize) -> Self {
        self.max_server_messages = max;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}
