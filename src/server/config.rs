//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Inbound messages up to this multiple of `max_message_size` are read and
/// answered with an error; larger ones drop the connection
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Websocket upgrade must complete within this time
    pub handshake_timeout: Duration,

    /// How often the directory is pushed to listeners when it changed
    pub directory_push_interval: Duration,

    /// Listener cap per broadcast (0 = unlimited)
    pub max_listeners_per_broadcast: u32,

    /// Capacity of the queue feeding the hub
    pub event_queue_capacity: usize,

    /// Messages the hub may queue for one connection before dropping it
    pub outbound_queue_capacity: usize,

    /// Largest accepted inbound message, in bytes
    pub max_message_size: usize,

    /// Stats update interval
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_connections: 0, // Unlimited
            handshake_timeout: Duration::from_secs(10),
            directory_push_interval: Duration::from_secs(5),
            max_listeners_per_broadcast: 100,
            event_queue_capacity: 1024,
            outbound_queue_capacity: 256,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the directory push interval
    pub fn directory_push_interval(mut self, interval: Duration) -> Self {
        self.directory_push_interval = interval;
        self
    }

    /// Set the per-broadcast listener cap
    pub fn max_listeners_per_broadcast(mut self, max: u32) -> Self {
        self.max_listeners_per_broadcast = max;
        self
    }

    /// Set the per-connection outbound queue capacity
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    /// Set the maximum inbound message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size.max(1);
        self
    }

    /// Largest message the websocket layer will buffer at all
    pub fn transport_limit(&self) -> usize {
        self.max_message_size.saturating_mul(TRANSPORT_LIMIT_FACTOR)
    }

    /// Websocket settings for accepted connections
    pub fn websocket_config(&self) -> WebSocketConfig {
        let limit = self.transport_limit();
        WebSocketConfig::default()
            .max_message_size(Some(limit))
            .max_frame_size(Some(limit))
    }

    /// Set stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}
