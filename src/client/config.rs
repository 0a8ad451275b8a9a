//! Client configuration

use std::time::Duration;

use crate::session::{IceServer, NegotiationConfig};

/// Signaling client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signaling server URL (`ws://` or `wss://`)
    pub url: String,

    /// Delay before the first reconnect attempt
    pub reconnect_interval: Duration,

    /// Upper bound on the reconnect delay
    pub max_reconnect_delay: Duration,

    /// Consecutive failed attempts before giving up (0 = retry forever)
    pub max_reconnect_attempts: u32,

    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    pub reconnect_jitter: f64,

    /// Time allowed for one connect attempt
    pub connect_timeout: Duration,

    /// Negotiation tuning for every pairing
    pub negotiation: NegotiationConfig,

    /// How often the client loop checks negotiation timeouts
    pub tick_interval: Duration,

    /// STUN/TURN servers handed to media transports
    pub ice_servers: Vec<IceServer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000".into(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            reconnect_jitter: 0.2,
            connect_timeout: Duration::from_secs(10),
            negotiation: NegotiationConfig::default(),
            tick_interval: Duration::from_secs(1),
            ice_servers: IceServer::default_stun(),
        }
    }
}

impl ClientConfig {
    /// Create a config for the given server URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the first reconnect delay
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the maximum reconnect delay
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Set the number of attempts before the server is considered unreachable
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set reconnect jitter, clamped to `0.0..=1.0`
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set negotiation timeout
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation.timeout = timeout;
        self
    }

    /// Replace the ICE server list
    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }
}
