//! Signaling server listener
//!
//! Handles the TCP accept loop, spawns connection tasks and runs the hub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::hub::{Hub, HubEvent};
use crate::stats::ServerStats;

/// Signaling server
///
/// # Example
/// ```no_run
/// use airwave::server::{ServerConfig, SignalingServer};
///
/// # async fn example() -> airwave::Result<()> {
/// let server = SignalingServer::new(ServerConfig::default());
/// server.run_until(async {
///     let _ = tokio::signal::ctrl_c().await;
/// }).await
/// # }
/// ```
pub struct SignalingServer {
    config: Arc<ServerConfig>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    stats_tx: watch::Sender<ServerStats>,
}

impl SignalingServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };
        let (stats_tx, _) = watch::channel(ServerStats::new());

        Self {
            config: Arc::new(config),
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
            stats_tx,
        }
    }

    /// Subscribe to the stats the hub publishes every tick
    pub fn stats(&self) -> watch::Receiver<ServerStats> {
        self.stats_tx.subscribe()
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(addr = %listener.local_addr()?, "Signaling server listening");

        let (events_tx, hub_handle) = self.spawn_hub();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener, &events_tx) => result,
        };

        // dropping the hub closes every outbound queue, which ends the connections
        hub_handle.abort();

        result
    }

    fn spawn_hub(&self) -> (mpsc::Sender<HubEvent>, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let (hub, mut hub_stats) = Hub::new((*self.config).clone());

        let stats_tx = self.stats_tx.clone();
        let handle = tokio::spawn(async move {
            let forward = async move {
                while hub_stats.changed().await.is_ok() {
                    let stats = hub_stats.borrow_and_update().clone();
                    stats_tx.send_replace(stats);
                }
            };
            tokio::join!(hub.run(events_rx), forward);
        });

        (events_tx, handle)
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        events: &mpsc::Sender<HubEvent>,
    ) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr, events);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        events: &mpsc::Sender<HubEvent>,
    ) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            connection_id = connection_id,
            peer = %peer_addr,
            "New connection"
        );

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let connection = Connection::new(
            connection_id,
            peer_addr,
            Arc::clone(&self.config),
            events.clone(),
        );

        tokio::spawn(async move {
            // held for the lifetime of the connection
            let _permit = permit;

            if let Err(e) = connection.run(socket).await {
                tracing::debug!(
                    connection_id = connection_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(connection_id = connection_id, "Connection task finished");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
