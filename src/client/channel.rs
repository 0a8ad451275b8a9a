//! Reconnecting signaling channel
//!
//! A persistent websocket to the signaling server, driven by one background
//! task that runs an explicit state machine:
//!
//! ```text
//!  Connecting ──ok──► Connected(gen) ──drop──► Reconnecting(1) ──ok──► Connected(gen+1)
//!       │                                         │
//!       └──fail──► Reconnecting(n+1) ─── n ≥ max ─┴──► Unreachable
//! ```
//!
//! Every successful connect is a new identity on the server (a new
//! generation). Messages queued while an older generation was current are
//! discarded rather than delivered to the new one.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::codec;
use crate::protocol::Message;

use super::backoff::Backoff;
use super::config::ClientConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// First connect attempt in progress
    Connecting,
    /// Open; `generation` identifies this connection
    Connected { generation: u64 },
    /// Waiting to retry after `attempt - 1` consecutive failures
    Reconnecting { attempt: u32 },
    /// Gave up after too many consecutive failures
    Unreachable,
    /// Closed locally
    Closed,
}

/// Events from the signaling channel, in arrival order
#[derive(Debug)]
pub enum ChannelEvent {
    /// Channel opened as a new server-side identity
    Connected { generation: u64 },
    /// A message arrived
    Message(Message),
    /// Channel dropped unexpectedly; a reconnect is scheduled
    Disconnected { generation: u64 },
    /// Reconnect attempts exhausted; the channel task has stopped
    Unreachable { attempts: u32 },
}

/// Client side of the signaling transport
///
/// # Example
/// ```no_run
/// use airwave::client::{ChannelEvent, ClientConfig, SignalingChannel};
/// use airwave::protocol::Message;
///
/// # async fn example() {
/// let (channel, mut events) = SignalingChannel::connect(ClientConfig::new("ws://localhost:3000"));
///
/// while let Some(event) = events.recv().await {
///     if let ChannelEvent::Connected { .. } = event {
///         channel.send(Message::Listen);
///     }
/// }
/// # }
/// ```
pub struct SignalingChannel {
    outgoing: mpsc::UnboundedSender<(u64, Message)>,
    state: watch::Receiver<ChannelState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SignalingChannel {
    /// Start connecting to the server in the background
    ///
    /// Returns the channel and the receiver for its events. Must be called
    /// from within a tokio runtime.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = ChannelDriver {
            backoff: Backoff::from_config(&config),
            config,
            outgoing: outgoing_rx,
            state: state_tx,
            events: events_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        let channel = Self {
            outgoing: outgoing_tx,
            state: state_rx,
            shutdown: Some(shutdown_tx),
            task,
        };

        (channel, events_rx)
    }

    /// Queue a message for delivery
    ///
    /// Dropped (and logged) unless the channel is currently open. Returns
    /// whether the message was queued; queuing does not guarantee delivery.
    pub fn send(&self, message: Message) -> bool {
        let state = *self.state.borrow();
        match state {
            ChannelState::Connected { generation } => {
                self.outgoing.send((generation, message)).is_ok()
            }
            other => {
                tracing::warn!(
                    kind = message.kind(),
                    state = ?other,
                    "Signaling channel not open, dropping message"
                );
                false
            }
        }
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Close the channel and wait for the background task to finish
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

struct ChannelDriver {
    config: ClientConfig,
    backoff: Backoff,
    outgoing: mpsc::UnboundedReceiver<(u64, Message)>,
    state: watch::Sender<ChannelState>,
    events: mpsc::Sender<ChannelEvent>,
    shutdown: oneshot::Receiver<()>,
}

/// Why a connected session ended
enum SessionEnd {
    /// Closed locally or the channel handle is gone
    Local,
    /// Server or network dropped the connection
    Dropped,
}

impl ChannelDriver {
    async fn run(mut self) {
        let mut generation = 0u64;
        // consecutive failed connect attempts
        let mut failures = 0u32;

        loop {
            let attempt = tokio::select! {
                _ = &mut self.shutdown => break,
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    connect_async(self.config.url.as_str()),
                ) => result,
            };

            match attempt {
                Ok(Ok((ws, _response))) => {
                    failures = 0;
                    generation += 1;

                    let discarded = self.discard_stale();
                    tracing::info!(
                        url = %self.config.url,
                        generation = generation,
                        discarded = discarded,
                        "Signaling channel connected"
                    );

                    self.state.send_replace(ChannelState::Connected { generation });
                    if self
                        .events
                        .send(ChannelEvent::Connected { generation })
                        .await
                        .is_err()
                    {
                        break;
                    }

                    match self.pump(ws, generation).await {
                        SessionEnd::Local => break,
                        SessionEnd::Dropped => {
                            tracing::warn!(generation = generation, "Signaling channel dropped");
                            if self
                                .events
                                .send(ChannelEvent::Disconnected { generation })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(url = %self.config.url, attempt = failures, error = %e, "Connect failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(url = %self.config.url, attempt = failures, "Connect timed out");
                }
            }

            if self.backoff.exhausted(failures) {
                tracing::error!(
                    url = %self.config.url,
                    attempts = failures,
                    "Signaling server unreachable"
                );
                self.state.send_replace(ChannelState::Unreachable);
                let _ = self
                    .events
                    .send(ChannelEvent::Unreachable { attempts: failures })
                    .await;
                return;
            }

            let next = failures + 1;
            let delay = self.backoff.delay(next);
            self.state
                .send_replace(ChannelState::Reconnecting { attempt: next });
            tracing::debug!(attempt = next, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

            tokio::select! {
                _ = &mut self.shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ChannelState::Closed);
        tracing::debug!("Signaling channel closed");
    }

    /// Drop anything queued against an earlier connection
    fn discard_stale(&mut self) -> usize {
        let mut count = 0;
        while self.outgoing.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    async fn pump(&mut self, ws: WsStream, generation: u64) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    // farewell messages were queued before the close was asked for
                    while let Ok((tag, message)) = self.outgoing.try_recv() {
                        if !write(&mut sink, tag, generation, message).await {
                            return SessionEnd::Local;
                        }
                    }
                    let _ = sink.send(Frame::Close(None)).await;
                    return SessionEnd::Local;
                }
                outgoing = self.outgoing.recv() => match outgoing {
                    Some((tag, message)) => {
                        if !write(&mut sink, tag, generation, message).await {
                            return SessionEnd::Dropped;
                        }
                    }
                    None => return SessionEnd::Local,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(frame)) => match codec::from_frame(&frame, 0) {
                        Ok(Some(message)) => {
                            if self.events.send(ChannelEvent::Message(message)).await.is_err() {
                                return SessionEnd::Local;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed server message"),
                    },
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Receive failed");
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                },
            }
        }
    }
}

/// Write one queued message if it belongs to the current connection
///
/// Returns `false` once the socket is unusable.
async fn write<S>(sink: &mut S, tag: u64, generation: u64, message: Message) -> bool
where
    S: futures_util::Sink<Frame> + Unpin,
    S::Error: std::fmt::Display,
{
    if tag != generation {
        tracing::debug!(
            kind = message.kind(),
            queued_for = tag,
            current = generation,
            "Discarding message for superseded connection"
        );
        return true;
    }

    let frame = match codec::to_frame(&message) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode message");
            return true;
        }
    };
    match sink.send(frame).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Send failed");
            false
        }
    }
}
