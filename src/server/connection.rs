//! Per-connection websocket task
//!
//! Performs the websocket upgrade, then shuttles frames between the socket
//! and the hub: decoded inbound messages go to the hub as
//! [`HubEvent::Received`], and the hub's outbound queue for this connection
//! is written to the socket in order. The hub always gets a
//! [`HubEvent::Closed`] once the upgrade succeeded, however the task ends.
//!
//! The websocket layer refuses to buffer anything beyond
//! [`ServerConfig::transport_limit`]; messages between `max_message_size` and
//! that limit get a `MalformedMessage` reply and the connection stays up.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};

use crate::directory::ConnectionId;
use crate::error::{Error, Result};
use crate::protocol::{codec, ErrorCode, Message};

use super::config::ServerConfig;
use super::hub::{outbound, HubEvent, Inbox};

/// One client connection
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    hub: mpsc::Sender<HubEvent>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
        hub: mpsc::Sender<HubEvent>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            config,
            hub,
        }
    }

    /// Upgrade `socket` and serve it until either side closes
    pub async fn run(self, socket: TcpStream) -> Result<()> {
        let upgrade = accept_async_with_config(socket, Some(self.config.websocket_config()));
        let ws = tokio::time::timeout(self.config.handshake_timeout, upgrade)
            .await
            .map_err(|_| Error::HandshakeTimeout(self.config.handshake_timeout))??;

        let (tx, inbox) = outbound(self.config.outbound_queue_capacity);
        self.hub
            .send(HubEvent::Opened {
                id: self.id,
                peer_addr: self.peer_addr,
                tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        let result = self.serve(ws, inbox).await;

        // the hub may already be gone during shutdown
        let _ = self.hub.send(HubEvent::Closed { id: self.id }).await;
        result
    }

    async fn serve(
        &self,
        ws: WebSocketStream<TcpStream>,
        mut inbox: Inbox,
    ) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                message = inbox.messages.recv() => match message {
                    Some(message) => sink.send(codec::to_frame(&message)?).await?,
                    None => {
                        // hub dropped us: shutdown, or we fell too far behind
                        let _ = sink.send(Frame::Close(None)).await;
                        return Ok(());
                    }
                },
                changed = inbox.directory.changed() => {
                    if changed.is_err() {
                        // hub dropped us; write what it queued before that
                        while let Ok(message) = inbox.messages.try_recv() {
                            sink.send(codec::to_frame(&message)?).await?;
                        }
                        let _ = sink.send(Frame::Close(None)).await;
                        return Ok(());
                    }
                    let broadcasts = inbox.directory.borrow_and_update().clone();
                    sink.send(codec::to_frame(&Message::BroadcastList { broadcasts })?).await?;
                },
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        match codec::from_frame(&frame, self.config.max_message_size) {
                            Ok(Some(message)) => {
                                tracing::trace!(
                                    connection_id = self.id,
                                    kind = message.kind(),
                                    "Received message"
                                );
                                self.hub
                                    .send(HubEvent::Received { id: self.id, message })
                                    .await
                                    .map_err(|_| Error::ChannelClosed)?;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                let e = Error::from(e);
                                tracing::warn!(connection_id = self.id, error = %e, "Rejected frame");
                                let code = e.code().unwrap_or(ErrorCode::MalformedMessage);
                                let reply = Message::error(code, e.to_string());
                                sink.send(codec::to_frame(&reply)?).await?;
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }
}
