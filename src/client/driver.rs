//! Client event loop
//!
//! Owns a [`Peer`] and its [`SignalingChannel`] and feeds them from one
//! `select!` loop, so the peer never needs a lock.

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::protocol::{Message, PairingId};
use crate::session::{MediaEvent, MediaFactory};

use super::channel::{ChannelEvent, SignalingChannel};
use super::config::ClientConfig;
use super::peer::{Peer, PeerCommand, PeerEvent};

/// Handles for talking to a running client
pub struct ClientHandle {
    /// User commands
    pub commands: mpsc::Sender<PeerCommand>,
    /// Events from media transports, tagged with their pairing
    pub media: mpsc::UnboundedSender<(PairingId, MediaEvent)>,
    /// Notifications for the application
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl ClientHandle {
    /// Ask the client to shut down and wait for it
    ///
    /// Returns the error that stopped the client, if it had already stopped
    /// on its own.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(PeerCommand::Shutdown).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Client task failed");
                Err(Error::ChannelClosed)
            }
        }
    }
}

/// Connect to the server and run the client loop in the background
///
/// # Example
/// ```no_run
/// use airwave::client::{spawn, ClientConfig, PeerCommand, PeerEvent};
/// use airwave::session::{IceServer, MediaError, MediaFactory, MediaTransport};
/// # use airwave::protocol::PairingId;
/// # struct Factory;
/// # struct Transport;
/// # impl MediaTransport for Transport {
/// #     fn create_offer(&mut self) -> Result<(), MediaError> { Ok(()) }
/// #     fn create_answer(&mut self) -> Result<(), MediaError> { Ok(()) }
/// #     fn set_remote_description(&mut self, _: airwave::session::SdpKind, _: &str) -> Result<(), MediaError> { Ok(()) }
/// #     fn add_ice_candidate(&mut self, _: &serde_json::Value) -> Result<(), MediaError> { Ok(()) }
/// #     fn add_track(&mut self, _: &airwave::session::AudioTrack) -> Result<(), MediaError> { Ok(()) }
/// #     fn close(&mut self) {}
/// # }
/// # impl MediaFactory for Factory {
/// #     type Transport = Transport;
/// #     fn create(&mut self, _: &PairingId, _: &[IceServer]) -> Result<Transport, MediaError> { Ok(Transport) }
/// # }
///
/// # async fn example() {
/// let mut client = spawn(Factory, ClientConfig::new("ws://localhost:3000"));
/// client.commands.send(PeerCommand::Listen).await.unwrap();
///
/// while let Some(event) = client.events.recv().await {
///     if let PeerEvent::DirectoryUpdated(list) = event {
///         println!("{} broadcasts on the air", list.len());
///     }
/// }
/// # }
/// ```
pub fn spawn<F>(factory: F, config: ClientConfig) -> ClientHandle
where
    F: MediaFactory + Send + 'static,
    F::Transport: Send + 'static,
{
    let tick = config.tick_interval;
    let (channel, channel_events) = SignalingChannel::connect(config.clone());
    let (peer, events) = Peer::new(factory, config);
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (media_tx, media_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(drive(
        peer,
        channel,
        channel_events,
        media_rx,
        commands_rx,
        tick,
    ));

    ClientHandle {
        commands: commands_tx,
        media: media_tx,
        events,
        task,
    }
}

/// Run the client loop until shutdown or the server becomes unreachable
///
/// Returns [`Error::TransportUnreachable`] in the second case.
pub async fn drive<F: MediaFactory>(
    mut peer: Peer<F>,
    channel: SignalingChannel,
    mut channel_events: mpsc::Receiver<ChannelEvent>,
    mut media_events: mpsc::UnboundedReceiver<(PairingId, MediaEvent)>,
    mut commands: mpsc::Receiver<PeerCommand>,
    tick: std::time::Duration,
) -> Result<()> {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            event = channel_events.recv() => {
                let Some(event) = event else { break Ok(()) };
                let unreachable = match event {
                    ChannelEvent::Unreachable { attempts } => Some(attempts),
                    _ => None,
                };
                send_all(&channel, peer.handle_channel_event(event));
                if let Some(attempts) = unreachable {
                    break Err(Error::TransportUnreachable { attempts });
                }
            }
            Some((pairing_id, event)) = media_events.recv() => {
                send_all(&channel, peer.handle_media_event(&pairing_id, event));
            }
            command = commands.recv() => match command {
                Some(PeerCommand::Shutdown) | None => {
                    send_all(&channel, peer.shutdown());
                    break Ok(());
                }
                Some(command) => send_all(&channel, peer.apply(command)),
            },
            now = ticker.tick() => {
                send_all(&channel, peer.poll_timeouts(now.into_std()));
            }
        }
    };

    tracing::debug!("Client loop stopped");
    channel.close().await;
    result
}

fn send_all(channel: &SignalingChannel, messages: Vec<Message>) {
    for message in messages {
        channel.send(message);
    }
}
