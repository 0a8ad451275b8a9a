//! Print the live broadcast directory
//!
//! Connects as a listener and prints every directory push, with each
//! broadcast's listener count and time on air. Optionally starts a
//! broadcast of its own with `--broadcast NAME` instead.
//!
//! Run with: cargo run --example directory_watch [URL] [--broadcast NAME]
//!
//! No audio is sent: the media transport here only logs what negotiation
//! asks of it.

use std::time::{Duration, SystemTime};

use airwave::client::{spawn, ClientConfig, PeerCommand, PeerEvent};
use airwave::protocol::{format_duration, unix_millis, PairingId};
use airwave::session::{
    AudioTrack, IceServer, MediaError, MediaFactory, MediaTransport, SdpKind,
};

/// Media transport that logs every command
struct LoggingTransport {
    pairing_id: PairingId,
}

impl MediaTransport for LoggingTransport {
    fn create_offer(&mut self) -> Result<(), MediaError> {
        tracing::info!(pairing = %self.pairing_id, "create offer");
        Ok(())
    }

    fn create_answer(&mut self) -> Result<(), MediaError> {
        tracing::info!(pairing = %self.pairing_id, "create answer");
        Ok(())
    }

    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        tracing::info!(pairing = %self.pairing_id, kind = ?kind, len = sdp.len(), "remote description");
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), MediaError> {
        tracing::info!(pairing = %self.pairing_id, candidate = %candidate, "remote candidate");
        Ok(())
    }

    fn add_track(&mut self, track: &AudioTrack) -> Result<(), MediaError> {
        tracing::info!(pairing = %self.pairing_id, track = %track.label, "add track");
        Ok(())
    }

    fn close(&mut self) {
        tracing::info!(pairing = %self.pairing_id, "close");
    }
}

struct LoggingFactory;

impl MediaFactory for LoggingFactory {
    type Transport = LoggingTransport;

    fn create(
        &mut self,
        pairing_id: &PairingId,
        ice_servers: &[IceServer],
    ) -> Result<LoggingTransport, MediaError> {
        tracing::debug!(pairing = %pairing_id, ice_servers = ice_servers.len(), "new transport");
        Ok(LoggingTransport {
            pairing_id: pairing_id.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let broadcast = args
        .iter()
        .position(|a| a == "--broadcast")
        .and_then(|i| args.get(i + 1).cloned());
    let url = args
        .first()
        .filter(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "ws://127.0.0.1:3000".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("airwave=info".parse()?)
                .add_directive("directory_watch=info".parse()?),
        )
        .init();

    let config = ClientConfig::new(url.clone()).connect_timeout(Duration::from_secs(5));
    let mut client = spawn(LoggingFactory, config);

    let first = match broadcast {
        Some(name) => PeerCommand::StartBroadcast {
            name,
            tracks: vec![AudioTrack::new("mic", "Microphone")],
        },
        None => PeerCommand::Listen,
    };
    println!("Connecting to {}", url);

    loop {
        tokio::select! {
            event = client.events.recv() => {
                let Some(event) = event else { break };
                match event {
                    PeerEvent::Connected => {
                        client.commands.send(first.clone()).await?;
                    }
                    PeerEvent::DirectoryUpdated(list) => {
                        let now = unix_millis(SystemTime::now());
                        println!("{} broadcast(s) on the air", list.len());
                        for b in list {
                            println!(
                                "  {:<24} {:>3} listener(s)  on air {}",
                                b.name,
                                b.listener_count,
                                format_duration(b.on_air(now))
                            );
                        }
                    }
                    PeerEvent::SessionFailed { pairing_id, reason } => match reason.code() {
                        Some(code) => println!("Session {} failed: {}", pairing_id, code),
                        None => println!("Session {} failed: {:?}", pairing_id, reason),
                    },
                    PeerEvent::Unreachable { .. } => break,
                    other => println!("{:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    if let Err(e) = client.shutdown().await {
        match e.code() {
            Some(code) => eprintln!("{} ({})", e, code),
            None => eprintln!("{}", e),
        }
    }
    Ok(())
}
