//! End-to-end signaling over loopback websockets

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;

use airwave::client::{spawn, ClientConfig, ClientHandle, PeerCommand, PeerEvent};
use airwave::protocol::{codec, BroadcastId, ErrorCode, Message, PairingId};
use airwave::server::{ServerConfig, SignalingServer};
use airwave::session::{
    AudioTrack, FailureReason, IceServer, MediaError, MediaEvent, MediaFactory, MediaTransport,
    PeerConnectionState, SdpKind,
};

const WAIT: Duration = Duration::from_secs(5);

type CallLog = Arc<Mutex<Vec<(PairingId, String)>>>;

/// Records every media command as "<command> <detail>"
struct RecordingTransport {
    pairing_id: PairingId,
    log: CallLog,
}

impl RecordingTransport {
    fn record(&self, entry: String) {
        self.log
            .lock()
            .unwrap()
            .push((self.pairing_id.clone(), entry));
    }
}

impl MediaTransport for RecordingTransport {
    fn create_offer(&mut self) -> Result<(), MediaError> {
        self.record("create-offer".into());
        Ok(())
    }

    fn create_answer(&mut self) -> Result<(), MediaError> {
        self.record("create-answer".into());
        Ok(())
    }

    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        self.record(format!("remote {:?} {}", kind, sdp));
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), MediaError> {
        self.record(format!("candidate {}", candidate));
        Ok(())
    }

    fn add_track(&mut self, track: &AudioTrack) -> Result<(), MediaError> {
        self.record(format!("track {}", track.id));
        Ok(())
    }

    fn close(&mut self) {
        self.record("close".into());
    }
}

#[derive(Clone, Default)]
struct RecordingFactory {
    log: CallLog,
}

impl RecordingFactory {
    fn has(&self, entry: &str) -> bool {
        self.log.lock().unwrap().iter().any(|(_, e)| e == entry)
    }
}

impl MediaFactory for RecordingFactory {
    type Transport = RecordingTransport;

    fn create(
        &mut self,
        pairing_id: &PairingId,
        _ice_servers: &[IceServer],
    ) -> Result<RecordingTransport, MediaError> {
        Ok(RecordingTransport {
            pairing_id: pairing_id.clone(),
            log: Arc::clone(&self.log),
        })
    }
}

/// Serve on `listener` until the returned sender fires
fn serve_on(listener: TcpListener) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let config = ServerConfig::default().directory_push_interval(Duration::from_millis(200));
    let task = tokio::spawn(async move {
        let server = SignalingServer::new(config);
        let _ = server
            .serve(listener, async {
                let _ = stop_rx.await;
            })
            .await;
    });

    (stop_tx, task)
}

async fn start_server() -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, _task) = serve_on(listener);
    (addr, stop_tx)
}

async fn rebind(addr: SocketAddr) -> TcpListener {
    for _ in 0..100 {
        if let Ok(listener) = TcpListener::bind(addr).await {
            return listener;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not bind {} again", addr);
}

fn client(addr: SocketAddr, factory: RecordingFactory) -> ClientHandle {
    let config = ClientConfig::new(format!("ws://{}", addr))
        .reconnect_interval(Duration::from_millis(50))
        .reconnect_jitter(0.0);
    spawn(factory, config)
}

/// Wait for the first event matching `pick`
async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    mut pick: impl FnMut(PeerEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("client stopped");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

#[tokio::test]
async fn broadcaster_and_listener_reach_connected() {
    let (addr, _stop) = start_server().await;

    let broadcaster_media = RecordingFactory::default();
    let listener_media = RecordingFactory::default();
    let mut broadcaster = client(addr, broadcaster_media.clone());
    let mut listener = client(addr, listener_media.clone());

    // broadcaster goes on the air
    wait_for(&mut broadcaster.events, |e| (e == PeerEvent::Connected).then_some(())).await;
    broadcaster
        .commands
        .send(PeerCommand::StartBroadcast {
            name: "Jazz FM".into(),
            tracks: vec![AudioTrack::new("mic", "Microphone")],
        })
        .await
        .unwrap();
    let broadcast_id = wait_for(&mut broadcaster.events, |e| match e {
        PeerEvent::BroadcastStarted { broadcast_id, .. } => Some(broadcast_id),
        _ => None,
    })
    .await;

    // listener sees it in the directory
    wait_for(&mut listener.events, |e| (e == PeerEvent::Connected).then_some(())).await;
    listener.commands.send(PeerCommand::Listen).await.unwrap();
    let listed = wait_for(&mut listener.events, |e| match e {
        PeerEvent::DirectoryUpdated(list) if !list.is_empty() => Some(list),
        _ => None,
    })
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "Jazz FM");
    assert_eq!(listed[0].listener_count, 0);
    assert_eq!(listed[0].id, broadcast_id);

    // listener joins; broadcaster is told to offer
    listener
        .commands
        .send(PeerCommand::Connect(broadcast_id.clone()))
        .await
        .unwrap();
    let pairing_id = wait_for(&mut broadcaster.events, |e| match e {
        PeerEvent::ListenerJoined(id) => Some(id),
        _ => None,
    })
    .await;
    assert!(broadcaster_media.has("create-offer"));

    // offer reaches the listener verbatim
    broadcaster
        .media
        .send((
            pairing_id.clone(),
            MediaEvent::LocalDescription {
                kind: SdpKind::Offer,
                sdp: "O1".into(),
            },
        ))
        .unwrap();
    wait_until(|| listener_media.has("remote Offer O1") && listener_media.has("create-answer")).await;

    // answer reaches the broadcaster verbatim
    listener
        .media
        .send((
            pairing_id.clone(),
            MediaEvent::LocalDescription {
                kind: SdpKind::Answer,
                sdp: "A1".into(),
            },
        ))
        .unwrap();
    wait_until(|| broadcaster_media.has("remote Answer A1")).await;

    for side in [&broadcaster, &listener] {
        side.media
            .send((
                pairing_id.clone(),
                MediaEvent::ConnectionState(PeerConnectionState::Connected),
            ))
            .unwrap();
    }

    let connected = |e: PeerEvent| match e {
        PeerEvent::SessionConnected(id) => Some(id),
        _ => None,
    };
    assert_eq!(wait_for(&mut broadcaster.events, connected).await, pairing_id);
    assert_eq!(wait_for(&mut listener.events, connected).await, pairing_id);

    // the directory reflects the new listener
    let updated = wait_for(&mut listener.events, |e| match e {
        PeerEvent::DirectoryUpdated(list) if list.first().map(|b| b.listener_count) == Some(1) => {
            Some(list)
        }
        _ => None,
    })
    .await;
    assert_eq!(updated[0].id, broadcast_id);

    broadcaster.shutdown().await.unwrap();

    // the listener learns its pairing is gone
    let closed = wait_for(&mut listener.events, |e| match e {
        PeerEvent::SessionClosed(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(closed, pairing_id);

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn broadcaster_can_listen_after_stopping() {
    let (addr, _stop) = start_server().await;
    let mut peer = client(addr, RecordingFactory::default());

    wait_for(&mut peer.events, |e| (e == PeerEvent::Connected).then_some(())).await;
    peer.commands
        .send(PeerCommand::StartBroadcast {
            name: "Jazz FM".into(),
            tracks: Vec::new(),
        })
        .await
        .unwrap();
    wait_for(&mut peer.events, |e| match e {
        PeerEvent::BroadcastStarted { .. } => Some(()),
        _ => None,
    })
    .await;

    peer.commands.send(PeerCommand::StopBroadcast).await.unwrap();
    wait_for(&mut peer.events, |e| (e == PeerEvent::BroadcastStopped).then_some(())).await;

    // same connection, now as a listener
    peer.commands.send(PeerCommand::Listen).await.unwrap();
    let outcome = wait_for(&mut peer.events, |e| match e {
        PeerEvent::DirectoryUpdated(list) => Some(Ok(list)),
        PeerEvent::ServerError { code, .. } => Some(Err(code)),
        _ => None,
    })
    .await;
    assert_eq!(outcome, Ok(Vec::new()));

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn listener_resubscribes_after_server_restart() {
    let bound = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = bound.local_addr().unwrap();
    let (stop, server) = serve_on(bound);

    let mut broadcaster = raw(addr).await;
    let old_broadcast = start_raw(&mut broadcaster, "Jazz FM").await;

    let media = RecordingFactory::default();
    let config = ClientConfig::new(format!("ws://{}", addr))
        .reconnect_interval(Duration::from_millis(50))
        .max_reconnect_delay(Duration::from_millis(200))
        .max_reconnect_attempts(50)
        .reconnect_jitter(0.0);
    let mut listener = spawn(media.clone(), config);

    wait_for(&mut listener.events, |e| (e == PeerEvent::Connected).then_some(())).await;
    listener.commands.send(PeerCommand::Listen).await.unwrap();
    listener
        .commands
        .send(PeerCommand::Connect(old_broadcast.clone()))
        .await
        .unwrap();
    let old_pairing = match recv_matching(&mut broadcaster, |m| {
        matches!(m, Message::ListenerJoined { .. })
    })
    .await
    {
        Message::ListenerJoined { pairing_id, .. } => pairing_id,
        _ => unreachable!(),
    };

    // server goes away; the pairing dies with the connection
    stop.send(()).unwrap();
    server.await.unwrap();

    let failed = wait_for(&mut listener.events, |e| match e {
        PeerEvent::SessionFailed { pairing_id, reason } => Some((pairing_id, reason)),
        _ => None,
    })
    .await;
    assert_eq!(failed, (old_pairing.clone(), FailureReason::TransportLost));
    wait_for(&mut listener.events, |e| (e == PeerEvent::Disconnected).then_some(())).await;
    assert!(media.has("close"));

    let (_stop, _server) = serve_on(rebind(addr).await);

    // reconnected as a new identity; only listeners are sent the directory
    wait_for(&mut listener.events, |e| (e == PeerEvent::Connected).then_some(())).await;
    let list = wait_for(&mut listener.events, |e| match e {
        PeerEvent::DirectoryUpdated(list) => Some(list),
        _ => None,
    })
    .await;
    assert!(list.is_empty());

    let mut second = raw(addr).await;
    let new_broadcast = start_raw(&mut second, "Rock FM").await;
    let list = wait_for(&mut listener.events, |e| match e {
        PeerEvent::DirectoryUpdated(list) if !list.is_empty() => Some(list),
        _ => None,
    })
    .await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, new_broadcast);
    assert_ne!(list[0].id, old_broadcast);
    assert_eq!(list[0].listener_count, 0);

    // the old pairing is not carried over to the new server
    send(
        &mut second,
        Message::Offer {
            pairing_id: old_pairing.clone(),
            sdp: "stale".into(),
        },
    )
    .await;
    let reply = recv_matching(&mut second, |m| matches!(m, Message::Error { .. })).await;
    assert!(matches!(
        reply,
        Message::Error {
            code: ErrorCode::UnknownPairing,
            ..
        }
    ));

    listener.shutdown().await.unwrap();
}

type RawSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw(addr: SocketAddr) -> RawSocket {
    connect_async(format!("ws://{}", addr)).await.unwrap().0
}

async fn send(ws: &mut RawSocket, message: Message) {
    ws.send(codec::to_frame(&message).unwrap()).await.unwrap();
}

async fn start_raw(ws: &mut RawSocket, name: &str) -> BroadcastId {
    send(
        ws,
        Message::BroadcastStart {
            broadcast_info: airwave::protocol::BroadcastInfo::named(name),
        },
    )
    .await;
    match recv_matching(ws, |m| matches!(m, Message::BroadcastStarted { .. })).await {
        Message::BroadcastStarted { broadcast_id, .. } => broadcast_id,
        _ => unreachable!(),
    }
}

async fn recv_matching(ws: &mut RawSocket, pick: impl Fn(&Message) -> bool) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            let frame = ws.next().await.unwrap().unwrap();
            if let Some(message) = codec::from_frame(&frame, 0).unwrap() {
                if pick(&message) {
                    return message;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

#[tokio::test]
async fn connect_to_missing_broadcast_is_rejected() {
    let (addr, _stop) = start_server().await;
    let mut listener = raw(addr).await;

    send(
        &mut listener,
        Message::ConnectRequest {
            broadcast_id: BroadcastId::new("missing"),
        },
    )
    .await;

    let reply = recv_matching(&mut listener, |m| matches!(m, Message::Error { .. })).await;
    assert!(matches!(
        reply,
        Message::Error {
            code: ErrorCode::BroadcastNotFound,
            ..
        }
    ));

    send(&mut listener, Message::Listen).await;
    let list = recv_matching(&mut listener, |m| matches!(m, Message::BroadcastList { .. })).await;
    assert_eq!(
        list,
        Message::BroadcastList {
            broadcasts: Vec::new()
        }
    );
}

#[tokio::test]
async fn two_listeners_get_independent_pairings() {
    let (addr, _stop) = start_server().await;
    let mut broadcaster = raw(addr).await;
    let mut first = raw(addr).await;
    let mut second = raw(addr).await;

    let broadcast_id = start_raw(&mut broadcaster, "Jazz FM").await;

    let mut pairings = Vec::new();
    for listener in [&mut first, &mut second] {
        send(
            listener,
            Message::ConnectRequest {
                broadcast_id: broadcast_id.clone(),
            },
        )
        .await;
        match recv_matching(listener, |m| matches!(m, Message::ConnectAccepted { .. })).await {
            Message::ConnectAccepted { pairing_id, .. } => pairings.push(pairing_id),
            _ => unreachable!(),
        }
    }
    assert_ne!(pairings[0], pairings[1]);

    // the directory shows both listeners
    let list = recv_matching(&mut first, |m| match m {
        Message::BroadcastList { broadcasts } => {
            broadcasts.first().map(|b| b.listener_count) == Some(2)
        }
        _ => false,
    })
    .await;
    assert!(matches!(list, Message::BroadcastList { .. }));

    // a candidate on the first pairing reaches only the first listener
    send(
        &mut broadcaster,
        Message::Candidate {
            pairing_id: pairings[0].clone(),
            candidate: serde_json::json!({"candidate": "for-first"}),
        },
    )
    .await;
    send(
        &mut broadcaster,
        Message::Candidate {
            pairing_id: pairings[1].clone(),
            candidate: serde_json::json!({"candidate": "for-second"}),
        },
    )
    .await;

    let got_first = recv_matching(&mut first, |m| matches!(m, Message::Candidate { .. })).await;
    let got_second = recv_matching(&mut second, |m| matches!(m, Message::Candidate { .. })).await;
    assert_eq!(got_first.pairing_id(), Some(&pairings[0]));
    assert_eq!(got_second.pairing_id(), Some(&pairings[1]));
}
