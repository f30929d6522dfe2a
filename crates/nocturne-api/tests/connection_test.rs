#![allow(clippy::unwrap_used)]
// Connection-manager tests against a loopback WebSocket server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use url::Url;

use nocturne_api::client::CloudClient;
use nocturne_api::connection::ConnectionManager;
use nocturne_api::devices::SpeakerDevice;
use nocturne_api::proto::{CommandParams, Frame, Request, Response, Settings};
use nocturne_api::transport::TransportConfig;

// ── Test server ─────────────────────────────────────────────────────

/// What the loopback server does with each accepted connection, in
/// accept order. Connections beyond the script get `Serve`.
#[derive(Clone, Copy)]
enum Script {
    /// Answer state queries, forward received commands to the channel.
    Serve,
    /// Drop the connection immediately after the handshake.
    DropImmediately,
}

struct WsServer {
    url: Url,
    accepts: Arc<AtomicUsize>,
    commands: mpsc::UnboundedReceiver<Request>,
}

async fn spawn_server(script: Vec<Script>) -> WsServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let (command_tx, commands) = mpsc::unbounded_channel();

    let accept_counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let n = accept_counter.fetch_add(1, Ordering::SeqCst);
            let behavior = script.get(n).copied().unwrap_or(Script::Serve);
            let command_tx = command_tx.clone();

            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                match behavior {
                    Script::DropImmediately => {
                        let _ = ws.close(None).await;
                    }
                    Script::Serve => {
                        while let Some(Ok(msg)) = ws.next().await {
                            let tungstenite::Message::Binary(bytes) = msg else {
                                continue;
                            };
                            let Ok(frame) = Frame::decode(bytes.as_ref()) else {
                                continue;
                            };
                            let Some(request) = frame.request else {
                                continue;
                            };
                            if request.get_settings.is_some() {
                                let reply = Frame {
                                    response: Some(Response {
                                        id: request.id,
                                        status: None,
                                        settings: Some(Settings {
                                            is_on: Some(true),
                                            brightness: Some(0.6),
                                            volume: Some(0.25),
                                            ..Settings::default()
                                        }),
                                    }),
                                    ..Frame::default()
                                };
                                let _ = ws
                                    .send(tungstenite::Message::Binary(
                                        reply.encode_to_vec().into(),
                                    ))
                                    .await;
                            } else {
                                let _ = command_tx.send(request);
                            }
                        }
                    }
                }
            });
        }
    });

    WsServer {
        url: Url::parse(&format!("ws://{addr}/speakers")).unwrap(),
        accepts,
        commands,
    }
}

fn manager(ws_base: Url) -> ConnectionManager {
    let client = CloudClient::new(
        Url::parse("http://127.0.0.1:1").unwrap(),
        &TransportConfig::default(),
        300,
    )
    .unwrap();
    ConnectionManager::new(ws_base, Arc::new(client))
}

fn nursery_device() -> SpeakerDevice {
    SpeakerDevice {
        device_id: "baby-1".into(),
        display_name: "Nursery".into(),
        connection_id: "spk-1".into(),
        connection_name: "Sound + Light".into(),
    }
}

async fn wait_until_disconnected(mgr: &ConnectionManager, device_id: &str) {
    for _ in 0..100 {
        if !mgr.is_connected(device_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection to {device_id} never dropped");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_warms_state_cache_via_initial_request() {
    let server = spawn_server(vec![]).await;
    let mgr = manager(server.url.clone());
    mgr.register_devices(&[nursery_device()]).await;

    assert!(mgr.ensure_connected("baby-1").await);

    let state = mgr
        .wait_for_state("baby-1", None, Duration::from_secs(5))
        .await
        .expect("state arrives from the post-connect request");
    assert_eq!(state.is_on, Some(true));
    assert_eq!(state.brightness, Some(0.6));
    assert_eq!(state.volume, Some(0.25));

    mgr.close_all().await;
}

#[tokio::test]
async fn send_command_reconnects_exactly_once_before_delivering() {
    let mut server = spawn_server(vec![Script::DropImmediately]).await;
    let mgr = manager(server.url.clone());
    mgr.register_devices(&[nursery_device()]).await;

    // First connection dies right after the handshake.
    mgr.ensure_connected("baby-1").await;
    wait_until_disconnected(&mgr, "baby-1").await;
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);

    // The command triggers a single reconnect and is then delivered.
    let params = CommandParams {
        is_on: Some(true),
        volume: Some(0.5),
        ..CommandParams::default()
    };
    assert!(mgr.send_command("baby-1", &params).await);
    assert_eq!(server.accepts.load(Ordering::SeqCst), 2);

    let delivered = tokio::time::timeout(Duration::from_secs(5), server.commands.recv())
        .await
        .expect("command frame reaches the server")
        .expect("channel open");
    let settings = delivered.settings.expect("settings body");
    assert_eq!(settings.is_on, Some(true));
    assert_eq!(settings.volume, Some(0.5));

    mgr.close_all().await;
}

#[tokio::test]
async fn stale_connection_is_evicted_and_state_survives() {
    let mut server = spawn_server(vec![Script::Serve, Script::Serve]).await;
    let mgr = manager(server.url.clone());
    mgr.register_devices(&[nursery_device()]).await;

    assert!(mgr.ensure_connected("baby-1").await);
    let state = mgr
        .wait_for_state("baby-1", None, Duration::from_secs(5))
        .await
        .expect("initial state");
    assert_eq!(state.is_on, Some(true));

    // Tear everything down server-side by closing our end; the cache is
    // cleared on close_all, but a later reconnect repopulates it.
    mgr.close_all().await;
    assert!(mgr.device_state("baby-1").await.is_none());

    assert!(mgr.request_state("baby-1").await);
    let state = mgr
        .wait_for_state("baby-1", None, Duration::from_secs(5))
        .await
        .expect("state after reconnect");
    assert_eq!(state.brightness, Some(0.6));
    assert!(server.accepts.load(Ordering::SeqCst) >= 2);

    // Command frames still flow on the new connection.
    assert!(
        mgr.send_command(
            "baby-1",
            &CommandParams {
                brightness: Some(0.9),
                ..CommandParams::default()
            }
        )
        .await
    );
    let delivered = tokio::time::timeout(Duration::from_secs(5), server.commands.recv())
        .await
        .expect("command frame reaches the server")
        .expect("channel open");
    assert_eq!(delivered.settings.and_then(|s| s.brightness), Some(0.9));

    mgr.close_all().await;
}
