// ── Device connection manager ──
//
// One persistent binary WebSocket per device, lazily (re)connected.
// A dedicated dispatch task per connection feeds decoded frames into a
// per-device state cache; inbound processing for a device is therefore
// strictly sequential and merges never race each other. Connections are
// generation-tagged so a dispatch task only ever evicts its own entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::CloudClient;
use crate::devices::SpeakerDevice;
use crate::error::Error;
use crate::proto::{self, CommandParams, DecodedFrame, DeviceState};

/// Production device WebSocket endpoint root.
pub const DEFAULT_WS_BASE: &str = "wss://remote.nanit.com/speakers";

/// Bound on graceful shutdown of all connections; a timeout means
/// "proceed anyway, don't block shutdown".
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const CHANGE_CHANNEL_CAPACITY: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ── Manager ──────────────────────────────────────────────────────────

/// Owns every device connection and the per-device state cache.
///
/// Cheaply cloneable; all clones share the same connections and cache.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    ws_base: Url,
    client: Arc<CloudClient>,
    /// Connection metadata by device id, replaced on directory refresh.
    directory: Mutex<HashMap<String, SpeakerDevice>>,
    connections: Mutex<HashMap<String, DeviceConnection>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Device ids whose state changed through an external push.
    change_tx: broadcast::Sender<Arc<str>>,
    request_id: AtomicU32,
    generation: AtomicU64,
}

struct DeviceConnection {
    generation: u64,
    sink: Arc<Mutex<WsSink>>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct CacheEntry {
    state: DeviceState,
    last_response_id: Option<u32>,
    notify: Arc<Notify>,
}

impl ConnectionManager {
    pub fn new(ws_base: Url, client: Arc<CloudClient>) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ws_base,
                client,
                directory: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                change_tx,
                request_id: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to externally-originated state changes (one device id
    /// per push that carried a settings body).
    pub fn state_changes(&self) -> broadcast::Receiver<Arc<str>> {
        self.inner.change_tx.subscribe()
    }

    /// Replace the cached connection metadata used for (re)connects.
    pub async fn register_devices(&self, devices: &[SpeakerDevice]) {
        let mut directory = self.inner.directory.lock().await;
        directory.clear();
        for device in devices {
            directory.insert(device.device_id.clone(), device.clone());
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Health check: a connection exists and its dispatch task is alive.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.inner
            .connections
            .lock()
            .await
            .get(device_id)
            .is_some_and(|conn| !conn.reader.is_finished())
    }

    /// Ensure a healthy connection for the device, opening one with the
    /// current bearer token if needed. A fresh connection immediately
    /// issues a state request so the cache warms without waiting for the
    /// next poll cycle.
    pub async fn ensure_connected(&self, device_id: &str) -> bool {
        if self.is_connected(device_id).await {
            return true;
        }

        let device = self.inner.directory.lock().await.get(device_id).cloned();
        let Some(device) = device else {
            warn!(device = device_id, "no directory entry for connection");
            return false;
        };

        info!(device = device_id, "device connection needed, connecting");
        if let Err(e) = self.connect(&device).await {
            warn!(device = device_id, error = %e, "device connection failed");
            return false;
        }

        let request_id = self.next_request_id();
        if let Err(e) = self
            .send_frame(device_id, proto::encode_state_request(request_id))
            .await
        {
            debug!(device = device_id, error = %e, "post-connect state request failed");
        }

        self.is_connected(device_id).await
    }

    async fn connect(&self, device: &SpeakerDevice) -> Result<(), Error> {
        let ws_url = format!(
            "{}/{}/user_connect/",
            self.inner.ws_base.as_str().trim_end_matches('/'),
            device.connection_id
        );
        let uri: tungstenite::http::Uri = ws_url
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| {
                Error::WebSocketConnect(e.to_string())
            })?;

        let mut request = ClientRequestBuilder::new(uri);
        if let Some(token) = self.inner.client.bearer_token().await {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let (sink, stream) = ws_stream.split();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let device_id: Arc<str> = Arc::from(device.device_id.as_str());

        let reader = tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner),
            Arc::clone(&device_id),
            generation,
            stream,
        ));

        let mut connections = self.inner.connections.lock().await;
        if let Some(stale) = connections.insert(
            device.device_id.clone(),
            DeviceConnection {
                generation,
                sink: Arc::new(Mutex::new(sink)),
                reader,
            },
        ) {
            stale.reader.abort();
        }

        info!(
            device = %device_id,
            connection = %device.connection_id,
            "connected to Sound + Light device"
        );
        Ok(())
    }

    /// Close every connection, waiting up to [`CLOSE_TIMEOUT`] in total
    /// for dispatch tasks to drain.
    pub async fn close_all(&self) {
        let connections: Vec<(String, DeviceConnection)> =
            self.inner.connections.lock().await.drain().collect();

        let deadline = tokio::time::Instant::now() + CLOSE_TIMEOUT;
        for (device_id, conn) in connections {
            {
                let mut sink = conn.sink.lock().await;
                let _ = sink.send(tungstenite::Message::Close(None)).await;
            }
            let mut reader = conn.reader;
            match tokio::time::timeout_at(deadline, &mut reader).await {
                Ok(_) => debug!(device = %device_id, "connection closed"),
                Err(_) => {
                    warn!(device = %device_id, "close timed out, proceeding with shutdown");
                    reader.abort();
                }
            }
        }

        self.inner.cache.lock().await.clear();
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Send a control command, reconnecting first if needed.
    ///
    /// Commands to an unreachable device are dropped, not queued; the
    /// next poll cycle retries connectivity. Returns whether the frame
    /// was handed to the socket.
    pub async fn send_command(&self, device_id: &str, params: &CommandParams) -> bool {
        if !self.ensure_connected(device_id).await {
            warn!(device = device_id, "cannot send command, device unreachable");
            return false;
        }

        let request_id = self.next_request_id();
        match self
            .send_frame(device_id, proto::encode_command(request_id, params))
            .await
        {
            Ok(()) => {
                debug!(device = device_id, request_id, "sent control command");
                true
            }
            Err(e) => {
                warn!(device = device_id, error = %e, "control command send failed");
                false
            }
        }
    }

    /// Request a full state/sensor report.
    pub async fn request_state(&self, device_id: &str) -> bool {
        if !self.ensure_connected(device_id).await {
            warn!(device = device_id, "cannot request state, device unreachable");
            return false;
        }
        let request_id = self.next_request_id();
        match self
            .send_frame(device_id, proto::encode_state_request(request_id))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(device = device_id, error = %e, "state request send failed");
                false
            }
        }
    }

    /// Request the device's saved-sound catalog.
    pub async fn request_sound_catalog(&self, device_id: &str) -> bool {
        if !self.ensure_connected(device_id).await {
            return false;
        }
        let request_id = self.next_request_id();
        match self
            .send_frame(device_id, proto::encode_catalog_request(request_id))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(device = device_id, error = %e, "catalog request send failed");
                false
            }
        }
    }

    async fn send_frame(&self, device_id: &str, bytes: Vec<u8>) -> Result<(), Error> {
        let sink = {
            let connections = self.inner.connections.lock().await;
            let conn = connections.get(device_id).ok_or_else(|| {
                Error::WebSocketSend(format!("no connection for {device_id}"))
            })?;
            Arc::clone(&conn.sink)
        };
        let mut sink = sink.lock().await;
        sink.send(tungstenite::Message::Binary(bytes.into()))
            .await
            .map_err(|e| Error::WebSocketSend(e.to_string()))
    }

    fn next_request_id(&self) -> u32 {
        self.inner.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── State cache ──────────────────────────────────────────────────

    /// Last-known state for a device, if any frame has been merged.
    pub async fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.inner
            .cache
            .lock()
            .await
            .get(device_id)
            .map(|entry| entry.state.clone())
    }

    /// The most recent response id seen for a device. Snapshot this
    /// before a state request to later detect that the device answered.
    pub async fn last_response_id(&self, device_id: &str) -> Option<u32> {
        self.inner
            .cache
            .lock()
            .await
            .get(device_id)
            .and_then(|entry| entry.last_response_id)
    }

    /// Wait until the device's cached state carries a meaningful field,
    /// or its response id advances past `prev_response_id`, or the
    /// timeout elapses (`None`).
    ///
    /// The id-advance arm is a liveness heuristic: it proves the device
    /// answered something, not that the full field set is fresh. Callers
    /// must treat the returned state as last-known, not
    /// guaranteed-current.
    pub async fn wait_for_state(
        &self,
        device_id: &str,
        prev_response_id: Option<u32>,
        timeout: Duration,
    ) -> Option<DeviceState> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = {
                let mut cache = self.inner.cache.lock().await;
                let entry = cache.entry(device_id.to_owned()).or_default();
                if let Some(state) = ready_state(entry, prev_response_id) {
                    return Some(state);
                }
                Arc::clone(&entry.notify)
            };

            let notified = notify.notified();
            tokio::pin!(notified);

            // Re-check after registering the waiter: a merge between the
            // lock release above and here must not be lost.
            {
                let mut cache = self.inner.cache.lock().await;
                let entry = cache.entry(device_id.to_owned()).or_default();
                if let Some(state) = ready_state(entry, prev_response_id) {
                    return Some(state);
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }
}

fn ready_state(entry: &CacheEntry, prev_response_id: Option<u32>) -> Option<DeviceState> {
    let advanced = match (entry.last_response_id, prev_response_id) {
        (Some(current), Some(previous)) => current > previous,
        (Some(_), None) => true,
        _ => false,
    };
    if entry.state.has_meaningful_fields() || advanced {
        Some(entry.state.clone())
    } else {
        None
    }
}

// ── Inbound dispatch ─────────────────────────────────────────────────

/// Read frames until the connection closes or errors. One malformed
/// frame never terminates the loop; the connection entry is evicted on
/// exit so the next `ensure_connected` call reconnects.
async fn dispatch_loop(inner: Arc<Inner>, device_id: Arc<str>, generation: u64, mut stream: WsStream) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(tungstenite::Message::Binary(bytes)) => match proto::decode_frame(&bytes) {
                Ok(decoded) => apply_frame(&inner, &device_id, &decoded).await,
                Err(e) => {
                    debug!(
                        device = %device_id,
                        error = %e,
                        len = bytes.len(),
                        "discarding undecodable frame"
                    );
                }
            },
            Ok(tungstenite::Message::Text(text)) => {
                debug!(device = %device_id, len = text.len(), "ignoring text frame");
            }
            Ok(tungstenite::Message::Close(_)) => {
                info!(device = %device_id, "close frame received");
                break;
            }
            // Ping/pong are answered by tungstenite itself.
            Ok(_) => {}
            Err(e) => {
                warn!(device = %device_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    let mut connections = inner.connections.lock().await;
    if connections
        .get(&*device_id)
        .is_some_and(|conn| conn.generation == generation)
    {
        connections.remove(&*device_id);
        debug!(device = %device_id, "connection gone, will reconnect on next use");
    }
}

/// Merge one decoded frame into the cache and wake waiters. Fires the
/// external-change broadcast at most once per frame.
async fn apply_frame(inner: &Inner, device_id: &Arc<str>, decoded: &DecodedFrame) {
    let notify = {
        let mut cache = inner.cache.lock().await;
        let entry = cache.entry(device_id.to_string()).or_default();
        entry.state.merge(&decoded.delta);
        if decoded.response_id.is_some() {
            entry.last_response_id = decoded.response_id;
        }
        Arc::clone(&entry.notify)
    };
    notify.notify_waiters();

    if decoded.external_change {
        let _ = inner.change_tx.send(Arc::clone(device_id));
    }
}

// ── Tests ────────────────────────────────────────────────────────────
