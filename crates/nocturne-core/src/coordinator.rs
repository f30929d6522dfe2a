// ── Coordinator ──
//
// Drives the whole client: authentication, device discovery, the
// periodic poll loop backing up push updates, snapshot publication, and
// the command entry point. One coordinator per account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AccountConfig;
use crate::error::CoreError;
use crate::snapshot::{self, DeviceSnapshot, LastColor, Snapshot};

use nocturne_api::client::{CloudClient, SessionEvent};
use nocturne_api::connection::{CLOSE_TIMEOUT, ConnectionManager};
use nocturne_api::devices::SpeakerDevice;
use nocturne_api::error::Error as ApiError;
use nocturne_api::proto::{CommandParams, DeviceState};
use nocturne_api::transport::TransportConfig;

// ── Coordinator ──────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc`. Call [`connect`](Self::connect) to
/// authenticate, discover devices, and start the background poll loop;
/// read state through [`snapshot`](Self::snapshot).
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: AccountConfig,
    client: Arc<CloudClient>,
    connections: ConnectionManager,
    /// Device directory; refreshed only when empty, not every cycle.
    devices: Mutex<Vec<SpeakerDevice>>,
    last_colors: Mutex<HashMap<String, LastColor>>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create a coordinator. Does not connect -- call
    /// [`connect`](Self::connect).
    pub fn new(config: AccountConfig) -> Result<Self, CoreError> {
        let client = Arc::new(CloudClient::new(
            config.api_base.clone(),
            &TransportConfig::default(),
            config.expiry_buffer_secs,
        )?);
        let connections = ConnectionManager::new(config.ws_base.clone(), Arc::clone(&client));
        let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot::default()));

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                client,
                connections,
                devices: Mutex::new(Vec::new()),
                last_colors: Mutex::new(HashMap::new()),
                snapshot_tx,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Authenticate, run an initial refresh cycle, and spawn the poll
    /// loop.
    ///
    /// An MFA challenge is not a failure: the initial cycle publishes the
    /// sentinel snapshot and the session stays suspended until
    /// [`submit_mfa_code`](Self::submit_mfa_code) succeeds.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let config = &self.inner.config;
        match self
            .inner
            .client
            .authenticate(&config.email, &config.password, config.refresh_token.clone())
            .await
        {
            Ok(()) => {}
            Err(ApiError::MfaRequired) => {
                info!("account requires MFA verification before devices can be reached");
            }
            Err(e) => return Err(e.into()),
        }

        self.refresh_cycle().await?;

        let mut tasks = self.inner.tasks.lock().await;
        let coordinator = self.clone();
        let cancel = self.inner.cancel.child_token();
        let interval = config.poll_interval;
        tasks.push(tokio::spawn(poll_task(coordinator, interval, cancel)));

        info!("coordinator connected");
        Ok(())
    }

    /// Shut down: stop the poll loop, close every device connection with
    /// a bounded wait, and wipe session secrets.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        for mut task in self.inner.tasks.lock().await.drain(..) {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("poll task still mid-cycle at shutdown, aborting");
                task.abort();
            }
        }
        self.inner.connections.close_all().await;
        self.inner.client.clear_auth().await;
        debug!("coordinator closed");
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Subscribe to snapshot updates.
    pub fn snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// The current snapshot.
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Token-rotation and MFA-required notifications, for persistence
    /// and user-facing re-auth flows.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.client.session_events()
    }

    /// Externally-originated device changes (one id per push).
    pub fn device_changes(&self) -> broadcast::Receiver<Arc<str>> {
        self.inner.connections.state_changes()
    }

    /// Whether the session is suspended waiting on a one-time code.
    pub async fn mfa_pending(&self) -> bool {
        self.inner.client.is_mfa_pending().await
    }

    /// Last remembered color context for a device.
    pub async fn last_color(&self, device_id: &str) -> Option<LastColor> {
        self.inner.last_colors.lock().await.get(device_id).copied()
    }

    // ── Control ──────────────────────────────────────────────────────

    /// Complete a pending MFA challenge and resume normal operation.
    pub async fn submit_mfa_code(&self, code: &str) -> Result<(), CoreError> {
        self.inner.client.complete_mfa(code).await?;
        if let Err(e) = self.refresh_cycle().await {
            warn!(error = %e, "refresh after MFA completion failed");
        }
        Ok(())
    }

    /// Send a control command to a device.
    ///
    /// The parameters are optimistically merged into the published
    /// snapshot for near-instant observer feedback, then one state
    /// request reconciles with ground truth. A command to an unreachable
    /// device is dropped (logged, not an error); connectivity is retried
    /// on the next cycle.
    pub async fn send_command(
        &self,
        device_id: &str,
        params: &CommandParams,
    ) -> Result<(), CoreError> {
        let known = self
            .inner
            .devices
            .lock()
            .await
            .iter()
            .any(|d| d.device_id == device_id);
        if !known {
            return Err(CoreError::DeviceNotFound {
                device_id: device_id.to_owned(),
            });
        }

        debug!(device = device_id, "sending control command");
        let delivered = self.inner.connections.send_command(device_id, params).await;
        if !delivered {
            warn!(device = device_id, "command dropped, device unreachable this cycle");
        }

        // Optimistic local merge so observers see the change immediately.
        self.inner.snapshot_tx.send_modify(|snap| {
            if let Some(entry) = Arc::make_mut(snap).devices.get_mut(device_id) {
                snapshot::apply_command(&mut entry.state, params);
            }
        });

        if let Some(color) = &params.color {
            if !color.no_color {
                self.inner.last_colors.lock().await.insert(
                    device_id.to_owned(),
                    LastColor {
                        hue: color.hue,
                        saturation: color.saturation,
                        brightness: color.brightness.unwrap_or(1.0),
                    },
                );
            }
        }

        if delivered {
            let _ = self.inner.connections.request_state(device_id).await;
        }
        Ok(())
    }

    // ── Refresh cycle ────────────────────────────────────────────────

    /// One full cycle: ensure auth, ensure directory, request fresh state
    /// per device with a bounded wait, fold results into the snapshot.
    ///
    /// Soft failures (backoff, unreachable devices) keep the last good
    /// snapshot; the cycle only errors when nothing can be served at all.
    pub async fn refresh_cycle(&self) -> Result<(), CoreError> {
        let inner = &self.inner;

        if !inner.client.ensure_authenticated().await {
            if inner.client.is_mfa_pending().await {
                info!("session suspended on MFA, publishing sentinel snapshot");
                inner
                    .snapshot_tx
                    .send_modify(|snap| Arc::make_mut(snap).mfa_required = true);
                return Ok(());
            }
            if !inner.snapshot_tx.borrow().devices.is_empty() {
                debug!("authentication gated, serving last good snapshot");
                return Ok(());
            }
            return Err(CoreError::AuthenticationFailed {
                message: "authentication failed and no cached snapshot exists".into(),
            });
        }

        self.ensure_directory().await?;

        let devices = inner.devices.lock().await.clone();
        let now = Utc::now();
        let mut fresh_states: Vec<(String, Option<DeviceState>)> =
            Vec::with_capacity(devices.len());

        for device in &devices {
            let device_id = device.device_id.as_str();
            let previous_id = inner.connections.last_response_id(device_id).await;

            let fresh = if inner.connections.request_state(device_id).await {
                inner
                    .connections
                    .wait_for_state(device_id, previous_id, inner.config.state_wait_timeout)
                    .await
            } else {
                None
            };

            match &fresh {
                Some(state) => {
                    if let Some(color) = snapshot::remembered_color(state) {
                        inner
                            .last_colors
                            .lock()
                            .await
                            .insert(device_id.to_owned(), color);
                    }
                }
                None => warn!(
                    device = device_id,
                    "no device response this cycle, retaining last-known state"
                ),
            }
            fresh_states.push((device_id.to_owned(), fresh));
        }

        inner.snapshot_tx.send_modify(|snap| {
            let snap = Arc::make_mut(snap);
            snap.mfa_required = false;
            for device in &devices {
                snap.devices
                    .entry(device.device_id.clone())
                    .or_insert_with(|| DeviceSnapshot {
                        info: device.clone(),
                        state: DeviceState::default(),
                        last_update: None,
                    });
            }
            for (device_id, fresh) in fresh_states {
                if let Some(state) = fresh {
                    if let Some(entry) = snap.devices.get_mut(&device_id) {
                        entry.state = state;
                        entry.last_update = Some(now);
                    }
                }
            }
        });

        debug!(devices = devices.len(), "refresh cycle complete");
        Ok(())
    }

    /// Fetch the directory when empty, register it with the connection
    /// manager, connect every device, and request each sound catalog
    /// once.
    async fn ensure_directory(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        let mut devices = inner.devices.lock().await;
        if !devices.is_empty() {
            return Ok(());
        }

        let discovered = inner.client.list_devices().await?;
        info!(count = discovered.len(), "discovered Sound + Light devices");
        inner.connections.register_devices(&discovered).await;

        for device in &discovered {
            if inner.connections.ensure_connected(&device.device_id).await {
                let _ = inner
                    .connections
                    .request_sound_catalog(&device.device_id)
                    .await;
            } else {
                warn!(
                    device = %device.device_id,
                    "device unreachable during discovery, will retry next cycle"
                );
            }
        }

        *devices = discovered;
        Ok(())
    }
}

// ── Background poll loop ─────────────────────────────────────────────

/// Fixed-interval backstop to push updates. An external-change broadcast
/// wakes the loop early; the listener never blocks the dispatch task.
async fn poll_task(coordinator: Coordinator, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick

    let mut changes = coordinator.inner.connections.state_changes();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            changed = changes.recv() => {
                match changed {
                    Ok(device_id) => {
                        debug!(device = %device_id, "external change, refreshing early");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change listener lagged, refreshing");
                    }
                    // Sender lives as long as the coordinator; closed
                    // means shutdown is underway.
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        if let Err(e) = coordinator.refresh_cycle().await {
            warn!(error = %e, "refresh cycle failed");
        }
    }

    debug!("poll loop exiting");
}
