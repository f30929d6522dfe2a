// ── Cloud REST client ──
//
// Login (password + MFA), silent token refresh, and device discovery
// against the Nanit cloud. All session mutation goes through one mutex:
// a refresh never races another refresh or login, so the refresh token
// is never double-rotated.

use chrono::Utc;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use url::Url;

use crate::devices::{BabiesEnvelope, SpeakerDevice};
use crate::error::Error;
use crate::session::{AuthGate, Session};
use crate::transport::TransportConfig;

/// Production REST endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.nanit.com";

/// Versioning header required by the login endpoint.
const API_VERSION_HEADER: (&str, &str) = ("nanit-api-version", "1");

/// MFA delivery channel sent with every login request.
const MFA_CHANNEL: &str = "email";

const EVENT_CHANNEL_CAPACITY: usize = 16;

// ── Session events ───────────────────────────────────────────────────

/// Out-of-band session notifications for external collaborators.
///
/// Replaces ad-hoc callbacks: subscribe via
/// [`CloudClient::session_events`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The refresh token was rotated; persist the new value.
    TokenRotated(String),
    /// Re-authentication hit an unresolved MFA challenge; a user-facing
    /// re-auth flow should collect a one-time code.
    MfaRequired,
}

// ── Wire models ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    mfa_token: Option<String>,
}

// ── CloudClient ──────────────────────────────────────────────────────

/// REST client owning the account session.
pub struct CloudClient {
    http: reqwest::Client,
    api_base: Url,
    session: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
}

impl CloudClient {
    /// Create a client for the given API base.
    pub fn new(
        api_base: Url,
        transport: &TransportConfig,
        expiry_buffer_secs: i64,
    ) -> Result<Self, Error> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            http: transport.build_client()?,
            api_base,
            session: Mutex::new(Session::new(expiry_buffer_secs)),
            events,
        })
    }

    /// Subscribe to token-rotation and MFA-required notifications.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current bearer token, if any. No I/O.
    pub async fn bearer_token(&self) -> Option<String> {
        self.session.lock().await.bearer_token().map(ToOwned::to_owned)
    }

    /// True while a login challenge awaits its one-time code.
    pub async fn is_mfa_pending(&self) -> bool {
        self.session.lock().await.is_mfa_pending()
    }

    // ── Authentication flows ─────────────────────────────────────────

    /// Authenticate with stored-away credentials, trying a silent refresh
    /// first when a refresh token is supplied.
    ///
    /// Returns [`Error::MfaRequired`] when the account answers with a
    /// challenge; the session is then suspended until
    /// [`complete_mfa`](Self::complete_mfa) succeeds.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &SecretString,
        refresh_token: Option<String>,
    ) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        session.store_credentials(email, password.clone());

        if let Some(token) = refresh_token {
            session.set_refresh_token(Some(token));
            if self.refresh_locked(&mut session).await {
                return Ok(());
            }
        }

        self.login_locked(&mut session).await
    }

    /// Ensure a usable access token, refreshing or re-authenticating as
    /// needed. Returns `false` without network I/O when re-auth is gated
    /// by backoff or suspended on a pending MFA challenge.
    pub async fn ensure_authenticated(&self) -> bool {
        let mut session = self.session.lock().await;
        let now = Utc::now().timestamp();

        if session.token_is_fresh(now) {
            return true;
        }

        if session.is_mfa_pending() {
            debug!("session suspended pending MFA code");
            return false;
        }

        // Expiring (or expiry-unknown) token: one silent refresh, then
        // drop the stale token and fall through to a full login.
        if session.refresh_token().is_some() {
            debug!("access token expires soon, attempting refresh");
            if self.refresh_locked(&mut session).await {
                return true;
            }
        }
        session.clear_access_token();

        match session.auth_gate(now) {
            AuthGate::Backoff { retry_in_secs } => {
                debug!(retry_in_secs, "authentication backoff active, skipping attempt");
                return false;
            }
            AuthGate::Allowed => {}
        }

        if !session.has_stored_credentials() {
            debug!("no stored credentials for re-authentication");
            return false;
        }

        match self.login_locked(&mut session).await {
            Ok(()) => true,
            Err(Error::MfaRequired) => {
                info!("MFA required for re-authentication");
                let _ = self.events.send(SessionEvent::MfaRequired);
                false
            }
            Err(e) => {
                warn!(error = %e, "re-authentication failed");
                false
            }
        }
    }

    /// Complete a pending MFA challenge with a one-time code.
    ///
    /// On failure the pending challenge is left intact so a corrected
    /// code can be retried.
    pub async fn complete_mfa(&self, code: &str) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        let Some(mfa_token) = session.pending_mfa_token().map(ToOwned::to_owned) else {
            return Err(Error::Authentication {
                message: "no MFA verification pending".into(),
            });
        };
        let (email, password) = stored_credentials(&session)?;
        let code = normalize_mfa_code(code);

        let body = serde_json::json!({
            "email": email,
            "password": password.expose_secret(),
            "mfa_token": mfa_token,
            "mfa_code": code,
            "channel": MFA_CHANNEL,
        });

        debug!(user = %redact_email(&email), "submitting MFA verification");
        let response = self
            .http
            .post(self.login_url()?)
            .header(API_VERSION_HEADER.0, API_VERSION_HEADER.1)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Authentication {
                message: format!("network error during MFA verification: {e}"),
            })?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let mut message = format!("MFA verification failed: {status}");
            if status == StatusCode::UNAUTHORIZED {
                message.push_str(" - invalid code");
            }
            return Err(Error::Authentication { message });
        }

        let auth: AuthResponse = response.json().await.map_err(Error::Transport)?;
        let Some(access_token) = auth.access_token else {
            return Err(Error::Authentication {
                message: "no access token received after MFA verification".into(),
            });
        };

        self.adopt_tokens_locked(&mut session, access_token, auth.refresh_token);
        info!(user = %redact_email(&email), "MFA verification successful");
        Ok(())
    }

    /// Security wipe: tokens, pending MFA, and stored credentials.
    pub async fn clear_auth(&self) {
        let mut session = self.session.lock().await;
        session.clear_auth_data();
        session.clear_stored_credentials();
    }

    // ── Device directory ─────────────────────────────────────────────

    /// Fetch the controllable devices tied to this account.
    ///
    /// A 401 gets one silent refresh and one retry before surfacing as
    /// an authentication error.
    pub async fn list_devices(&self) -> Result<Vec<SpeakerDevice>, Error> {
        let token = self.bearer_token().await.ok_or_else(|| Error::Authentication {
            message: "not authenticated".into(),
        })?;

        let url = self.api_base.join("babies")?;
        let mut response = self
            .http
            .get(url.clone())
            .bearer_auth(&token)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let refreshed = {
                let mut session = self.session.lock().await;
                self.refresh_locked(&mut session).await
            };
            let token = if refreshed { self.bearer_token().await } else { None };
            let Some(token) = token else {
                return Err(Error::Authentication {
                    message: "token expired and refresh failed".into(),
                });
            };
            response = self.http.get(url).bearer_auth(&token).send().await?;
        }

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::DeviceListing {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let envelope: BabiesEnvelope =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })?;

        let devices = envelope.into_devices();
        for device in &devices {
            info!(
                name = %device.connection_name,
                connection_id = %device.connection_id,
                "found Sound + Light device"
            );
        }
        Ok(devices)
    }

    // ── Internals (session lock held) ────────────────────────────────

    /// Password login. Never called for MFA challenges already pending.
    async fn login_locked(&self, session: &mut Session) -> Result<(), Error> {
        let (email, password) = stored_credentials(session)?;
        let now = Utc::now().timestamp();

        let body = serde_json::json!({
            "email": email,
            "password": password.expose_secret(),
            "channel": MFA_CHANNEL,
        });

        debug!(user = %redact_email(&email), "password login");
        let response = self
            .http
            .post(self.login_url()?)
            .header(API_VERSION_HEADER.0, API_VERSION_HEADER.1)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                session.record_auth_failure(now);
                return Err(Error::Authentication {
                    message: format!("network error during login: {e}"),
                });
            }
        };

        let status = response.status();
        if status == StatusCode::CREATED {
            let auth: AuthResponse = response.json().await.map_err(Error::Transport)?;
            let Some(access_token) = auth.access_token else {
                session.record_auth_failure(now);
                return Err(Error::Authentication {
                    message: "login succeeded but no access token returned".into(),
                });
            };
            self.adopt_tokens_locked(session, access_token, auth.refresh_token);
            info!(user = %redact_email(&email), "authentication successful");
            return Ok(());
        }

        // 482 is the MFA-challenge status; some deployments answer 200.
        // Not an authentication failure: no backoff accounting.
        if status == StatusCode::OK || status.as_u16() == 482 {
            let auth: AuthResponse = response.json().await.map_err(Error::Transport)?;
            if let Some(mfa_token) = auth.mfa_token {
                info!(user = %redact_email(&email), "MFA verification required");
                session.set_pending_mfa(mfa_token);
                return Err(Error::MfaRequired);
            }
            session.record_auth_failure(now);
            return Err(Error::Authentication {
                message: format!("login failed: {status} without MFA token"),
            });
        }

        session.record_auth_failure(now);
        let preview = response.text().await.unwrap_or_default();
        Err(Error::Authentication {
            message: format!("login failed: {status} - {}", truncate(&preview, 100)),
        })
    }

    /// Silent token refresh. Absorbs failure into `false`; a dead refresh
    /// token (404/401) also drops both tokens.
    async fn refresh_locked(&self, session: &mut Session) -> bool {
        let Some(refresh_token) = session.refresh_token().map(ToOwned::to_owned) else {
            debug!("no refresh token available");
            return false;
        };

        let url = match self.api_base.join("tokens/refresh") {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "invalid refresh URL");
                return false;
            }
        };

        let body = serde_json::json!({ "refresh_token": refresh_token });
        let response = match self.http.post(url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "network error during token refresh");
                return false;
            }
        };

        let status = response.status();
        if status == StatusCode::OK {
            return match response.json::<AuthResponse>().await {
                Ok(auth) => {
                    if let Some(access_token) = auth.access_token {
                        self.adopt_tokens_locked(session, access_token, auth.refresh_token);
                        info!("token refresh successful");
                        true
                    } else {
                        warn!("refresh response carried no access token");
                        false
                    }
                }
                Err(e) => {
                    warn!(error = %e, "undecodable refresh response");
                    false
                }
            };
        }

        if status == StatusCode::NOT_FOUND || status == StatusCode::UNAUTHORIZED {
            info!(status = %status, "refresh token rejected, re-authentication required");
            session.clear_tokens();
            return false;
        }

        warn!(status = %status, "token refresh failed, will retry with full login");
        false
    }

    fn adopt_tokens_locked(
        &self,
        session: &mut Session,
        access_token: String,
        refresh_token: Option<String>,
    ) {
        if let Some(rotated) = session.adopt_tokens(access_token, refresh_token) {
            let _ = self.events.send(SessionEvent::TokenRotated(rotated));
        }
    }

    fn login_url(&self) -> Result<Url, Error> {
        Ok(self.api_base.join("login")?)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn stored_credentials(session: &Session) -> Result<(String, SecretString), Error> {
    let email = session
        .stored_email()
        .ok_or(Error::MissingCredentials)?
        .to_owned();
    let password = session
        .stored_password()
        .cloned()
        .ok_or(Error::MissingCredentials)?;
    Ok((email, password))
}

/// Strip whitespace and surrounding double quotes from a pasted code.
fn normalize_mfa_code(code: &str) -> String {
    let trimmed = code.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
        .to_owned()
}

/// Redact the mailbox half of an address for log lines.
fn redact_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, _)) => format!("{local}@***"),
        None => "***".to_owned(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
