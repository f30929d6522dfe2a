// ── Runtime account configuration ──
//
// Describes *how* to reach one account's devices. Carries credential
// data and tuning knobs, never touches disk -- the hosting application
// constructs an `AccountConfig` and hands it in.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::CoreError;
use nocturne_api::client::DEFAULT_API_BASE;
use nocturne_api::connection::DEFAULT_WS_BASE;
use nocturne_api::session::DEFAULT_EXPIRY_BUFFER_SECS;

/// Configuration for one account's session and device set.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account email.
    pub email: String,
    /// Account password, retained for automatic re-authentication.
    pub password: SecretString,
    /// Previously persisted refresh token, tried before password login.
    pub refresh_token: Option<String>,
    /// REST endpoint root.
    pub api_base: Url,
    /// Device WebSocket endpoint root.
    pub ws_base: Url,
    /// Backstop poll interval for the refresh loop.
    pub poll_interval: Duration,
    /// Seconds before token expiry at which a refresh is attempted.
    pub expiry_buffer_secs: i64,
    /// Bound on the per-device wait for a state response each cycle.
    pub state_wait_timeout: Duration,
}

impl AccountConfig {
    /// Build a config with defaults for everything but the credentials.
    ///
    /// Missing account fields are fatal here, not retried later.
    pub fn new(email: impl Into<String>, password: SecretString) -> Result<Self, CoreError> {
        let email = email.into();
        if email.trim().is_empty() {
            return Err(CoreError::Config {
                message: "account email must not be empty".into(),
            });
        }
        if password.expose_secret().is_empty() {
            return Err(CoreError::Config {
                message: "account password must not be empty".into(),
            });
        }

        Ok(Self {
            email,
            password,
            refresh_token: None,
            api_base: Url::parse(DEFAULT_API_BASE).map_err(|e| CoreError::Config {
                message: format!("invalid API base: {e}"),
            })?,
            ws_base: Url::parse(DEFAULT_WS_BASE).map_err(|e| CoreError::Config {
                message: format!("invalid WebSocket base: {e}"),
            })?,
            poll_interval: Duration::from_secs(30),
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER_SECS,
            state_wait_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }
}
