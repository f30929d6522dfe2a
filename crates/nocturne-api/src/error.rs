use thiserror::Error;

/// Top-level error type for the `nocturne-api` crate.
///
/// Covers every failure mode across the REST and WebSocket surfaces.
/// `nocturne-core` maps these into consumer-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login or refresh failed (wrong credentials, rejected token, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// A login attempt was answered with an MFA challenge.
    ///
    /// Control flow, not a failure: the session is suspended until a
    /// one-time code is submitted. Never counted against auth backoff.
    #[error("Multi-factor verification required")]
    MfaRequired,

    /// Re-authentication is gated by the backoff window.
    #[error("Authentication backoff active -- retry in {retry_in_secs}s")]
    AuthBackoff { retry_in_secs: u64 },

    /// No stored credentials available for re-authentication.
    #[error("No stored credentials")]
    MissingCredentials,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Devices ─────────────────────────────────────────────────────
    /// Device discovery returned an unusable payload.
    #[error("Device listing failed (HTTP {status})")]
    DeviceListing { status: u16 },

    /// No directory entry for the requested device id.
    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// Send on a closed or errored WebSocket.
    #[error("WebSocket send failed: {0}")]
    WebSocketSend(String),

    // ── Wire codec ──────────────────────────────────────────────────
    /// Malformed wire bytes. Always local: logged and discarded by the
    /// dispatch loop, never propagated past the connection manager.
    #[error("Frame decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A decoded frame carried none of the known body variants.
    #[error("Frame has no recognized body")]
    EmptyFrame,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates auth is unusable and
    /// re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying on the
    /// next poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocketConnect(_) | Self::WebSocketSend(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error suspends the session pending MFA.
    pub fn is_mfa_required(&self) -> bool {
        matches!(self, Self::MfaRequired)
    }
}
