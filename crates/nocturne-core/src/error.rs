// ── Core error types ──
//
// Consumer-facing errors from nocturne-core. Decode failures and other
// transport-local noise never reach this layer; the `From` impl maps
// what remains into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// A one-time code is required before the session can resume.
    /// Control flow, not a failure.
    #[error("Multi-factor verification pending")]
    MfaPending,

    #[error("Communication failed: {message}")]
    CommunicationFailed { message: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ── Conversion from api-layer errors ─────────────────────────────────

impl From<nocturne_api::Error> for CoreError {
    fn from(err: nocturne_api::Error) -> Self {
        match err {
            nocturne_api::Error::MfaRequired => CoreError::MfaPending,
            nocturne_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            nocturne_api::Error::AuthBackoff { retry_in_secs } => {
                CoreError::AuthenticationFailed {
                    message: format!("re-authentication gated for another {retry_in_secs}s"),
                }
            }
            nocturne_api::Error::MissingCredentials => CoreError::AuthenticationFailed {
                message: "no stored credentials".into(),
            },
            nocturne_api::Error::UnknownDevice { device_id } => {
                CoreError::DeviceNotFound { device_id }
            }
            nocturne_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            other => CoreError::CommunicationFailed {
                message: other.to_string(),
            },
        }
    }
}
