// nocturne-core: Coordinator layer between nocturne-api and consumers.
//
// Owns the poll/refresh loop, the published state snapshot, and the
// control entry points external collaborators call.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod snapshot;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::AccountConfig;
pub use coordinator::Coordinator;
pub use error::CoreError;
pub use snapshot::{DeviceSnapshot, LastColor, Snapshot};

// Re-export the api types consumers handle directly.
pub use nocturne_api::{ColorCommand, CommandParams, DeviceState, SessionEvent, SpeakerDevice, NO_SOUND};
