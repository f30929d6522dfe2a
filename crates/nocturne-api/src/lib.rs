// nocturne-api: Async Rust client for the Nanit Sound + Light cloud API
// (REST session + device directory) and the per-device binary WebSocket
// protocol.

pub mod client;
pub mod connection;
pub mod devices;
pub mod error;
pub mod proto;
pub mod session;
pub mod transport;

pub use client::{CloudClient, SessionEvent};
pub use connection::ConnectionManager;
pub use devices::SpeakerDevice;
pub use error::Error;
pub use proto::{ColorCommand, CommandParams, DeviceState, NO_SOUND};
