// ── Wire codec ──
//
// The device protocol is a small, fixed protobuf schema spoken over a
// binary WebSocket. The messages are hand-written prost structs with
// explicit tags -- no protoc, no build script. Every scalar field is
// `optional`: decoding must distinguish "field absent" from "field at
// its default", because absent fields never overwrite cached state.

use prost::Message as _;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sentinel track name meaning intentional silence, as opposed to an
/// unset/unknown sound.
pub const NO_SOUND: &str = "No sound";

// ── Wire messages ────────────────────────────────────────────────────

/// Top-level wire envelope. Exactly one body is present.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(message, optional, tag = "1")]
    pub request: Option<Request>,
    #[prost(message, optional, tag = "2")]
    pub response: Option<Response>,
    #[prost(message, optional, tag = "3")]
    pub backend: Option<Backend>,
}

/// A command or query. Outbound from us; inbound it is an unsolicited
/// push describing an externally-originated change.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub session_id: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub settings: Option<Settings>,
    #[prost(message, optional, tag = "4")]
    pub status: Option<Status>,
    #[prost(message, optional, tag = "5")]
    pub get_settings: Option<GetSettings>,
}

/// A reply to one of our requests.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
    #[prost(message, optional, tag = "3")]
    pub settings: Option<Settings>,
}

/// Backend chatter. Carries nothing we act on.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Backend {}

/// The full attribute set a device reports or accepts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Settings {
    #[prost(bool, optional, tag = "1")]
    pub is_on: Option<bool>,
    #[prost(float, optional, tag = "2")]
    pub brightness: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub volume: Option<f32>,
    #[prost(message, optional, tag = "4")]
    pub sound: Option<Sound>,
    #[prost(message, optional, tag = "5")]
    pub color: Option<Color>,
    #[prost(message, optional, tag = "6")]
    pub sound_list: Option<SoundList>,
    #[prost(float, optional, tag = "7")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "8")]
    pub humidity: Option<f32>,
}

/// Flags selecting what a state query should return.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSettings {
    #[prost(bool, optional, tag = "1")]
    pub all: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub temperature: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub humidity: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub saved_sounds: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sound {
    #[prost(bool, optional, tag = "1")]
    pub no_sound: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub track: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Color {
    #[prost(bool, optional, tag = "1")]
    pub no_color: Option<bool>,
    #[prost(float, optional, tag = "2")]
    pub hue: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub saturation: Option<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SoundList {
    #[prost(string, repeated, tag = "1")]
    pub tracks: Vec<String>,
}

/// Sensor-only sub-message (temperature/humidity).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub humidity: Option<f32>,
}

// ── Command inputs ───────────────────────────────────────────────────

/// Fields accepted by a control command. Absent fields are omitted from
/// the wire message -- partial commands never reset device state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandParams {
    pub is_on: Option<bool>,
    pub brightness: Option<f32>,
    pub volume: Option<f32>,
    /// Track name; the [`NO_SOUND`] sentinel encodes as `no_sound: true`
    /// with an empty track.
    pub sound: Option<String>,
    pub color: Option<ColorCommand>,
}

/// Color portion of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorCommand {
    pub no_color: bool,
    pub hue: f32,
    pub saturation: f32,
    /// Written into the top-level brightness field, never into the color
    /// sub-message (matches what the device firmware expects).
    pub brightness: Option<f32>,
}

// ── Encoding ─────────────────────────────────────────────────────────

/// Encode a control command.
pub fn encode_command(request_id: u32, params: &CommandParams) -> Vec<u8> {
    let mut settings = Settings {
        is_on: params.is_on,
        brightness: params.brightness,
        volume: params.volume,
        ..Settings::default()
    };

    if let Some(track) = &params.sound {
        settings.sound = Some(if track == NO_SOUND {
            Sound {
                no_sound: Some(true),
                track: Some(String::new()),
            }
        } else {
            Sound {
                no_sound: Some(false),
                track: Some(track.clone()),
            }
        });
    }

    if let Some(color) = &params.color {
        settings.color = Some(Color {
            no_color: Some(color.no_color),
            hue: Some(color.hue),
            saturation: Some(color.saturation),
        });
        if let Some(brightness) = color.brightness {
            settings.brightness = Some(brightness);
        }
    }

    request_frame(request_id, |req| req.settings = Some(settings))
}

/// Encode a state/sensor query: everything plus explicit sensor flags.
pub fn encode_state_request(request_id: u32) -> Vec<u8> {
    request_frame(request_id, |req| {
        req.get_settings = Some(GetSettings {
            all: Some(true),
            temperature: Some(true),
            humidity: Some(true),
            saved_sounds: None,
        });
    })
}

/// Encode a sound-catalog query.
pub fn encode_catalog_request(request_id: u32) -> Vec<u8> {
    request_frame(request_id, |req| {
        req.get_settings = Some(GetSettings {
            saved_sounds: Some(true),
            ..GetSettings::default()
        });
    })
}

fn request_frame(request_id: u32, fill: impl FnOnce(&mut Request)) -> Vec<u8> {
    let mut request = Request {
        id: Some(request_id),
        ..Request::default()
    };
    fill(&mut request);
    Frame {
        request: Some(request),
        ..Frame::default()
    }
    .encode_to_vec()
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Which body a decoded frame carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Reply to one of our requests.
    Response,
    /// Unsolicited push from the device (externally-originated change).
    Request,
    /// Backend chatter, ignored.
    Backend,
}

/// Sparse set of attribute updates extracted from one frame.
///
/// `None` means the field was absent on the wire and the cached value
/// must be left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub is_on: Option<bool>,
    pub brightness: Option<f32>,
    pub volume: Option<f32>,
    pub current_sound: Option<String>,
    pub hue: Option<f32>,
    pub saturation: Option<f32>,
    pub no_color: Option<bool>,
    pub available_sounds: Option<Vec<String>>,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
}

/// Result of decoding one wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub kind: FrameKind,
    pub delta: StateDelta,
    /// True for a *request* frame carrying a settings body: someone other
    /// than us changed the device, so the caller should schedule a
    /// refresh. Status-only pushes update state silently.
    pub external_change: bool,
    /// Echoed request id, present on response frames.
    pub response_id: Option<u32>,
}

/// Decode one binary frame.
///
/// Malformed bytes and empty envelopes are errors for the caller to log
/// and discard; they must never terminate a dispatch loop.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame, Error> {
    let frame = Frame::decode(bytes)?;

    if let Some(response) = frame.response {
        let mut delta = StateDelta::default();
        if let Some(status) = &response.status {
            apply_status(&mut delta, status);
        }
        if let Some(settings) = &response.settings {
            apply_settings(&mut delta, settings);
        }
        return Ok(DecodedFrame {
            kind: FrameKind::Response,
            delta,
            external_change: false,
            response_id: response.id,
        });
    }

    if let Some(request) = frame.request {
        let mut delta = StateDelta::default();
        if let Some(status) = &request.status {
            apply_status(&mut delta, status);
        }
        let external_change = request.settings.is_some();
        if let Some(settings) = &request.settings {
            apply_settings(&mut delta, settings);
        }
        return Ok(DecodedFrame {
            kind: FrameKind::Request,
            delta,
            external_change,
            response_id: None,
        });
    }

    if frame.backend.is_some() {
        return Ok(DecodedFrame {
            kind: FrameKind::Backend,
            delta: StateDelta::default(),
            external_change: false,
            response_id: None,
        });
    }

    Err(Error::EmptyFrame)
}

fn apply_status(delta: &mut StateDelta, status: &Status) {
    if status.temperature.is_some() {
        delta.temperature = status.temperature;
    }
    if status.humidity.is_some() {
        delta.humidity = status.humidity;
    }
}

fn apply_settings(delta: &mut StateDelta, settings: &Settings) {
    if settings.is_on.is_some() {
        delta.is_on = settings.is_on;
    }
    if settings.brightness.is_some() {
        delta.brightness = settings.brightness;
    }
    if settings.volume.is_some() {
        delta.volume = settings.volume;
    }

    if let Some(sound) = &settings.sound {
        if sound.no_sound == Some(true) {
            delta.current_sound = Some(NO_SOUND.to_owned());
        } else if let Some(track) = &sound.track {
            delta.current_sound = Some(track.clone());
        }
    }

    if let Some(color) = &settings.color {
        // Presence semantics: an absent color sub-message touches nothing.
        // Within a present one, an absent no_color flag next to an explicit
        // hue or saturation means color output is enabled.
        if color.no_color.is_some() {
            delta.no_color = color.no_color;
        } else if color.hue.is_some() || color.saturation.is_some() {
            delta.no_color = Some(false);
        }
        if color.hue.is_some() {
            delta.hue = color.hue;
        }
        if color.saturation.is_some() {
            delta.saturation = color.saturation;
        }
    }

    if let Some(sound_list) = &settings.sound_list {
        if !sound_list.tracks.is_empty() {
            let mut available = Vec::with_capacity(sound_list.tracks.len() + 1);
            available.push(NO_SOUND.to_owned());
            available.extend(sound_list.tracks.iter().cloned());
            delta.available_sounds = Some(available);
        }
    }

    if settings.temperature.is_some() {
        delta.temperature = settings.temperature;
    }
    if settings.humidity.is_some() {
        delta.humidity = settings.humidity;
    }
}

// ── Device state ─────────────────────────────────────────────────────

/// Last-known attribute values for one device.
///
/// Updated by sparse merge only: fields absent from a decoded frame keep
/// their prior value and are never reset to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub is_on: Option<bool>,
    /// 0.0..=1.0
    pub brightness: Option<f32>,
    /// 0.0..=1.0
    pub volume: Option<f32>,
    /// Track name; [`NO_SOUND`] means intentional silence.
    pub current_sound: Option<String>,
    /// 0.0..=1.0
    pub hue: Option<f32>,
    /// 0.0..=1.0
    pub saturation: Option<f32>,
    /// True disables color output independent of brightness.
    pub no_color: Option<bool>,
    /// Device-reported catalog, always prefixed with [`NO_SOUND`].
    pub available_sounds: Option<Vec<String>>,
    /// Degrees Celsius.
    pub temperature: Option<f32>,
    /// Percent relative humidity.
    pub humidity: Option<f32>,
}

impl DeviceState {
    /// Fold a decoded delta into this state, overwriting only the fields
    /// the delta carries.
    pub fn merge(&mut self, delta: &StateDelta) {
        if delta.is_on.is_some() {
            self.is_on = delta.is_on;
        }
        if delta.brightness.is_some() {
            self.brightness = delta.brightness;
        }
        if delta.volume.is_some() {
            self.volume = delta.volume;
        }
        if let Some(sound) = &delta.current_sound {
            self.current_sound = Some(sound.clone());
        }
        if delta.hue.is_some() {
            self.hue = delta.hue;
        }
        if delta.saturation.is_some() {
            self.saturation = delta.saturation;
        }
        if delta.no_color.is_some() {
            self.no_color = delta.no_color;
        }
        if let Some(sounds) = &delta.available_sounds {
            self.available_sounds = Some(sounds.clone());
        }
        if delta.temperature.is_some() {
            self.temperature = delta.temperature;
        }
        if delta.humidity.is_some() {
            self.humidity = delta.humidity;
        }
    }

    /// True once any attribute a poll cycle waits on has been reported.
    /// Sensor-only fields don't count -- a device that is off still
    /// reports power/brightness, so these are the liveness markers.
    pub fn has_meaningful_fields(&self) -> bool {
        self.is_on.is_some()
            || self.brightness.is_some()
            || self.volume.is_some()
            || self.current_sound.is_some()
            || self.hue.is_some()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
