// ── Published state snapshot ──
//
// What external collaborators read: the per-device last-known state plus
// the MFA sentinel flag. The coordinator owns the single writer; readers
// hold cheap `Arc` clones through a watch channel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use nocturne_api::devices::SpeakerDevice;
use nocturne_api::proto::{CommandParams, DeviceState};

/// One device's entry in the published snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub info: SpeakerDevice,
    pub state: DeviceState,
    /// When a state response last refreshed this entry. `None` until the
    /// device answers for the first time.
    pub last_update: Option<DateTime<Utc>>,
}

/// The full published snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub devices: HashMap<String, DeviceSnapshot>,
    /// Sentinel: the session is suspended until a one-time code arrives.
    pub mfa_required: bool,
}

/// Remembered color context for a device, captured whenever a
/// non-"no-color" state is observed or explicitly commanded. Overwritten
/// whole, never merged; used to restore color after a color-disabling
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastColor {
    pub hue: f32,
    pub saturation: f32,
    pub brightness: f32,
}

// ── Optimistic command merge ─────────────────────────────────────────

/// Fold sent command parameters into a state so observers see near-
/// instant feedback before the device confirms. The reconciling state
/// request issued right after resolves any divergence.
pub(crate) fn apply_command(state: &mut DeviceState, params: &CommandParams) {
    if params.is_on.is_some() {
        state.is_on = params.is_on;
    }
    if params.brightness.is_some() {
        state.brightness = params.brightness;
    }
    if params.volume.is_some() {
        state.volume = params.volume;
    }
    if let Some(sound) = &params.sound {
        state.current_sound = Some(sound.clone());
    }
    if let Some(color) = &params.color {
        state.no_color = Some(color.no_color);
        state.hue = Some(color.hue);
        state.saturation = Some(color.saturation);
        if color.brightness.is_some() {
            state.brightness = color.brightness;
        }
    }
}

/// The color worth remembering from an observed state, if any: color
/// output enabled and both hue and saturation reported.
pub(crate) fn remembered_color(state: &DeviceState) -> Option<LastColor> {
    if state.no_color == Some(true) {
        return None;
    }
    match (state.hue, state.saturation) {
        (Some(hue), Some(saturation)) => Some(LastColor {
            hue,
            saturation,
            brightness: state.brightness.unwrap_or(1.0),
        }),
        _ => None,
    }
}
