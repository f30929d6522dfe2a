// ── Device directory models ──
//
// The account-entities endpoint returns every baby linked to the account;
// only entries with an attached speaker become controllable devices.
// `CloudClient::list_devices` does the fetch; this module owns the wire
// models and the mapping into `SpeakerDevice`.

use serde::{Deserialize, Serialize};

/// One controllable Sound + Light unit. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerDevice {
    /// Logical id external collaborators address commands to.
    pub device_id: String,
    /// Human-readable name of the owning entity.
    pub display_name: String,
    /// Protocol-level id used to open the device WebSocket. Distinct
    /// from `device_id`.
    pub connection_id: String,
    /// Human-readable name of the speaker unit.
    pub connection_name: String,
}

// ── Wire models ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct BabiesEnvelope {
    #[serde(default)]
    pub babies: Vec<BabyEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BabyEntry {
    pub uid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub speaker: Option<SpeakerAttachment>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SpeakerAttachment {
    #[serde(default)]
    pub attached_to_speaker: bool,
    #[serde(default)]
    pub speaker: Option<SpeakerEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SpeakerEntry {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl BabiesEnvelope {
    /// Map account entries into the device directory, skipping entries
    /// without an attached speaker.
    pub(crate) fn into_devices(self) -> Vec<SpeakerDevice> {
        self.babies
            .into_iter()
            .filter_map(|baby| {
                let device_id = baby.uid?;
                let speaker = baby.speaker.filter(|s| s.attached_to_speaker)?.speaker?;
                Some(SpeakerDevice {
                    device_id,
                    display_name: baby.name.unwrap_or_else(|| "Nanit".to_owned()),
                    connection_name: speaker.name.unwrap_or_else(|| "Sound + Light".to_owned()),
                    connection_id: speaker.uid,
                })
            })
            .collect()
    }
}
