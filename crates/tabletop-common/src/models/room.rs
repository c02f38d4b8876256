//! Room descriptor: the immutable snapshot a room session is built from.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::recording::UploadProviderKind;

fn default_slot_count() -> usize {
    6
}

/// Everything the room core needs to know about a room, owned by the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDescriptor {
    pub room_id: String,
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
    #[serde(default)]
    pub features: RoomFeatures,
    pub invite_code: Option<String>,
    /// Number of video/audio seats shown in the room.
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
}

impl RoomDescriptor {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            participants: Vec::new(),
            features: RoomFeatures::default(),
            invite_code: None,
            slot_count: default_slot_count(),
        }
    }

    pub fn with_participant(mut self, participant: ParticipantRecord) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_features(mut self, features: RoomFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// Look up a participant record by user id.
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantRecord> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

/// A member of the room as the application knows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub user_id: String,
    pub character_name: Option<String>,
    pub username: String,
}

/// Per-room feature switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomFeatures {
    #[serde(default)]
    pub speech_to_text: FeatureToggle,
    #[serde(default)]
    pub recording: RecordingToggle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureToggle {
    pub enabled: bool,
    /// Transcription backend name (e.g. "browser", "assemblyai").
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingToggle {
    pub enabled: bool,
    #[serde(default)]
    pub provider: UploadProviderKind,
}

/// Data-capturing features that require participant consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    #[serde(rename = "stt")]
    SpeechToText,
    Recording,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpeechToText => "stt",
            Self::Recording => "recording",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consent record for one feature. Owned by the consent subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentStatus {
    pub consent_given: bool,
}
