use tabletop_common::models::Feature;
use thiserror::Error;

use crate::session::SessionState;
use crate::signaling::SlotId;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Peer id must be set before connecting")]
    PeerIdNotSet,

    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Signaling transport closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer manager is not initialized")]
    NotInitialized,

    #[error("No local stream to offer")]
    NoLocalStream,

    #[error("Call to {peer} failed: {source}")]
    CallFailed {
        peer: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Connector(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Operation not allowed while {actual:?}")]
    InvalidState { actual: SessionState },

    #[error("Already joined")]
    AlreadyJoined,

    #[error("Slot {0} does not exist")]
    InvalidSlot(SlotId),

    #[error("Slot {0} is already taken")]
    SlotOccupied(SlotId),

    #[error("Media unavailable: {0}")]
    MediaUnavailable(#[source] anyhow::Error),

    #[error("No camera or microphone tracks available")]
    NoTracks,

    #[error("{} is not available in this room", .0.as_str())]
    FeatureUnavailable(Feature),

    #[error("Room session has stopped")]
    SessionClosed,

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Upload(#[from] tabletop_upload::UploadError),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl RoomError {
    /// Short text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::MediaUnavailable(_) => {
                "Could not access camera/microphone. Check your browser permissions.".into()
            }
            Self::NoTracks => {
                "No camera or microphone was found. Connect a device and try again.".into()
            }
            Self::FeatureUnavailable(Feature::SpeechToText) => {
                "Speech-to-text is not available right now.".into()
            }
            Self::FeatureUnavailable(Feature::Recording) => "Recording is not available right now.".into(),
            Self::SlotOccupied(_) => "That seat is already taken.".into(),
            Self::AlreadyJoined => "You are already seated in this room.".into(),
            Self::Signaling(_) => "Could not reach the room server. Try again in a moment.".into(),
            _ => "Something went wrong joining the room. Try again.".into(),
        }
    }
}
