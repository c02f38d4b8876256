//! Local media model and the capture collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self { id: id.into(), kind, enabled: true }
    }
}

/// A set of tracks captured or received together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self { id: id.into(), tracks }
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Camera/microphone capture.
///
/// The source owns the stream; the session only keeps shared references and
/// asks the source to toggle or release it.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Arc<MediaStream>>;

    /// Stop every captured track.
    async fn release(&self);

    fn set_audio_enabled(&self, enabled: bool);

    fn set_video_enabled(&self, enabled: bool);
}
