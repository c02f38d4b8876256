//! Recording metadata and receipts exchanged with the upload endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where recorded video ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadProviderKind {
    /// Posted to the application server in one request when the segment ends.
    #[default]
    Local,
    /// S3-compatible multipart upload coordinated by the application server.
    MultipartCloud,
    /// Resumable session URI, bytes sent straight to the third-party endpoint.
    ResumableDirect,
}

impl fmt::Display for UploadProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::MultipartCloud => "multipart_cloud",
            Self::ResumableDirect => "resumable_direct",
        })
    }
}

impl std::str::FromStr for UploadProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "multipart_cloud" | "multipart" | "wasabi" | "s3" => Ok(Self::MultipartCloud),
            "resumable_direct" | "resumable" | "google_drive" => Ok(Self::ResumableDirect),
            other => Err(format!("unknown upload provider '{other}'")),
        }
    }
}

/// Describes one recording segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub room_id: String,
    pub user_id: String,
    pub filename: String,
    pub mime_type: String,
    pub started_at: DateTime<Utc>,
}

impl RecordingMetadata {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let started_at = Utc::now();
        let room_id = room_id.into();
        Self {
            filename: format!("room-{room_id}-{}.webm", started_at.format("%Y%m%d-%H%M%S")),
            room_id,
            user_id: user_id.into(),
            mime_type: "video/webm".into(),
            started_at,
        }
    }
}

/// What the application server reports once a recording is durable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub recording_id: Option<String>,
    pub provider_file_id: Option<String>,
    pub key: Option<String>,
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_aliases_parse() {
        assert_eq!("wasabi".parse::<UploadProviderKind>().unwrap(), UploadProviderKind::MultipartCloud);
        assert_eq!("google_drive".parse::<UploadProviderKind>().unwrap(), UploadProviderKind::ResumableDirect);
        assert!("ftp".parse::<UploadProviderKind>().is_err());
    }

    #[test]
    fn metadata_filename_mentions_room() {
        let meta = RecordingMetadata::new("42", "7");
        assert!(meta.filename.starts_with("room-42-"));
        assert!(meta.filename.ends_with(".webm"));
    }
}
