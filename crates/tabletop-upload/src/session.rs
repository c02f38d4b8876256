//! Upload session state shared by all providers.
//!
//! One [`UploadSession`] exists per provider instance. It is opened by
//! `initialize`, and closed by `finalize` or `abort`. Segments are never
//! interleaved through one provider.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabletop_common::config::UploadConfig;
use tabletop_common::models::UploadProviderKind;

use crate::error::{Result, UploadError};

/// Lifecycle of one recording segment's upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Idle,
    Active,
    Finalizing,
    Finalized,
    Aborted,
}

/// Provider-specific handle of an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionHandle {
    /// Local uploads have nothing to hand out until the final post.
    Local,
    Multipart { upload_id: String, key: String },
    Resumable { upload_url: String, session_uri: String },
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub provider: UploadProviderKind,
    pub handle: Option<SessionHandle>,
    /// Bytes accepted through `upload_chunk`.
    pub bytes_received: u64,
    /// Bytes confirmed by the storage endpoint.
    pub bytes_uploaded: u64,
    pub chunks: u64,
    pub status: UploadStatus,
    pub started_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn new(provider: UploadProviderKind) -> Self {
        Self {
            provider,
            handle: None,
            bytes_received: 0,
            bytes_uploaded: 0,
            chunks: 0,
            status: UploadStatus::Idle,
            started_at: None,
        }
    }

    /// Refuse to open a second segment while one is in flight.
    pub fn ensure_can_open(&self) -> Result<()> {
        match self.status {
            UploadStatus::Active | UploadStatus::Finalizing => Err(UploadError::SessionActive),
            _ => Ok(()),
        }
    }

    pub fn open(&mut self, handle: SessionHandle) {
        *self = Self::new(self.provider);
        self.handle = Some(handle);
        self.status = UploadStatus::Active;
        self.started_at = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        self.status == UploadStatus::Active
    }

    pub fn require_active(&self) -> Result<()> {
        match self.status {
            UploadStatus::Active => Ok(()),
            UploadStatus::Finalized | UploadStatus::Finalizing => Err(UploadError::AlreadyFinalized),
            UploadStatus::Aborted => Err(UploadError::Aborted),
            UploadStatus::Idle => Err(UploadError::NoActiveSession),
        }
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.bytes_received += len as u64;
        self.chunks += 1;
    }

    pub fn record_uploaded(&mut self, len: usize) {
        self.bytes_uploaded += len as u64;
    }

    /// Move to `Finalizing`; a second finalize is reported, not repeated.
    pub fn begin_finalize(&mut self) -> Result<()> {
        self.require_active()?;
        self.status = UploadStatus::Finalizing;
        Ok(())
    }

    pub fn mark_finalized(&mut self) {
        self.status = UploadStatus::Finalized;
    }

    /// Returns the handle that was open, if any, so the caller can cancel it remotely.
    pub fn mark_aborted(&mut self) -> Option<SessionHandle> {
        match self.status {
            UploadStatus::Active | UploadStatus::Finalizing => {
                self.status = UploadStatus::Aborted;
                self.handle.clone()
            }
            _ => None,
        }
    }

    pub fn stats(&self) -> UploadStats {
        UploadStats {
            provider: self.provider,
            status: self.status,
            bytes_received: self.bytes_received,
            bytes_uploaded: self.bytes_uploaded,
            chunks: self.chunks,
            started_at: self.started_at,
        }
    }
}

/// Progress snapshot for UI and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub provider: UploadProviderKind,
    pub status: UploadStatus,
    pub bytes_received: u64,
    pub bytes_uploaded: u64,
    pub chunks: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Size knobs for the cloud providers.
#[derive(Debug, Clone)]
pub struct UploadTuning {
    /// Multipart part size; every part except the last must be at least 5 MiB.
    pub multipart_part_size: usize,
    /// Resumable uploads must send multiples of this except for the final request.
    pub resumable_chunk_granularity: usize,
}

impl Default for UploadTuning {
    fn default() -> Self {
        Self {
            multipart_part_size: 5 * 1024 * 1024,
            resumable_chunk_granularity: 256 * 1024,
        }
    }
}

impl From<&UploadConfig> for UploadTuning {
    fn from(cfg: &UploadConfig) -> Self {
        Self {
            multipart_part_size: cfg.multipart_part_size.max(1),
            resumable_chunk_granularity: cfg.resumable_chunk_granularity.max(1),
        }
    }
}
