//! Resumable-direct provider: bytes go straight to the storage vendor.
//!
//! The application server only issues the session and records the result:
//!
//! ```text
//!   POST /rooms/{room}/recordings/upload-url  → { upload_url, session_uri, metadata }
//!   PUT  {upload_url}  Content-Range: bytes a-b/*      → 308 Resume Incomplete (Range: bytes=0-b)
//!   PUT  {upload_url}  Content-Range: bytes a-b/total  → 200/201 { id, ... }
//!   POST /rooms/{room}/recordings/confirm     → { recording_id, provider_file_id, web_view_link? }
//! ```
//!
//! Intermediate requests must carry a multiple of `granularity` bytes.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use serde::Deserialize;
use serde_json::{Value, json};
use tabletop_common::http::{ApiClient, ensure_success};
use tabletop_common::models::{RecordingMetadata, UploadProviderKind, UploadReceipt};

use super::{id_string, recordings_path};
use crate::error::{Result, UploadError};
use crate::provider::UploadProvider;
use crate::session::{SessionHandle, UploadSession, UploadStats};

const RESUME_INCOMPLETE: u16 = 308;
const MAX_FINAL_ATTEMPTS: usize = 3;

#[derive(Debug, Deserialize)]
struct SessionResponse {
    upload_url: String,
    session_uri: String,
    #[serde(default)]
    metadata: Value,
}

/// Outcome of one ranged PUT.
enum RangeOutcome {
    /// Vendor persisted this many bytes and wants more.
    Incomplete(usize),
    /// Vendor created the file.
    Complete(Value),
}

pub struct ResumableUploader {
    api: ApiClient,
    granularity: usize,
    session: UploadSession,
    metadata: Option<RecordingMetadata>,
    /// Opaque metadata the application server wants echoed back on confirm.
    server_metadata: Value,
    buffer: BytesMut,
}

impl ResumableUploader {
    pub fn new(api: ApiClient, granularity: usize) -> Self {
        Self {
            api,
            granularity: granularity.max(1),
            session: UploadSession::new(UploadProviderKind::ResumableDirect),
            metadata: None,
            server_metadata: Value::Null,
            buffer: BytesMut::new(),
        }
    }

    fn handle(&self) -> Result<(&str, &str)> {
        match &self.session.handle {
            Some(SessionHandle::Resumable { upload_url, session_uri }) => Ok((upload_url, session_uri)),
            _ => Err(UploadError::NoActiveSession),
        }
    }

    /// PUT the first `len` buffered bytes. `total` is known only on the final request.
    async fn put_range(&mut self, len: usize, total: Option<u64>) -> Result<RangeOutcome> {
        let (upload_url, _) = self.handle()?;
        let offset = self.session.bytes_uploaded;
        let size = total.map_or_else(|| "*".to_owned(), |t| t.to_string());
        let content_range = if len == 0 {
            format!("bytes */{size}")
        } else {
            format!("bytes {offset}-{}/{size}", offset + len as u64 - 1)
        };
        let mime = self
            .metadata
            .as_ref()
            .map_or("application/octet-stream", |m| m.mime_type.as_str());

        let resp = self
            .api
            .direct()
            .put(upload_url)
            .header(CONTENT_RANGE, content_range)
            .header(CONTENT_TYPE, mime)
            .body(Bytes::copy_from_slice(&self.buffer[..len]))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == RESUME_INCOMPLETE {
            let persisted_end = resp
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range_end);
            // No Range header means the vendor kept nothing from this request.
            let committed = persisted_end
                .map(|end| (end + 1).saturating_sub(offset).min(len as u64) as usize)
                .unwrap_or(0);
            if committed == 0 && len > 0 {
                return Err(UploadError::Protocol("storage endpoint persisted no bytes".into()));
            }
            self.commit(committed);
            return Ok(RangeOutcome::Incomplete(committed));
        }

        let resp = ensure_success(resp).await?;
        let file = if status == StatusCode::NO_CONTENT {
            Value::Null
        } else {
            resp.json::<Value>().await.unwrap_or(Value::Null)
        };
        self.commit(len);
        Ok(RangeOutcome::Complete(file))
    }

    fn commit(&mut self, len: usize) {
        self.buffer.advance(len);
        self.session.record_uploaded(len);
    }

    async fn complete(&mut self) -> Result<UploadReceipt> {
        let total = self.session.bytes_uploaded + self.buffer.len() as u64;
        if total == 0 {
            return Err(UploadError::Protocol("recording is empty".into()));
        }

        let mut file = None;
        for _ in 0..MAX_FINAL_ATTEMPTS {
            match self.put_range(self.buffer.len(), Some(total)).await? {
                RangeOutcome::Complete(v) => {
                    file = Some(v);
                    break;
                }
                RangeOutcome::Incomplete(n) => {
                    tracing::debug!(persisted = n, remaining = self.buffer.len(), "Final range partially persisted");
                }
            }
        }
        let file = file.ok_or_else(|| UploadError::Protocol("storage endpoint never completed the file".into()))?;
        let provider_file_id = id_string(file.get("id"));

        let meta = self.metadata.as_ref().ok_or(UploadError::NoActiveSession)?;
        let (_, session_uri) = self.handle()?;
        let body = json!({
            "session_uri": session_uri,
            "metadata": self.server_metadata,
            "provider_file_id": provider_file_id,
            "filename": meta.filename,
            "started_at": meta.started_at,
            "ended_at": Utc::now(),
            "size_bytes": total,
        });
        let confirmed: Value = self
            .api
            .post(&format!("{}/confirm", recordings_path(&meta.room_id)), &body)
            .await?;

        Ok(UploadReceipt {
            recording_id: id_string(confirmed.get("recording_id")),
            provider_file_id: id_string(confirmed.get("provider_file_id")).or(provider_file_id),
            key: None,
            web_view_link: id_string(confirmed.get("web_view_link")),
            size_bytes: total,
        })
    }
}

/// `bytes=0-1048575` → 1048575
fn parse_range_end(header: &str) -> Option<u64> {
    header.trim().strip_prefix("bytes=")?.split('-').nth(1)?.trim().parse().ok()
}

#[async_trait]
impl UploadProvider for ResumableUploader {
    fn kind(&self) -> UploadProviderKind {
        UploadProviderKind::ResumableDirect
    }

    async fn initialize(&mut self, metadata: &RecordingMetadata, first_chunk: &Bytes) -> Result<()> {
        self.session.ensure_can_open()?;

        let body = json!({
            "filename": metadata.filename,
            "mime_type": metadata.mime_type,
            "user_id": metadata.user_id,
            "started_at": metadata.started_at,
            "first_chunk_size": first_chunk.len(),
        });
        let session: SessionResponse = self
            .api
            .post(&format!("{}/upload-url", recordings_path(&metadata.room_id)), &body)
            .await?;

        tracing::info!(room = %metadata.room_id, session = %session.session_uri, "Resumable upload session opened");
        self.session.open(SessionHandle::Resumable {
            upload_url: session.upload_url,
            session_uri: session.session_uri,
        });
        self.server_metadata = session.metadata;
        self.metadata = Some(metadata.clone());
        self.buffer.clear();
        Ok(())
    }

    async fn upload_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.session.require_active()?;

        let before = self.buffer.len();
        self.buffer.extend_from_slice(&chunk);

        let sendable = self.buffer.len() / self.granularity * self.granularity;
        if sendable > 0 {
            if let Err(e) = self.put_range(sendable, None).await {
                self.buffer.truncate(before);
                return Err(e);
            }
        }

        self.session.record_chunk(chunk.len());
        Ok(())
    }

    async fn finalize(&mut self) -> Result<UploadReceipt> {
        self.session.begin_finalize()?;
        match self.complete().await {
            Ok(receipt) => {
                self.session.mark_finalized();
                tracing::info!(
                    recording = ?receipt.recording_id,
                    file = ?receipt.provider_file_id,
                    bytes = receipt.size_bytes,
                    "Resumable upload confirmed"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Resumable upload finalize failed");
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn abort(&mut self) {
        let Some(SessionHandle::Resumable { upload_url, .. }) = self.session.mark_aborted() else {
            return;
        };
        self.buffer.clear();

        // Vendors answer a cancelled session with a 499; any response is fine.
        match self.api.direct().delete(&upload_url).send().await {
            Ok(resp) => tracing::info!(status = %resp.status(), "Resumable upload cancelled"),
            Err(e) => tracing::warn!(error = %e, "Resumable upload cancel failed"),
        }
    }

    fn is_currently_uploading(&self) -> bool {
        self.session.is_active()
    }

    fn upload_stats(&self) -> UploadStats {
        self.session.stats()
    }
}
