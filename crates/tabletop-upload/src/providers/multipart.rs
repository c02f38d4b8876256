//! Multipart-cloud provider: S3-compatible multipart upload brokered by the application server.
//!
//! ```text
//!   POST   /rooms/{room}/recordings/multipart                          → { upload_id, key }
//!   PUT    /rooms/{room}/recordings/multipart/{upload_id}/parts/{n}    → { etag }
//!   POST   /rooms/{room}/recordings/multipart/{upload_id}/complete     → { recording_id, key }
//!   DELETE /rooms/{room}/recordings/multipart/{upload_id}
//! ```
//!
//! Recorder chunks are regrouped into parts of `part_size`; only the final part may be smaller.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use chrono::Utc;
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tabletop_common::http::{ApiClient, decode};
use tabletop_common::models::{RecordingMetadata, UploadProviderKind, UploadReceipt};

use super::{id_string, recordings_path};
use crate::error::{Result, UploadError};
use crate::provider::UploadProvider;
use crate::session::{SessionHandle, UploadSession, UploadStats};

#[derive(Debug, Deserialize)]
struct StartResponse {
    upload_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct PartResponse {
    etag: String,
}

#[derive(Debug, Clone, Serialize)]
struct CompletedPart {
    part_number: u32,
    etag: String,
}

pub struct MultipartUploader {
    api: ApiClient,
    part_size: usize,
    session: UploadSession,
    metadata: Option<RecordingMetadata>,
    /// Bytes not yet sent as a part.
    buffer: BytesMut,
    parts: Vec<CompletedPart>,
}

impl MultipartUploader {
    pub fn new(api: ApiClient, part_size: usize) -> Self {
        Self {
            api,
            part_size: part_size.max(1),
            session: UploadSession::new(UploadProviderKind::MultipartCloud),
            metadata: None,
            buffer: BytesMut::new(),
            parts: Vec::new(),
        }
    }

    fn base_path(&self) -> Result<String> {
        let meta = self.metadata.as_ref().ok_or(UploadError::NoActiveSession)?;
        match &self.session.handle {
            Some(SessionHandle::Multipart { upload_id, .. }) => Ok(format!(
                "{}/multipart/{upload_id}",
                recordings_path(&meta.room_id)
            )),
            _ => Err(UploadError::NoActiveSession),
        }
    }

    fn key(&self) -> Option<&str> {
        match &self.session.handle {
            Some(SessionHandle::Multipart { key, .. }) => Some(key),
            _ => None,
        }
    }

    /// Send the first `len` buffered bytes as the next part and drop them from the buffer.
    async fn send_part(&mut self, len: usize) -> Result<()> {
        let part_number = self.parts.len() as u32 + 1;
        let body = Bytes::copy_from_slice(&self.buffer[..len]);
        let path = format!("{}/parts/{part_number}", self.base_path()?);

        let resp = self
            .api
            .request(Method::PUT, &path)
            .query(&[("key", self.key().unwrap_or_default())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        let part: PartResponse = decode(resp).await?;

        self.buffer.advance(len);
        self.parts.push(CompletedPart { part_number, etag: part.etag });
        self.session.record_uploaded(len);
        tracing::debug!(part = part_number, bytes = len, "Multipart part uploaded");
        Ok(())
    }

    async fn complete(&mut self) -> Result<UploadReceipt> {
        if !self.buffer.is_empty() {
            let len = self.buffer.len();
            self.send_part(len).await?;
        }
        if self.parts.is_empty() {
            return Err(UploadError::Protocol("recording is empty".into()));
        }

        let meta = self.metadata.as_ref().ok_or(UploadError::NoActiveSession)?;
        let body = json!({
            "key": self.key(),
            "parts": self.parts,
            "started_at": meta.started_at,
            "ended_at": Utc::now(),
            "size_bytes": self.session.bytes_uploaded,
            "filename": meta.filename,
        });
        let path = format!("{}/complete", self.base_path()?);
        let resp: Value = self.api.post(&path, &body).await?;

        Ok(UploadReceipt {
            recording_id: id_string(resp.get("recording_id")),
            provider_file_id: None,
            key: id_string(resp.get("key")).or_else(|| self.key().map(str::to_owned)),
            web_view_link: None,
            size_bytes: self.session.bytes_uploaded,
        })
    }
}

#[async_trait]
impl UploadProvider for MultipartUploader {
    fn kind(&self) -> UploadProviderKind {
        UploadProviderKind::MultipartCloud
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
        let start: StartResponse = self
            .api
            .post(&format!("{}/multipart", recordings_path(&metadata.room_id)), &body)
            .await?;

        tracing::info!(
            room = %metadata.room_id,
            upload_id = %start.upload_id,
            key = %start.key,
            "Multipart upload started"
        );
        self.session.open(SessionHandle::Multipart { upload_id: start.upload_id, key: start.key });
        self.metadata = Some(metadata.clone());
        self.buffer.clear();
        self.parts.clear();
        Ok(())
    }

    async fn upload_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.session.require_active()?;

        let before = self.buffer.len();
        self.buffer.extend_from_slice(&chunk);

        let mut sent_any = false;
        while self.buffer.len() >= self.part_size {
            if let Err(e) = self.send_part(self.part_size).await {
                if sent_any {
                    // The chunk's bytes are already partly in sent parts; keep the rest
                    // buffered and let the next call or finalize push it.
                    tracing::warn!(error = %e, "Multipart part deferred");
                    break;
                }
                self.buffer.truncate(before);
                return Err(e);
            }
            sent_any = true;
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
                    parts = self.parts.len(),
                    bytes = receipt.size_bytes,
                    "Multipart upload completed"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Multipart completion failed");
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn abort(&mut self) {
        let path = self.base_path();
        let key = self.key().unwrap_or_default().to_owned();
        let Some(SessionHandle::Multipart { upload_id, .. }) = self.session.mark_aborted() else {
            return;
        };
        self.buffer.clear();

        let Ok(path) = path else { return };
        let result = self.api.request(Method::DELETE, &path).query(&[("key", key)]).send().await;
        match result.map_err(UploadError::from) {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(upload_id = %upload_id, "Multipart upload aborted");
            }
            Ok(resp) => {
                tracing::warn!(upload_id = %upload_id, status = %resp.status(), "Multipart abort rejected");
            }
            Err(e) => tracing::warn!(upload_id = %upload_id, error = %e, "Multipart abort failed"),
        }
    }

    fn is_currently_uploading(&self) -> bool {
        self.session.is_active()
    }

    fn upload_stats(&self) -> UploadStats {
        self.session.stats()
    }
}
