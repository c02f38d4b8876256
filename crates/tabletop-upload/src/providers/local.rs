//! Local provider: the whole segment is posted to the application server at the end.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use reqwest::Method;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tabletop_common::http::{ApiClient, decode};
use tabletop_common::models::{RecordingMetadata, UploadProviderKind, UploadReceipt};

use super::{id_string, recordings_path};
use crate::error::{Result, UploadError};
use crate::provider::UploadProvider;
use crate::session::{SessionHandle, UploadSession, UploadStats};

pub struct LocalUploader {
    api: ApiClient,
    session: UploadSession,
    metadata: Option<RecordingMetadata>,
    buffer: BytesMut,
}

impl LocalUploader {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            session: UploadSession::new(UploadProviderKind::Local),
            metadata: None,
            buffer: BytesMut::new(),
        }
    }

    async fn post_recording(&mut self) -> Result<UploadReceipt> {
        let meta = self.metadata.as_ref().ok_or(UploadError::NoActiveSession)?;
        if self.buffer.is_empty() {
            return Err(UploadError::Protocol("recording is empty".into()));
        }

        let size = self.buffer.len();
        let video = Part::bytes(self.buffer.to_vec())
            .file_name(meta.filename.clone())
            .mime_str(&meta.mime_type)?;
        let form = Form::new()
            .part("video", video)
            .text("user_id", meta.user_id.clone())
            .text("started_at", meta.started_at.to_rfc3339())
            .text("ended_at", Utc::now().to_rfc3339());

        let resp = self
            .api
            .request(Method::POST, &recordings_path(&meta.room_id))
            .multipart(form)
            .send()
            .await?;
        let body: Value = decode(resp).await?;
        self.session.record_uploaded(size);

        Ok(UploadReceipt {
            recording_id: id_string(body.get("recording_id").or_else(|| body.get("id"))),
            provider_file_id: None,
            key: id_string(body.get("key").or_else(|| body.get("path"))),
            web_view_link: None,
            size_bytes: size as u64,
        })
    }
}

#[async_trait]
impl UploadProvider for LocalUploader {
    fn kind(&self) -> UploadProviderKind {
        UploadProviderKind::Local
    }

    async fn initialize(&mut self, metadata: &RecordingMetadata, first_chunk: &Bytes) -> Result<()> {
        self.session.ensure_can_open()?;
        self.session.open(SessionHandle::Local);
        self.metadata = Some(metadata.clone());
        self.buffer.clear();
        tracing::debug!(
            room = %metadata.room_id,
            first_chunk = first_chunk.len(),
            "Local recording session opened"
        );
        Ok(())
    }

    async fn upload_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.session.require_active()?;
        self.buffer.extend_from_slice(&chunk);
        self.session.record_chunk(chunk.len());
        Ok(())
    }

    async fn finalize(&mut self) -> Result<UploadReceipt> {
        self.session.begin_finalize()?;
        match self.post_recording().await {
            Ok(receipt) => {
                self.session.mark_finalized();
                self.buffer.clear();
                tracing::info!(
                    recording = ?receipt.recording_id,
                    bytes = receipt.size_bytes,
                    "Local recording uploaded"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Local recording upload failed");
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn abort(&mut self) {
        if self.session.mark_aborted().is_some() {
            tracing::info!(bytes = self.buffer.len(), "Local recording discarded");
        }
        self.buffer.clear();
    }

    fn is_currently_uploading(&self) -> bool {
        self.session.is_active()
    }

    fn upload_stats(&self) -> UploadStats {
        self.session.stats()
    }
}
