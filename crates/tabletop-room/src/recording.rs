//! Feeds recorder output into an upload provider.
//!
//! Chunks are delivered strictly in order. A chunk that fails is retried with
//! exponential backoff and, if it still fails, stays at the head of an ordered
//! backlog; nothing behind it is sent first and nothing is dropped. While the
//! backlog is over its byte limit the pump stops reading from the recorder,
//! which pushes back on it through the bounded chunk channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tabletop_common::config::UploadConfig;
use tabletop_common::models::{RecordingMetadata, UploadReceipt};
use tabletop_upload::{UploadError, UploadProvider, UploadStats};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::RoomError;
use crate::media::MediaStream;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Start encoding `stream`. Chunks arrive on the returned channel, which
    /// closes after the final chunk once [`MediaRecorder::stop`] is called.
    async fn start(&self, stream: Arc<MediaStream>) -> anyhow::Result<mpsc::Receiver<Bytes>>;

    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RecordingTuning {
    pub max_chunk_retries: u32,
    pub retry_base_delay: Duration,
    pub backlog_limit_bytes: u64,
}

impl Default for RecordingTuning {
    fn default() -> Self {
        Self {
            max_chunk_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            backlog_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

impl From<&UploadConfig> for RecordingTuning {
    fn from(cfg: &UploadConfig) -> Self {
        Self {
            max_chunk_retries: cfg.max_chunk_retries,
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            backlog_limit_bytes: cfg.backlog_limit_bytes,
        }
    }
}

impl RecordingTuning {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.retry_base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordingStats {
    pub upload: Option<UploadStats>,
    pub backlog_chunks: usize,
    pub backlog_bytes: u64,
}

pub struct RecordingController {
    recorder: Arc<dyn MediaRecorder>,
    pump: JoinHandle<Result<Option<UploadReceipt>, UploadError>>,
    stats: watch::Receiver<RecordingStats>,
}

impl RecordingController {
    pub async fn start(
        recorder: Arc<dyn MediaRecorder>,
        provider: Box<dyn UploadProvider>,
        metadata: RecordingMetadata,
        stream: Arc<MediaStream>,
        tuning: RecordingTuning,
    ) -> Result<Self, RoomError> {
        let chunks = recorder.start(stream).await?;
        let (stats_tx, stats) = watch::channel(RecordingStats::default());
        tracing::info!(room = %metadata.room_id, provider = %provider.kind(), "Recording started");

        let pump = Pump {
            provider,
            metadata,
            tuning,
            stats: stats_tx,
            backlog: Backlog::default(),
        };
        let pump = tokio::spawn(pump.run(chunks));
        Ok(Self { recorder, pump, stats })
    }

    pub fn stats(&self) -> RecordingStats {
        self.stats.borrow().clone()
    }

    /// Stop the recorder, drain the backlog and finalize the upload.
    ///
    /// `Ok(None)` means nothing was recorded.
    pub async fn stop(self) -> Result<Option<UploadReceipt>, RoomError> {
        if let Err(e) = self.recorder.stop().await {
            tracing::warn!(error = %e, "Recorder did not stop cleanly, discarding upload");
            self.pump.abort();
            return Err(RoomError::Collaborator(e));
        }
        match self.pump.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(RoomError::Collaborator(anyhow::anyhow!("upload task failed: {e}"))),
        }
    }
}

#[derive(Default)]
struct Backlog {
    chunks: VecDeque<Bytes>,
    bytes: u64,
}

impl Backlog {
    fn push(&mut self, chunk: Bytes) {
        self.bytes += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }

    fn pop(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            self.bytes -= chunk.len() as u64;
        }
    }
}

struct Pump {
    provider: Box<dyn UploadProvider>,
    metadata: RecordingMetadata,
    tuning: RecordingTuning,
    stats: watch::Sender<RecordingStats>,
    backlog: Backlog,
}

impl Pump {
    async fn run(mut self, mut chunks: mpsc::Receiver<Bytes>) -> Result<Option<UploadReceipt>, UploadError> {
        let mut initialized = false;

        while let Some(chunk) = chunks.recv().await {
            if chunk.is_empty() {
                continue;
            }
            if !initialized {
                self.initialize(&chunk).await?;
                initialized = true;
            }
            self.backlog.push(chunk);
            self.flush_or_keep().await?;

            let mut round = 0;
            while self.backlog.bytes > self.tuning.backlog_limit_bytes {
                round += 1;
                tracing::warn!(
                    backlog_bytes = self.backlog.bytes,
                    limit = self.tuning.backlog_limit_bytes,
                    "Upload backlog over limit, holding recorder"
                );
                sleep(self.tuning.delay(round)).await;
                self.flush_or_keep().await?;
            }
        }

        if !initialized {
            tracing::info!(room = %self.metadata.room_id, "Recording stopped before any data");
            return Ok(None);
        }
        self.drain().await?;
        let receipt = self.provider.finalize().await?;
        self.publish_stats();
        tracing::info!(
            room = %self.metadata.room_id,
            bytes = receipt.size_bytes,
            "Recording uploaded"
        );
        Ok(Some(receipt))
    }

    async fn initialize(&mut self, first: &Bytes) -> Result<(), UploadError> {
        let mut attempt = 0;
        loop {
            match self.provider.initialize(&self.metadata, first).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.tuning.max_chunk_retries => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "Upload session start failed, retrying");
                    sleep(self.tuning.delay(attempt)).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Could not start upload session");
                    return Err(e);
                }
            }
        }
    }

    /// Deliver the backlog head-first. Retryable failures leave the rest
    /// queued; anything else aborts the upload.
    async fn flush_or_keep(&mut self) -> Result<(), UploadError> {
        let result = self.flush().await;
        self.publish_stats();
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    error = %e,
                    backlog_chunks = self.backlog.chunks.len(),
                    "Chunk upload failing, keeping backlog"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Chunk upload failed permanently, aborting");
                self.provider.abort().await;
                Err(e)
            }
        }
    }

    async fn flush(&mut self) -> Result<(), UploadError> {
        while let Some(chunk) = self.backlog.chunks.front().cloned() {
            self.deliver(chunk).await?;
            self.backlog.pop();
        }
        Ok(())
    }

    async fn deliver(&mut self, chunk: Bytes) -> Result<(), UploadError> {
        let mut attempt = 0;
        loop {
            match self.provider.upload_chunk(chunk.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.tuning.max_chunk_retries => {
                    attempt += 1;
                    tracing::debug!(error = %e, attempt, bytes = chunk.len(), "Retrying chunk");
                    sleep(self.tuning.delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Final delivery: keep retrying the backlog for a bounded number of
    /// rounds, then give up and abort.
    async fn drain(&mut self) -> Result<(), UploadError> {
        let mut round = 0;
        loop {
            let result = self.flush().await;
            self.publish_stats();
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && round < self.tuning.max_chunk_retries => {
                    round += 1;
                    sleep(self.tuning.delay(round)).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        lost_bytes = self.backlog.bytes,
                        "Could not deliver recording backlog, aborting"
                    );
                    self.provider.abort().await;
                    return Err(e);
                }
            }
        }
    }

    fn publish_stats(&self) {
        self.stats.send_replace(RecordingStats {
            upload: Some(self.provider.upload_stats()),
            backlog_chunks: self.backlog.chunks.len(),
            backlog_bytes: self.backlog.bytes,
        });
    }
}
