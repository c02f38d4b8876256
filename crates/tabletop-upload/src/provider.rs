//! The provider contract every upload backend implements.

use async_trait::async_trait;
use bytes::Bytes;
use tabletop_common::models::{RecordingMetadata, UploadProviderKind, UploadReceipt};

use crate::error::Result;
use crate::session::UploadStats;

/// Durable delivery of one recording segment at a time.
///
/// Call order: `initialize` once, `upload_chunk` any number of times, then
/// `finalize` or `abort`. A chunk is either fully accepted (`Ok`) or not
/// accepted at all (`Err`), so the caller can retry the same chunk without
/// duplicating bytes.
#[async_trait]
pub trait UploadProvider: Send + Sync {
    fn kind(&self) -> UploadProviderKind;

    /// Open an upload session for a new segment.
    async fn initialize(&mut self, metadata: &RecordingMetadata, first_chunk: &Bytes) -> Result<()>;

    /// Append a chunk to the active session.
    async fn upload_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Complete the session and materialize the recording record.
    ///
    /// On failure the session is aborted before the error is returned. Calling it
    /// again without a new `initialize` yields `AlreadyFinalized`.
    async fn finalize(&mut self) -> Result<UploadReceipt>;

    /// Best-effort cancellation. Never fails.
    async fn abort(&mut self);

    fn is_currently_uploading(&self) -> bool;

    fn upload_stats(&self) -> UploadStats;
}
