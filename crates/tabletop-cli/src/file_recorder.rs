//! A [`MediaRecorder`] that replays a file from disk, so a finished
//! recording can be pushed through the same upload pipeline as a live one.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tabletop_room::media::MediaStream;
use tabletop_room::recording::MediaRecorder;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub struct FileRecorder {
    path: PathBuf,
    chunk_size: usize,
    reader: Mutex<Option<JoinHandle<anyhow::Result<u64>>>>,
}

impl FileRecorder {
    pub fn new(path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self { path: path.into(), chunk_size: chunk_size.max(1), reader: Mutex::new(None) }
    }
}

#[async_trait]
impl MediaRecorder for FileRecorder {
    async fn start(&self, _stream: Arc<MediaStream>) -> anyhow::Result<mpsc::Receiver<Bytes>> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        // Small buffer so a slow upload holds the reader back.
        let (tx, rx) = mpsc::channel(4);
        let chunk_size = self.chunk_size;

        let reader = tokio::spawn(async move {
            let mut total = 0u64;
            loop {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                while filled < chunk_size {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    break;
                }
                buf.truncate(filled);
                total += filled as u64;
                if tx.send(Bytes::from(buf)).await.is_err() {
                    anyhow::bail!("upload stopped reading");
                }
                if filled < chunk_size {
                    break;
                }
            }
            Ok(total)
        });
        *self.reader.lock().await = Some(reader);
        Ok(rx)
    }

    /// Waits for the file to be read to the end.
    async fn stop(&self) -> anyhow::Result<()> {
        let Some(reader) = self.reader.lock().await.take() else { return Ok(()) };
        let total = reader.await.context("file reader panicked")??;
        tracing::debug!(path = %self.path.display(), bytes = total, "File fully read");
        Ok(())
    }
}
