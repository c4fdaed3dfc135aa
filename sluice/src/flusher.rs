use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sluice_ingest_core::{BoxError, Message, StreamFlusher, StreamKey};
use tokio::{
    fs::OpenOptions,
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

use crate::wire::{encode_checkpoint, encode_record};

/// Appends the records of each stream to `<output-dir>/<stream>.jsonl`.
///
/// Stream checkpoints are acknowledged on the `acks` writer once the records
/// flushed with them are synced to disk. Global checkpoints cover every stream,
/// so they are held back until [`JsonLinesFlusher::release_global_acks`] is
/// called after all streams were flushed.
pub struct JsonLinesFlusher {
    output_dir: PathBuf,
    acks: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    held_global_acks: Mutex<String>,
}

impl JsonLinesFlusher {
    pub fn new(output_dir: PathBuf, acks: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            output_dir,
            acks: Mutex::new(Box::new(acks)),
            held_global_acks: Mutex::new(String::new()),
        }
    }

    /// Writes the held global checkpoint acknowledgements.
    ///
    /// Only call this once the consumer closed without error.
    pub async fn release_global_acks(&self) -> std::io::Result<usize> {
        let held = std::mem::take(&mut *self.held_global_acks.lock().await);
        let count = held.lines().count();
        if count > 0 {
            self.write_acks(&held).await?;
        }
        Ok(count)
    }

    async fn write_acks(&self, acks: &str) -> std::io::Result<()> {
        let mut writer = self.acks.lock().await;
        writer.write_all(acks.as_bytes()).await?;
        writer.flush().await
    }
}

/// The file holding the records of a stream.
pub fn stream_path(output_dir: &Path, stream: &StreamKey) -> PathBuf {
    output_dir.join(format!("{stream}.jsonl"))
}

#[async_trait]
impl StreamFlusher for JsonLinesFlusher {
    async fn flush(&self, stream: &StreamKey, batch: Vec<Message>) -> Result<(), BoxError> {
        let mut records = String::new();
        let mut record_count = 0;
        let mut acks = String::new();

        for message in batch.iter() {
            match message {
                Message::Record(record) => {
                    records.push_str(&encode_record(record)?);
                    records.push('\n');
                    record_count += 1;
                }
                Message::Checkpoint(checkpoint) => {
                    acks.push_str(&encode_checkpoint(checkpoint)?);
                    acks.push('\n');
                }
                Message::Other(_) => {}
            }
        }

        if record_count > 0 {
            let path = stream_path(&self.output_dir, stream);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;

            file.write_all(records.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await?;

            debug!(%stream, records = record_count, path = %path.display(), "Wrote records");
        }

        if acks.is_empty() {
            return Ok(());
        }

        if stream.is_global() {
            debug!(%stream, "Holding global checkpoints until all streams are flushed");
            self.held_global_acks.lock().await.push_str(&acks);
        } else {
            self.write_acks(&acks).await?;
        }

        Ok(())
    }
}
