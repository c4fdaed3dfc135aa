use std::sync::Arc;

use snafu::ResultExt;
use sluice_observability::KeyValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    buffer::StreamBuffer,
    error::{FlushSnafu, Result},
    flush::StreamFlusher,
    metrics::IngestMetrics,
    options::FlushOptions,
    types::StreamKey,
};

/// Drains the buffer of a single stream and hands batches to the flusher.
pub(crate) struct StreamWorker {
    pub key: StreamKey,
    pub buffer: Arc<StreamBuffer>,
    pub flusher: Arc<dyn StreamFlusher>,
    pub options: FlushOptions,
    pub batch_size_bytes: u64,
    pub metrics: Arc<IngestMetrics>,
}

impl StreamWorker {
    /// Flushes batches until `drain` is cancelled, then flushes everything left in the buffer.
    ///
    /// Cancelling `abort` stops the worker without flushing the remaining messages.
    pub async fn run(self, drain: CancellationToken, abort: CancellationToken) -> Result<()> {
        debug!(stream = %self.key, "Flush worker started");

        let mut last_flush = Instant::now();

        while !drain.is_cancelled() {
            if abort.is_cancelled() {
                return Ok(());
            }

            if self.should_flush(Instant::now(), last_flush) {
                self.flush_batch().await?;
                last_flush = Instant::now();
                continue;
            }

            let deadline = self.next_deadline(last_flush);

            tokio::select! {
                _ = drain.cancelled() => {}
                _ = abort.cancelled() => {}
                _ = self.buffer.wait_for_insert(deadline) => {}
            }
        }

        let mut flushed_batches = 0;
        while !self.buffer.is_empty() {
            if abort.is_cancelled() {
                return Ok(());
            }

            if self.flush_batch().await? == 0 {
                break;
            }
            flushed_batches += 1;
        }

        debug!(stream = %self.key, flushed_batches, "Flush worker drained its buffer");

        Ok(())
    }

    /// Returns true if the buffered messages should be flushed now.
    fn should_flush(&self, now: Instant, last_flush: Instant) -> bool {
        let len = self.buffer.len();
        if len == 0 {
            return false;
        }

        if len >= self.options.max_batch_records
            || self.buffer.usage_bytes() >= self.batch_size_bytes
            || self.buffer.has_waiting_producers()
        {
            return true;
        }

        if let Some(last_insert) = self.buffer.time_of_last_insert()
            && now.duration_since(last_insert) >= self.options.idle_timeout
        {
            return true;
        }

        now.duration_since(last_flush) >= self.options.max_flush_interval
    }

    /// The next time the buffer should be checked, if nothing is inserted before then.
    fn next_deadline(&self, last_flush: Instant) -> Instant {
        if self.buffer.is_empty() {
            return Instant::now() + self.options.max_flush_interval;
        }

        let interval_deadline = last_flush + self.options.max_flush_interval;

        match self.buffer.time_of_last_insert() {
            Some(last_insert) => interval_deadline.min(last_insert + self.options.idle_timeout),
            None => interval_deadline,
        }
    }

    /// Flushes the oldest batch and returns the number of messages in it.
    async fn flush_batch(&self) -> Result<usize> {
        let batch = self
            .buffer
            .drain_up_to(self.options.max_batch_records, self.batch_size_bytes);

        if batch.is_empty() {
            return Ok(0);
        }

        let records = batch.len();
        let bytes = batch.iter().map(|entry| entry.size_bytes).sum::<u64>();
        let messages = batch.into_iter().map(|entry| entry.item).collect();

        trace!(stream = %self.key, records, bytes, "Flushing batch");

        self.flusher
            .flush(&self.key, messages)
            .await
            .context(FlushSnafu {
                stream: self.key.clone(),
                records,
            })?;

        let attributes = [KeyValue::new("stream", self.key.to_string())];
        self.metrics
            .flushed_records
            .add(records as u64, &attributes);
        self.metrics.flushed_batches.add(1, &attributes);

        Ok(records)
    }
}
