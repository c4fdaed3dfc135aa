use std::time::Duration;

use bytesize::ByteSize;

/// Options for the per-stream buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOptions {
    /// Maximum number of bytes buffered for a single stream.
    ///
    /// Producers inserting into a full stream buffer wait until its worker drains it.
    pub(crate) stream_capacity: ByteSize,
    /// The size accounted for each checkpoint message.
    pub(crate) checkpoint_size: ByteSize,
}

/// Options for the flush workers.
///
/// Built from `Default` and the `with_*` methods, which keep every batch at
/// least one message long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOptions {
    /// Maximum number of messages in a flushed batch.
    pub(crate) max_batch_records: usize,
    /// Maximum size of a flushed batch, unless the flusher specifies its own.
    pub(crate) max_batch_size: ByteSize,
    /// Flush a partial batch once a stream received no message for this long.
    pub(crate) idle_timeout: Duration,
    /// Flush a partial batch at least this often, even when messages keep arriving.
    pub(crate) max_flush_interval: Duration,
}

/// Options for the stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub buffer: BufferOptions,
    pub flush: FlushOptions,
    /// Number of invalid payloads kept per stream for the final report.
    pub max_ignored_samples: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            stream_capacity: ByteSize::mib(50),
            checkpoint_size: ByteSize::kib(1),
        }
    }
}

impl BufferOptions {
    pub fn stream_capacity(&self) -> ByteSize {
        self.stream_capacity
    }

    pub fn checkpoint_size(&self) -> ByteSize {
        self.checkpoint_size
    }

    /// Change the per-stream capacity.
    pub fn with_stream_capacity(mut self, stream_capacity: ByteSize) -> Self {
        self.stream_capacity = stream_capacity;
        self
    }

    /// Change the size accounted for checkpoint messages.
    pub fn with_checkpoint_size(mut self, checkpoint_size: ByteSize) -> Self {
        self.checkpoint_size = checkpoint_size;
        self
    }
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            max_batch_records: 10_000,
            max_batch_size: ByteSize::mib(8),
            idle_timeout: Duration::from_secs(1),
            max_flush_interval: Duration::from_secs(30),
        }
    }
}

impl FlushOptions {
    pub fn max_batch_records(&self) -> usize {
        self.max_batch_records
    }

    pub fn max_batch_size(&self) -> ByteSize {
        self.max_batch_size
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_flush_interval(&self) -> Duration {
        self.max_flush_interval
    }

    /// Change the maximum number of messages per batch. Zero is raised to one.
    pub fn with_max_batch_records(mut self, max_batch_records: usize) -> Self {
        self.max_batch_records = max_batch_records.max(1);
        self
    }

    /// Change the maximum batch size.
    pub fn with_max_batch_size(mut self, max_batch_size: ByteSize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Change the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Change the maximum interval between flushes.
    pub fn with_max_flush_interval(mut self, max_flush_interval: Duration) -> Self {
        self.max_flush_interval = max_flush_interval;
        self
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::new(BufferOptions::default(), FlushOptions::default())
    }
}

impl ConsumerOptions {
    pub fn new(buffer: BufferOptions, flush: FlushOptions) -> Self {
        Self {
            buffer,
            flush,
            max_ignored_samples: DEFAULT_MAX_IGNORED_SAMPLES,
        }
    }

    /// Change the number of invalid payloads kept per stream.
    pub fn with_max_ignored_samples(mut self, max_ignored_samples: usize) -> Self {
        self.max_ignored_samples = max_ignored_samples;
        self
    }
}

const DEFAULT_MAX_IGNORED_SAMPLES: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_records_is_at_least_one() {
        let options = FlushOptions::default().with_max_batch_records(0);
        assert_eq!(options.max_batch_records(), 1);

        let options = options.with_max_batch_records(5);
        assert_eq!(options.max_batch_records(), 5);
    }
}
