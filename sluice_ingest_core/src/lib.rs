pub mod buffer;
pub mod consumer;
pub mod error;
pub mod estimator;
pub mod flush;
pub mod ignored;
pub mod metrics;
pub mod options;
pub mod types;

pub use buffer::{BufferDequeue, BufferEnqueue, BufferManager, MemoryBoundedQueue, StreamBuffer};
pub use consumer::{
    AcceptAllRecords, ConsumerState, LifecycleHook, NoopHook, RecordValidator, StreamConsumer,
    StreamConsumerBuilder,
};
pub use error::{BoxError, IngestError, Result};
pub use estimator::{RecordSizeEstimator, SampledJsonSizeEstimator};
pub use flush::{FlushWorkerPool, RunningFlushWorkerPool, StreamFlusher};
pub use ignored::{IgnoredRecords, IgnoredRecordsReport, IgnoredRecordsTracker};
pub use options::{BufferOptions, ConsumerOptions, FlushOptions};
pub use types::{CheckpointMessage, Message, OtherMessage, RecordMessage, StreamDescriptor, StreamKey};
