use snafu::Snafu;
use tokio::task::JoinError;

use crate::types::{StreamDescriptor, StreamKey};

/// Error type returned by collaborators plugged into the consumer:
/// flushers, validators and lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Ingest buffer error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    /// Lifecycle misuse by the caller.
    ///
    /// Accepting before start, starting twice, closing before start or closing twice.
    #[snafu(display("precondition failed: {message}"))]
    Precondition { message: &'static str },
    /// A record belongs to a stream that is not part of the configured catalog.
    #[snafu(display("record from stream {stream} is not part of the configured catalog"))]
    UnrecognizedStream { stream: StreamDescriptor },
    /// The record validator itself failed.
    ///
    /// A record that is merely invalid does not produce this error.
    #[snafu(display("failed to validate record from stream {stream}"))]
    Validation {
        stream: StreamDescriptor,
        source: BoxError,
    },
    /// The flusher failed to persist a batch. Fatal to the worker pool.
    #[snafu(display("failed to flush {records} buffered message(s) for stream {stream}"))]
    Flush {
        stream: StreamKey,
        records: usize,
        source: BoxError,
    },
    /// The stream buffer was closed because the worker pool aborted.
    #[snafu(display("buffer for stream {stream} is closed"))]
    BufferClosed { stream: StreamKey },
    /// A lifecycle hook failed.
    #[snafu(display("{hook} hook failed"))]
    Hook {
        hook: &'static str,
        source: BoxError,
    },
    /// A flush worker task panicked or was aborted.
    #[snafu(display("flush worker for stream {stream} terminated abnormally"))]
    WorkerPanic { stream: StreamKey, source: JoinError },
    /// The task supervising the flush workers panicked.
    #[snafu(display("flush worker pool terminated abnormally"))]
    PoolPanic { source: JoinError },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

impl IngestError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, IngestError::Precondition { .. })
    }

    pub fn is_unrecognized_stream(&self) -> bool {
        matches!(self, IngestError::UnrecognizedStream { .. })
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, IngestError::Flush { .. })
    }
}
