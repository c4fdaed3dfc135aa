//! The consumer accepting messages from the upstream source.
//!
//! A consumer goes through three states: not started, started and closed.
//! Messages are only accepted while started. Closing flushes every buffered
//! message before returning.
//!
//! A record from a stream outside the catalog fails the consumer: every later
//! `accept` is rejected, but `close` still flushes what was buffered.
use std::{
    collections::HashSet,
    fmt::{self, Display},
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;
use snafu::{ResultExt, ensure};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    buffer::BufferManager,
    error::{
        BoxError, HookSnafu, PreconditionSnafu, Result, UnrecognizedStreamSnafu, ValidationSnafu,
    },
    estimator::{RecordSizeEstimator, SampledJsonSizeEstimator},
    flush::{FlushWorkerPool, RunningFlushWorkerPool, StreamFlusher},
    ignored::{IgnoredRecordsReport, IgnoredRecordsTracker},
    metrics::IngestMetrics,
    options::ConsumerOptions,
    types::{Message, StreamDescriptor, StreamKey},
};

/// Decides whether a record payload is valid for its destination.
///
/// Invalid records are still flushed, they are only tracked and reported.
pub trait RecordValidator: Send + Sync + 'static {
    /// Returns `Ok(false)` for an invalid record. An error aborts the `accept` call.
    fn is_valid(&self, data: &Value) -> Result<bool, BoxError>;
}

/// Validator that accepts every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllRecords;

/// Async callback run when the consumer starts or closes.
#[async_trait]
pub trait LifecycleHook: Send + Sync + 'static {
    async fn call(&self) -> Result<(), BoxError>;
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

/// The lifecycle state of a [`StreamConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    NotStarted,
    Started,
    Closed,
}

enum Lifecycle {
    NotStarted { pool: FlushWorkerPool },
    Started { pool: RunningFlushWorkerPool },
    Closed,
}

/// Buffers messages per stream and flushes them in the background.
///
/// All methods take `&self`, share the consumer with an `Arc` to accept
/// messages from multiple tasks.
pub struct StreamConsumer {
    catalog: HashSet<StreamDescriptor>,
    buffers: BufferManager,
    validator: Arc<dyn RecordValidator>,
    on_start: Arc<dyn LifecycleHook>,
    on_close: Arc<dyn LifecycleHook>,
    tracker: IgnoredRecordsTracker,
    lifecycle: RwLock<Lifecycle>,
    state: Mutex<ConsumerState>,
    unrecognized_stream: OnceLock<StreamDescriptor>,
}

/// Configures a [`StreamConsumer`].
pub struct StreamConsumerBuilder {
    catalog: HashSet<StreamDescriptor>,
    flusher: Arc<dyn StreamFlusher>,
    validator: Arc<dyn RecordValidator>,
    on_start: Arc<dyn LifecycleHook>,
    on_close: Arc<dyn LifecycleHook>,
    size_estimator: Arc<dyn RecordSizeEstimator>,
    options: ConsumerOptions,
    metrics: Arc<IngestMetrics>,
}

impl StreamConsumer {
    /// Starts configuring a consumer for the given catalog and flusher.
    pub fn builder(
        catalog: impl IntoIterator<Item = StreamDescriptor>,
        flusher: Arc<dyn StreamFlusher>,
    ) -> StreamConsumerBuilder {
        StreamConsumerBuilder {
            catalog: catalog.into_iter().collect(),
            flusher,
            validator: Arc::new(AcceptAllRecords),
            on_start: Arc::new(NoopHook),
            on_close: Arc::new(NoopHook),
            size_estimator: Arc::new(SampledJsonSizeEstimator::default()),
            options: ConsumerOptions::default(),
            metrics: Default::default(),
        }
    }

    /// Starts the flush workers, then runs the start hook.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;

        let pool = match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::NotStarted { pool } => pool,
            previous => {
                *lifecycle = previous;
                return PreconditionSnafu {
                    message: "consumer can only be started once",
                }
                .fail();
            }
        };

        *lifecycle = Lifecycle::Started { pool: pool.start() };
        self.set_state(ConsumerState::Started);

        info!(streams = self.catalog.len(), "Stream consumer started");

        self.on_start.call().await.context(HookSnafu { hook: "start" })
    }

    /// Accepts a message from the source.
    ///
    /// Records and checkpoints are buffered. Waits while the stream buffer is full.
    ///
    /// After a record from an unknown stream was rejected, every call fails
    /// with the same `UnrecognizedStream` error.
    pub async fn accept(&self, message: Message) -> Result<()> {
        // Closing waits for in-flight calls to finish.
        let lifecycle = self.lifecycle.read().await;
        ensure!(
            matches!(*lifecycle, Lifecycle::Started { .. }),
            PreconditionSnafu {
                message: "messages can only be accepted by a started consumer",
            }
        );

        if let Some(stream) = self.unrecognized_stream.get() {
            return UnrecognizedStreamSnafu {
                stream: stream.clone(),
            }
            .fail();
        }

        match message {
            Message::Record(record) => {
                if !self.catalog.contains(&record.stream) {
                    let stream = self.unrecognized_stream.get_or_init(|| {
                        warn!(
                            stream = %record.stream,
                            "Record from a stream outside the catalog, rejecting further messages"
                        );
                        record.stream.clone()
                    });

                    return UnrecognizedStreamSnafu {
                        stream: stream.clone(),
                    }
                    .fail();
                }

                let valid = self
                    .validator
                    .is_valid(&record.data)
                    .context(ValidationSnafu {
                        stream: record.stream.clone(),
                    })?;

                // Only records that made it into a buffer are reported.
                let invalid = (!valid).then(|| record.clone());

                let key = StreamKey::from(record.stream.clone());
                self.buffers
                    .enqueue()
                    .add_message(key, Message::Record(record))
                    .await?;

                if let Some(record) = invalid {
                    trace!(stream = %record.stream, "Record failed validation");
                    self.tracker.add_record(&record.stream, &record);
                }

                Ok(())
            }
            Message::Checkpoint(checkpoint) => {
                let key = checkpoint.scope.clone();
                self.buffers
                    .enqueue()
                    .add_message(key, Message::Checkpoint(checkpoint))
                    .await
            }
            Message::Other(other) => {
                debug!(kind = %other.kind, "Ignoring message");
                Ok(())
            }
        }
    }

    /// Runs the close hook, flushes all buffered messages and reports the
    /// records that failed validation.
    ///
    /// The buffers are flushed even if the close hook fails. In that case the
    /// hook error is returned, otherwise the flush error if there is one.
    pub async fn close(&self) -> Result<IgnoredRecordsReport> {
        let mut lifecycle = self.lifecycle.write().await;

        let pool = match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Started { pool } => pool,
            previous @ Lifecycle::NotStarted { .. } => {
                *lifecycle = previous;
                return PreconditionSnafu {
                    message: "consumer must be started before closing",
                }
                .fail();
            }
            Lifecycle::Closed => {
                return PreconditionSnafu {
                    message: "consumer is already closed",
                }
                .fail();
            }
        };

        self.set_state(ConsumerState::Closed);
        info!(
            buffered_bytes = self.total_usage_bytes(),
            "Closing stream consumer"
        );

        let hook_result = self.on_close.call().await.context(HookSnafu { hook: "close" });
        if let Err(error) = &hook_result {
            warn!(%error, "Close hook failed, flushing buffered messages anyway");
        }

        let flush_result = pool.close().await;
        let report = self.tracker.report();

        hook_result?;
        flush_result?;

        info!("Stream consumer closed");

        Ok(report)
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The estimated size of all buffered messages.
    pub fn total_usage_bytes(&self) -> u64 {
        self.buffers.dequeue().total_usage_bytes()
    }

    /// The estimated size of the messages buffered for a stream, if it has a buffer.
    pub fn usage_bytes(&self, key: &StreamKey) -> Option<u64> {
        self.buffers.dequeue().usage_bytes(key)
    }

    /// The last time a message was buffered for a stream.
    pub fn time_of_last_insert(&self, key: &StreamKey) -> Option<Instant> {
        self.buffers.dequeue().time_of_last_insert(key)
    }

    /// The number of records of the stream that failed validation so far.
    pub fn ignored_records(&self, stream: &StreamDescriptor) -> u64 {
        self.tracker.count(stream)
    }

    pub fn catalog(&self) -> &HashSet<StreamDescriptor> {
        &self.catalog
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl StreamConsumerBuilder {
    /// Change the record validator.
    pub fn with_validator(mut self, validator: impl RecordValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Change the hook run after the consumer started.
    pub fn with_on_start(mut self, hook: impl LifecycleHook) -> Self {
        self.on_start = Arc::new(hook);
        self
    }

    /// Change the hook run before the buffers are flushed on close.
    pub fn with_on_close(mut self, hook: impl LifecycleHook) -> Self {
        self.on_close = Arc::new(hook);
        self
    }

    /// Change how the size of buffered records is estimated.
    pub fn with_size_estimator(mut self, size_estimator: Arc<dyn RecordSizeEstimator>) -> Self {
        self.size_estimator = size_estimator;
        self
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> StreamConsumer {
        let buffers = BufferManager::new(
            self.options.buffer,
            self.size_estimator,
            self.metrics.clone(),
        );

        let pool = FlushWorkerPool::new(
            buffers.dequeue().clone(),
            self.flusher,
            self.options.flush,
            self.metrics.clone(),
        );

        let tracker = IgnoredRecordsTracker::new(self.options.max_ignored_samples, self.metrics);

        StreamConsumer {
            catalog: self.catalog,
            buffers,
            validator: self.validator,
            on_start: self.on_start,
            on_close: self.on_close,
            tracker,
            lifecycle: RwLock::new(Lifecycle::NotStarted { pool }),
            state: Mutex::new(ConsumerState::NotStarted),
            unrecognized_stream: OnceLock::new(),
        }
    }
}

impl RecordValidator for AcceptAllRecords {
    fn is_valid(&self, _data: &Value) -> Result<bool, BoxError> {
        Ok(true)
    }
}

impl<F> RecordValidator for F
where
    F: Fn(&Value) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    fn is_valid(&self, data: &Value) -> Result<bool, BoxError> {
        self(data)
    }
}

#[async_trait]
impl LifecycleHook for NoopHook {
    async fn call(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
impl<F, Fut> LifecycleHook for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn call(&self) -> Result<(), BoxError> {
        self().await
    }
}

impl Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::NotStarted => write!(f, "not started"),
            ConsumerState::Started => write!(f, "started"),
            ConsumerState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct NullFlusher;

    #[async_trait]
    impl StreamFlusher for NullFlusher {
        async fn flush(&self, _stream: &StreamKey, _batch: Vec<Message>) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn users() -> StreamDescriptor {
        StreamDescriptor::unscoped("users")
    }

    fn consumer() -> StreamConsumerBuilder {
        StreamConsumer::builder([users()], Arc::new(NullFlusher))
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let consumer = consumer().build();
        assert_eq!(consumer.state(), ConsumerState::NotStarted);

        let err = consumer.close().await.unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(consumer.state(), ConsumerState::NotStarted);

        consumer.start().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Started);
        assert!(consumer.start().await.unwrap_err().is_precondition());

        consumer.close().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert!(consumer.close().await.unwrap_err().is_precondition());
        assert!(consumer.start().await.unwrap_err().is_precondition());
    }

    #[tokio::test]
    async fn test_accept_requires_started_consumer() {
        let consumer = consumer().build();
        let message = Message::record(users(), json!({"id": 1}));

        let err = consumer.accept(message.clone()).await.unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(consumer.total_usage_bytes(), 0);

        consumer.start().await.unwrap();
        consumer.accept(message.clone()).await.unwrap();
        consumer.close().await.unwrap();

        let err = consumer.accept(message).await.unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_hooks_run_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let on_start = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            }
        };

        let on_close = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(10, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            }
        };

        let consumer = consumer()
            .with_on_start(on_start)
            .with_on_close(on_close)
            .build();

        consumer.start().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        consumer.close().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_other_messages_are_not_buffered() {
        let consumer = consumer().build();
        consumer.start().await.unwrap();

        consumer
            .accept(Message::Other(crate::types::OtherMessage {
                kind: "LOG".to_string(),
                data: json!({"message": "hello"}),
            }))
            .await
            .unwrap();

        assert_eq!(consumer.total_usage_bytes(), 0);
        assert_eq!(consumer.usage_bytes(&users().into()), None);

        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_stream_fails_consumer() {
        let consumer = consumer().build();
        consumer.start().await.unwrap();

        let orders = StreamDescriptor::unscoped("orders");
        assert!(!consumer.catalog().contains(&orders));

        consumer
            .accept(Message::record(users(), json!({"id": 1})))
            .await
            .unwrap();

        let err = consumer
            .accept(Message::record(orders.clone(), json!({"id": 2})))
            .await
            .unwrap_err();
        assert!(err.is_unrecognized_stream());

        // Known streams and checkpoints are rejected too, naming the first unknown stream.
        for message in [
            Message::record(users(), json!({"id": 3})),
            Message::global_checkpoint(json!({"cursor": 3})),
        ] {
            let err = consumer.accept(message).await.unwrap_err();
            let crate::IngestError::UnrecognizedStream { stream } = err else {
                panic!("expected unrecognized stream error, got {err:?}");
            };
            assert_eq!(stream, orders);
        }

        assert_eq!(consumer.state(), ConsumerState::Started);
        consumer.close().await.unwrap();
        assert_eq!(consumer.total_usage_bytes(), 0);
    }

    #[tokio::test]
    async fn test_validator_error_is_fatal_to_accept() {
        let consumer = consumer()
            .with_validator(|_data: &Value| -> Result<bool, BoxError> {
                Err("schema unavailable".into())
            })
            .build();
        consumer.start().await.unwrap();

        let err = consumer
            .accept(Message::record(users(), json!({"id": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::IngestError::Validation { .. }));
        assert_eq!(consumer.total_usage_bytes(), 0);

        consumer.close().await.unwrap();
    }
}
