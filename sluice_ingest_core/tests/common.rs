#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytesize::ByteSize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use sluice_ingest_core::{
    BoxError, BufferOptions, ConsumerOptions, FlushOptions, Message, RecordMessage,
    RecordSizeEstimator, StreamConsumer, StreamConsumerBuilder, StreamDescriptor, StreamFlusher,
    StreamKey,
};

/// Flusher that keeps every batch in memory.
#[derive(Default)]
pub struct RecordingFlusher {
    batches: Mutex<Vec<(StreamKey, Vec<Message>)>>,
    optimal_batch_size: Option<ByteSize>,
}

impl RecordingFlusher {
    pub fn with_optimal_batch_size(optimal_batch_size: ByteSize) -> Self {
        Self {
            optimal_batch_size: Some(optimal_batch_size),
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<(StreamKey, Vec<Message>)> {
        self.batches.lock().expect("lock").clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().expect("lock").len()
    }

    /// All flushed messages of the stream, in flush order.
    pub fn messages(&self, key: &StreamKey) -> Vec<Message> {
        self.batches()
            .into_iter()
            .filter(|(stream, _)| stream == key)
            .flat_map(|(_, batch)| batch)
            .collect()
    }

    /// The flushed messages of every stream.
    pub fn messages_by_stream(&self) -> HashMap<StreamKey, Vec<Message>> {
        let mut by_stream: HashMap<_, Vec<_>> = HashMap::new();
        for (stream, batch) in self.batches() {
            by_stream.entry(stream).or_default().extend(batch);
        }
        by_stream
    }
}

#[async_trait]
impl StreamFlusher for RecordingFlusher {
    async fn flush(&self, stream: &StreamKey, batch: Vec<Message>) -> Result<(), BoxError> {
        self.batches
            .lock()
            .expect("lock")
            .push((stream.clone(), batch));
        Ok(())
    }

    fn optimal_batch_size(&self) -> Option<ByteSize> {
        self.optimal_batch_size
    }
}

/// Flusher that holds the batches of one stream until the gate is opened.
pub struct GatedFlusher {
    gated: StreamKey,
    gate: Semaphore,
    pub inner: RecordingFlusher,
}

impl GatedFlusher {
    pub fn new(gated: StreamKey) -> Self {
        Self {
            gated,
            gate: Semaphore::new(0),
            inner: RecordingFlusher::default(),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl StreamFlusher for GatedFlusher {
    async fn flush(&self, stream: &StreamKey, batch: Vec<Message>) -> Result<(), BoxError> {
        if *stream == self.gated {
            let _permit = self.gate.acquire().await?;
        }
        self.inner.flush(stream, batch).await
    }
}

/// Flusher that fails every flush.
#[derive(Default)]
pub struct FailingFlusher {
    attempts: AtomicUsize,
}

impl FailingFlusher {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamFlusher for FailingFlusher {
    async fn flush(&self, _stream: &StreamKey, _batch: Vec<Message>) -> Result<(), BoxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err("destination unavailable".into())
    }
}

/// Estimator that gives every record the same size.
pub struct FixedSizeEstimator(pub u64);

impl RecordSizeEstimator for FixedSizeEstimator {
    fn estimate(&self, _record: &RecordMessage) -> u64 {
        self.0
    }
}

/// Estimator reading the size from the `size` field, 10 bytes without one.
pub struct SizeFieldEstimator;

impl RecordSizeEstimator for SizeFieldEstimator {
    fn estimate(&self, record: &RecordMessage) -> u64 {
        record
            .data
            .get("size")
            .and_then(Value::as_u64)
            .unwrap_or(10)
    }
}

pub fn stream_a() -> StreamDescriptor {
    StreamDescriptor::new(Some("public"), "stream_a")
}

pub fn stream_b() -> StreamDescriptor {
    StreamDescriptor::new(Some("public"), "stream_b")
}

pub fn record(stream: &StreamDescriptor, id: u64) -> Message {
    Message::record(stream.clone(), json!({ "id": id }))
}

/// Returns the `id` field of the flushed records, skipping other messages.
pub fn record_ids(messages: &[Message]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(Message::as_record)
        .filter_map(|record| record.data.get("id").and_then(Value::as_u64))
        .collect()
}

/// Options with timers long enough to never fire during a test.
pub fn quiet_options(stream_capacity: u64) -> ConsumerOptions {
    ConsumerOptions::new(
        BufferOptions::default()
            .with_stream_capacity(ByteSize::b(stream_capacity))
            .with_checkpoint_size(ByteSize::b(1)),
        FlushOptions::default()
            .with_idle_timeout(Duration::from_secs(3600))
            .with_max_flush_interval(Duration::from_secs(3600)),
    )
}

/// A consumer for `stream_a` and `stream_b` where every record is 10 bytes.
pub fn create_two_stream_consumer(
    flusher: Arc<dyn StreamFlusher>,
    options: ConsumerOptions,
) -> StreamConsumerBuilder {
    StreamConsumer::builder([stream_a(), stream_b()], flusher)
        .with_size_estimator(Arc::new(FixedSizeEstimator(10)))
        .with_options(options)
}

/// A consumer for `stream_a` where every record is 10 bytes.
pub fn create_consumer(
    flusher: Arc<dyn StreamFlusher>,
    options: ConsumerOptions,
) -> StreamConsumerBuilder {
    StreamConsumer::builder([stream_a()], flusher)
        .with_size_estimator(Arc::new(FixedSizeEstimator(10)))
        .with_options(options)
}
