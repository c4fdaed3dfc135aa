//! Per-stream buffers shared between producers and flush workers.
//!
//! The [`BufferManager`] owns one [`StreamBuffer`] per stream key. Producers
//! go through the [`BufferEnqueue`] facet, flush workers and monitoring through
//! the [`BufferDequeue`] facet. Both facets share the same map of buffers.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use sluice_observability::KeyValue;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info};

use crate::{
    error::{BufferClosedSnafu, Result},
    estimator::RecordSizeEstimator,
    metrics::IngestMetrics,
    options::BufferOptions,
    types::{Message, StreamKey},
};

pub use self::queue::{MemoryBoundedQueue, SizedItem};

mod queue;

/// The buffer holding the messages of a single stream.
pub type StreamBuffer = MemoryBoundedQueue<Message>;

/// State shared by the enqueue and dequeue facets.
#[derive(Default)]
struct SharedBuffers {
    buffers: DashMap<StreamKey, Arc<StreamBuffer>>,
    streams_added: Notify,
    closed: AtomicBool,
}

/// Owns the stream buffers.
pub struct BufferManager {
    enqueue: BufferEnqueue,
    dequeue: BufferDequeue,
}

/// Producer facet of the buffer manager.
#[derive(Clone)]
pub struct BufferEnqueue {
    shared: Arc<SharedBuffers>,
    options: BufferOptions,
    size_estimator: Arc<dyn RecordSizeEstimator>,
    metrics: Arc<IngestMetrics>,
}

/// Worker and monitoring facet of the buffer manager.
#[derive(Clone)]
pub struct BufferDequeue {
    shared: Arc<SharedBuffers>,
}

impl BufferManager {
    pub fn new(
        options: BufferOptions,
        size_estimator: Arc<dyn RecordSizeEstimator>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        info!(
            stream_capacity = %options.stream_capacity,
            checkpoint_size = %options.checkpoint_size,
            "Buffering with a fixed capacity per stream"
        );

        let shared = Arc::new(SharedBuffers::default());

        let enqueue = BufferEnqueue {
            shared: shared.clone(),
            options,
            size_estimator,
            metrics,
        };

        let dequeue = BufferDequeue { shared };

        Self { enqueue, dequeue }
    }

    pub fn enqueue(&self) -> &BufferEnqueue {
        &self.enqueue
    }

    pub fn dequeue(&self) -> &BufferDequeue {
        &self.dequeue
    }
}

impl BufferEnqueue {
    /// Adds a message to the buffer of the given stream, creating the buffer if needed.
    ///
    /// Waits while the stream buffer is full.
    pub async fn add_message(&self, key: StreamKey, message: Message) -> Result<()> {
        let size_bytes = self.estimate_size(&message);
        let buffer = self.get_or_create_buffer(&key);

        if buffer.insert(message, size_bytes).await.is_err() {
            return BufferClosedSnafu { stream: key }.fail();
        }

        let attributes = [KeyValue::new("stream", key.to_string())];
        self.metrics.enqueued_records.add(1, &attributes);
        self.metrics.enqueued_bytes.add(size_bytes, &attributes);

        Ok(())
    }

    /// The size accounted for a message in the stream buffer.
    pub fn estimate_size(&self, message: &Message) -> u64 {
        match message {
            Message::Record(record) => self.size_estimator.estimate(record),
            Message::Checkpoint(_) | Message::Other(_) => self.options.checkpoint_size.as_u64(),
        }
    }

    fn get_or_create_buffer(&self, key: &StreamKey) -> Arc<StreamBuffer> {
        if let Some(buffer) = self.shared.buffers.get(key) {
            return buffer.clone();
        }

        let (buffer, created) = match self.shared.buffers.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let buffer = Arc::new(StreamBuffer::new(self.options.stream_capacity.as_u64()));
                entry.insert(buffer.clone());
                (buffer, true)
            }
        };

        if created {
            debug!(stream = %key, capacity = %self.options.stream_capacity, "Created stream buffer");

            // Buffers created after the pool aborted are never drained.
            if self.shared.closed.load(Ordering::SeqCst) {
                buffer.close();
            }

            self.shared.streams_added.notify_one();
        }

        buffer
    }
}

impl BufferDequeue {
    /// Returns a copy of the stream to buffer mapping.
    pub fn snapshot(&self) -> HashMap<StreamKey, Arc<StreamBuffer>> {
        self.shared
            .buffers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn buffer(&self, key: &StreamKey) -> Option<Arc<StreamBuffer>> {
        self.shared.buffers.get(key).map(|buffer| buffer.clone())
    }

    /// Returns the keys of all streams that have a buffer.
    pub fn streams(&self) -> Vec<StreamKey> {
        self.shared.buffers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The estimated size of all buffered messages, across streams.
    pub fn total_usage_bytes(&self) -> u64 {
        self.shared
            .buffers
            .iter()
            .map(|entry| entry.value().usage_bytes())
            .sum()
    }

    /// The estimated size of the messages buffered for a stream.
    pub fn usage_bytes(&self, key: &StreamKey) -> Option<u64> {
        self.shared.buffers.get(key).map(|buffer| buffer.usage_bytes())
    }

    /// The last time a message was added to the stream buffer.
    pub fn time_of_last_insert(&self, key: &StreamKey) -> Option<Instant> {
        self.shared
            .buffers
            .get(key)
            .and_then(|buffer| buffer.time_of_last_insert())
    }

    /// Waits until a new stream buffer is created.
    pub(crate) async fn wait_for_new_streams(&self) {
        self.shared.streams_added.notified().await
    }

    /// Empties every buffer. Only called once all flush workers have exited.
    pub(crate) fn clear_all(&self) -> usize {
        self.shared
            .buffers
            .iter()
            .map(|entry| entry.value().clear())
            .sum()
    }

    /// Closes every buffer, failing producers waiting for space.
    pub(crate) fn close_all(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        for entry in self.shared.buffers.iter() {
            entry.value().close();
        }
    }
}
