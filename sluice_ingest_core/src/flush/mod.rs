//! Flush workers, one per stream buffer.
//!
//! The pool runs in two phases. While running, each worker flushes its stream
//! whenever a batch is ready or the stream goes idle. Closing the pool makes
//! every worker flush all remaining messages; only after all workers exited are
//! the buffers cleared.
use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use bytesize::ByteSize;
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use snafu::ResultExt;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffer::BufferDequeue,
    error::{BoxError, IngestError, PoolPanicSnafu, Result, WorkerPanicSnafu},
    metrics::IngestMetrics,
    options::FlushOptions,
    types::{Message, StreamKey},
};

use self::worker::StreamWorker;

mod worker;

/// Persists batches of buffered messages to the destination.
///
/// Batches of different streams are flushed concurrently.
#[async_trait]
pub trait StreamFlusher: Send + Sync + 'static {
    /// Flushes a batch of messages from the given stream, in the order they were accepted.
    async fn flush(&self, stream: &StreamKey, batch: Vec<Message>) -> Result<(), BoxError>;

    /// The preferred batch size for this destination, if it has one.
    fn optimal_batch_size(&self) -> Option<ByteSize> {
        None
    }
}

/// A flush worker pool that was not started yet.
pub struct FlushWorkerPool {
    dequeue: BufferDequeue,
    flusher: Arc<dyn StreamFlusher>,
    options: FlushOptions,
    metrics: Arc<IngestMetrics>,
}

/// A running flush worker pool.
///
/// The pool must be closed to flush the buffered messages.
pub struct RunningFlushWorkerPool {
    drain: CancellationToken,
    supervisor: JoinHandle<Result<()>>,
}

type WorkerFuture = BoxFuture<'static, (StreamKey, Result<Result<()>, JoinError>)>;

impl FlushWorkerPool {
    pub fn new(
        dequeue: BufferDequeue,
        flusher: Arc<dyn StreamFlusher>,
        options: FlushOptions,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            dequeue,
            flusher,
            options,
            metrics,
        }
    }

    /// Starts the pool. Workers are spawned as stream buffers are created.
    pub fn start(self) -> RunningFlushWorkerPool {
        let drain = CancellationToken::new();
        let supervisor = tokio::spawn(self.supervise(drain.clone()));

        info!("Flush worker pool started");

        RunningFlushWorkerPool { drain, supervisor }
    }

    async fn supervise(self, drain: CancellationToken) -> Result<()> {
        let abort = CancellationToken::new();
        let mut served = HashSet::new();
        let mut workers = FuturesUnordered::new();
        let mut failure = None;

        self.spawn_new_workers(&mut served, &mut workers, &drain, &abort);

        loop {
            tokio::select! {
                _ = drain.cancelled() => {
                    break;
                }
                _ = self.dequeue.wait_for_new_streams() => {
                    self.spawn_new_workers(&mut served, &mut workers, &drain, &abort);
                }
                Some((key, result)) = workers.next(), if !workers.is_empty() => {
                    if let Err(error) = worker_result(key, result) {
                        failure = Some(error);
                        break;
                    }
                }
            }
        }

        match failure {
            // Streams created right before closing still need a worker to drain them.
            None => self.spawn_new_workers(&mut served, &mut workers, &drain, &abort),
            Some(ref error) => self.abort(error, &abort),
        }

        while let Some((key, result)) = workers.next().await {
            let Err(error) = worker_result(key, result) else {
                continue;
            };

            if failure.is_none() {
                self.abort(&error, &abort);
                failure = Some(error);
            } else {
                warn!(%error, "Flush worker failed after the pool aborted");
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        let cleared = self.dequeue.clear_all();
        if cleared > 0 {
            warn!(cleared, "Stream buffers were not empty after all workers exited");
        }

        info!(
            streams = served.len(),
            "Flush worker pool drained all stream buffers"
        );

        Ok(())
    }

    fn spawn_new_workers(
        &self,
        served: &mut HashSet<StreamKey>,
        workers: &mut FuturesUnordered<WorkerFuture>,
        drain: &CancellationToken,
        abort: &CancellationToken,
    ) {
        let batch_size_bytes = self
            .flusher
            .optimal_batch_size()
            .unwrap_or(self.options.max_batch_size)
            .as_u64();

        for (key, buffer) in self.dequeue.snapshot() {
            if !served.insert(key.clone()) {
                continue;
            }

            debug!(stream = %key, "Spawning flush worker");

            let worker = StreamWorker {
                key: key.clone(),
                buffer,
                flusher: self.flusher.clone(),
                options: self.options.clone(),
                batch_size_bytes,
                metrics: self.metrics.clone(),
            };

            let handle = tokio::spawn(worker.run(drain.clone(), abort.clone()));
            workers.push(handle.map(move |result| (key, result)).boxed());
        }
    }

    fn abort(&self, error: &IngestError, abort: &CancellationToken) {
        warn!(%error, "Flush failed, aborting all flush workers");
        abort.cancel();
        self.dequeue.close_all();
    }
}

impl RunningFlushWorkerPool {
    /// Flushes all buffered messages and stops the workers.
    ///
    /// Returns the first flush error if any worker failed, in which case
    /// buffered messages may not have been flushed.
    pub async fn close(self) -> Result<()> {
        info!("Closing flush worker pool");
        self.drain.cancel();
        self.supervisor.await.context(PoolPanicSnafu {})?
    }
}

fn worker_result(key: StreamKey, result: Result<Result<()>, JoinError>) -> Result<()> {
    result.context(WorkerPanicSnafu { stream: key })?
}
