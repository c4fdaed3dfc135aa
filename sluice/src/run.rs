use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytesize::ByteSize;
use clap::Args;
use serde_json::Value;
use sluice_ingest_core::{
    BoxError, BufferOptions, ConsumerOptions, FlushOptions, IgnoredRecordsReport, StreamConsumer,
    StreamDescriptor,
};
use sluice_observability::MetricsExporter;
use snafu::ResultExt;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{
        IngestSnafu, InvalidArgumentSnafu, InvalidCatalogSnafu, InvalidMessageSnafu,
        ObservabilitySnafu, ReadFileSnafu, ReadInputSnafu, Result, WriteAcksSnafu, WriteFileSnafu,
    },
    flusher::JsonLinesFlusher,
    wire::parse_message,
};

/// Buffer JSON-lines messages and flush them to one file per stream
#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON file with the accepted streams, as an array of `{"namespace", "name"}` objects.
    #[arg(long)]
    catalog: PathBuf,
    /// Directory the stream files are written to.
    #[arg(long)]
    output_dir: PathBuf,
    /// Read messages from this file instead of stdin.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Maximum memory buffered per stream, in MiB.
    #[arg(long, default_value_t = 50)]
    stream_capacity: u64,
    /// Maximum number of messages per flushed batch.
    #[arg(long, default_value_t = 10_000)]
    max_batch_records: usize,
    /// Maximum size of a flushed batch, in MiB.
    #[arg(long, default_value_t = 8)]
    max_batch_size: u64,
    /// Flush a stream after it received no message for this long.
    #[arg(long, default_value_t = 1_000)]
    idle_timeout_ms: u64,
    /// Report records with null or empty data as invalid.
    #[arg(long)]
    reject_empty: bool,
}

impl RunArgs {
    pub async fn run(self, ct: CancellationToken, metrics: MetricsExporter) -> Result<()> {
        let report = self.execute(ct, tokio::io::stdout()).await?;

        let totals = metrics.counter_totals().context(ObservabilitySnafu {})?;
        for (name, value) in totals.iter() {
            info!(metric = %name, value, "Ingest metric");
        }

        if !report.is_empty() {
            let invalid_records = report.streams.values().map(|s| s.count).sum::<u64>();
            warn!(invalid_records, "Some records failed validation");
        }

        Ok(())
    }

    /// Consumes all input messages, acknowledging checkpoints on `acks`.
    ///
    /// Global checkpoints are acknowledged only after the consumer closed
    /// without error.
    pub async fn execute(
        self,
        ct: CancellationToken,
        acks: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<IgnoredRecordsReport> {
        let catalog = read_catalog(&self.catalog).await?;
        let options = self.consumer_options()?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .context(WriteFileSnafu {
                path: self.output_dir.clone(),
            })?;

        let flusher = Arc::new(JsonLinesFlusher::new(self.output_dir.clone(), acks));
        let mut builder = StreamConsumer::builder(catalog, flusher.clone()).with_options(options);
        if self.reject_empty {
            builder = builder.with_validator(reject_empty);
        }
        let consumer = builder.build();

        let report = match &self.input {
            Some(path) => {
                let input = File::open(path).await.context(ReadFileSnafu { path })?;
                ingest(&consumer, input, &ct).await?
            }
            None => ingest(&consumer, tokio::io::stdin(), &ct).await?,
        };

        let global_acks = flusher
            .release_global_acks()
            .await
            .context(WriteAcksSnafu {})?;
        debug!(global_acks, "Acknowledged global checkpoints");

        Ok(report)
    }

    fn consumer_options(&self) -> Result<ConsumerOptions> {
        if self.max_batch_records == 0 {
            return InvalidArgumentSnafu {
                name: "max-batch-records",
                message: "must be at least 1",
            }
            .fail();
        }

        if self.stream_capacity == 0 {
            return InvalidArgumentSnafu {
                name: "stream-capacity",
                message: "must be at least 1 MiB",
            }
            .fail();
        }

        let buffer =
            BufferOptions::default().with_stream_capacity(ByteSize::mib(self.stream_capacity));
        let flush = FlushOptions::default()
            .with_max_batch_records(self.max_batch_records)
            .with_max_batch_size(ByteSize::mib(self.max_batch_size))
            .with_idle_timeout(Duration::from_millis(self.idle_timeout_ms));

        Ok(ConsumerOptions::new(buffer, flush))
    }
}

/// Starts the consumer, feeds it every input line and closes it.
///
/// The consumer is closed also when reading fails or `ct` is cancelled, so
/// every accepted message is flushed.
async fn ingest(
    consumer: &StreamConsumer,
    input: impl AsyncRead + Unpin,
    ct: &CancellationToken,
) -> Result<IgnoredRecordsReport> {
    consumer.start().await.context(IngestSnafu {})?;

    let read_result = read_messages(consumer, input, ct).await;
    if let Err(error) = &read_result {
        warn!(%error, "Stopped reading messages");
    }

    let close_result = consumer.close().await.context(IngestSnafu {});

    let accepted = read_result?;
    let report = close_result?;

    info!(accepted, "All messages flushed");

    Ok(report)
}

async fn read_messages(
    consumer: &StreamConsumer,
    input: impl AsyncRead + Unpin,
    ct: &CancellationToken,
) -> Result<usize> {
    let mut lines = BufReader::new(input).lines();
    let mut line_number: usize = 0;
    let mut accepted = 0;

    loop {
        let line = tokio::select! {
            biased;

            _ = ct.cancelled() => {
                info!(accepted, "Interrupted, closing consumer");
                break;
            }
            line = lines.next_line() => line.context(ReadInputSnafu {})?,
        };

        let Some(line) = line else {
            break;
        };

        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let message = parse_message(&line).context(InvalidMessageSnafu { line: line_number })?;
        consumer.accept(message).await.context(IngestSnafu {})?;
        accepted += 1;
    }

    Ok(accepted)
}

async fn read_catalog(path: &Path) -> Result<Vec<StreamDescriptor>> {
    let content = tokio::fs::read(path)
        .await
        .context(ReadFileSnafu { path })?;

    serde_json::from_slice(&content).context(InvalidCatalogSnafu { path })
}

fn reject_empty(data: &Value) -> Result<bool, BoxError> {
    let empty = match data {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    };

    Ok(!empty)
}
