use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use dashmap::DashMap;
use serde_json::Value;
use sluice_observability::KeyValue;
use tracing::warn;

use crate::{
    metrics::IngestMetrics,
    types::{RecordMessage, StreamDescriptor},
};

/// Keeps track of records that failed validation.
///
/// Tracked records are still buffered and flushed, the tracker only reports them.
pub struct IgnoredRecordsTracker {
    max_samples: usize,
    streams: DashMap<StreamDescriptor, IgnoredRecords>,
    report: OnceLock<IgnoredRecordsReport>,
    metrics: Arc<IngestMetrics>,
}

/// Invalid records seen for a single stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoredRecords {
    /// The number of invalid records.
    pub count: u64,
    /// The payloads of the first invalid records.
    pub samples: Vec<Value>,
}

/// Summary of the invalid records, per stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoredRecordsReport {
    pub streams: BTreeMap<StreamDescriptor, IgnoredRecords>,
}

impl IgnoredRecordsTracker {
    pub fn new(max_samples: usize, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            max_samples,
            streams: DashMap::new(),
            report: OnceLock::new(),
            metrics,
        }
    }

    /// Records that a record of the given stream failed validation.
    pub fn add_record(&self, stream: &StreamDescriptor, record: &RecordMessage) {
        let mut ignored = self.streams.entry(stream.clone()).or_default();
        ignored.count += 1;
        if ignored.samples.len() < self.max_samples {
            ignored.samples.push(record.data.clone());
        }

        self.metrics
            .ignored_records
            .add(1, &[KeyValue::new("stream", stream.to_string())]);
    }

    /// The number of invalid records seen so far for the stream.
    pub fn count(&self, stream: &StreamDescriptor) -> u64 {
        self.streams
            .get(stream)
            .map(|ignored| ignored.count)
            .unwrap_or_default()
    }

    /// Logs a summary of the invalid records for each stream and returns it.
    ///
    /// The summary is logged on the first call only.
    pub fn report(&self) -> IgnoredRecordsReport {
        self.report
            .get_or_init(|| {
                let streams = self
                    .streams
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect::<BTreeMap<_, _>>();

                for (stream, ignored) in streams.iter() {
                    warn!(
                        %stream,
                        count = ignored.count,
                        samples = ignored.samples.len(),
                        "Stream contained records that failed validation"
                    );
                }

                IgnoredRecordsReport { streams }
            })
            .clone()
    }
}

impl IgnoredRecordsReport {
    /// The number of invalid records reported for the stream.
    pub fn count(&self, stream: &StreamDescriptor) -> u64 {
        self.streams
            .get(stream)
            .map(|ignored| ignored.count)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
