//! Size estimation for buffered records.
use dashmap::DashMap;

use crate::types::{RecordMessage, StreamDescriptor};

const DEFAULT_SAMPLE_EVERY: usize = 20;

/// Estimates how many bytes a record occupies in the stream buffer.
pub trait RecordSizeEstimator: Send + Sync + 'static {
    fn estimate(&self, record: &RecordMessage) -> u64;
}

/// Estimates record sizes from their serialized JSON payload.
///
/// Serializing every record is expensive, so the size is measured on the first
/// record of each stream and then once every `sample_every` records. Records in
/// between are assumed to have the last measured size.
#[derive(Debug)]
pub struct SampledJsonSizeEstimator {
    sample_every: usize,
    streams: DashMap<StreamDescriptor, SampleState>,
}

#[derive(Debug, Clone, Copy)]
struct SampleState {
    estimate: u64,
    until_next_sample: usize,
}

impl SampledJsonSizeEstimator {
    pub fn new(sample_every: usize) -> Self {
        Self {
            sample_every: sample_every.max(1),
            streams: DashMap::new(),
        }
    }

    /// The serialized size of the record payload.
    pub fn measure(record: &RecordMessage) -> u64 {
        serde_json::to_vec(&record.data)
            .map(|data| data.len() as u64)
            .unwrap_or_default()
    }
}

impl Default for SampledJsonSizeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_EVERY)
    }
}

impl RecordSizeEstimator for SampledJsonSizeEstimator {
    fn estimate(&self, record: &RecordMessage) -> u64 {
        let mut state = self
            .streams
            .entry(record.stream.clone())
            .or_insert(SampleState {
                estimate: 0,
                until_next_sample: 0,
            });

        if state.until_next_sample == 0 {
            state.estimate = Self::measure(record);
            state.until_next_sample = self.sample_every;
        }

        state.until_next_sample -= 1;
        state.estimate
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(stream: &str, data: serde_json::Value) -> RecordMessage {
        RecordMessage {
            stream: StreamDescriptor::unscoped(stream),
            data,
            emitted_at: None,
        }
    }

    #[test]
    fn test_measures_serialized_payload() {
        let record = record("users", json!({"id": 1}));
        assert_eq!(SampledJsonSizeEstimator::measure(&record), 8);
    }

    #[test]
    fn test_resamples_periodically() {
        let estimator = SampledJsonSizeEstimator::new(3);
        let small = record("users", json!("a"));
        let large = record("users", json!("aaaaaaaaaa"));

        // First record is measured, the next two reuse the estimate.
        assert_eq!(estimator.estimate(&small), 3);
        assert_eq!(estimator.estimate(&large), 3);
        assert_eq!(estimator.estimate(&large), 3);
        // Fourth record is measured again.
        assert_eq!(estimator.estimate(&large), 12);
        assert_eq!(estimator.estimate(&small), 12);
    }

    #[test]
    fn test_streams_sampled_independently() {
        let estimator = SampledJsonSizeEstimator::new(10);
        assert_eq!(estimator.estimate(&record("a", json!("x"))), 3);
        assert_eq!(estimator.estimate(&record("b", json!("xxxx"))), 6);
        assert_eq!(estimator.estimate(&record("a", json!("xxxx"))), 3);
    }
}
