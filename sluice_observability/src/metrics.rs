use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};

use opentelemetry_sdk::{
    error::OTelSdkResult,
    metrics::{
        InstrumentKind, ManualReader, Pipeline, Temporality,
        data::{AggregatedMetrics, MetricData, ResourceMetrics},
        reader::MetricReader,
    },
};
use snafu::ResultExt;

use crate::{CollectSnafu, ObservabilityError};

/// Metric reader that collects on demand.
#[derive(Clone, Debug)]
pub struct MetricsExporter {
    reader: Arc<ManualReader>,
}

impl MetricsExporter {
    /// Creates an exporter with cumulative temporality, so every collection
    /// returns the totals since startup.
    pub fn new() -> Self {
        let reader = ManualReader::builder()
            .with_temporality(Temporality::Cumulative)
            .build();

        Self {
            reader: Arc::new(reader),
        }
    }

    /// Returns the current value of every `u64` counter, summed over all attributes.
    pub fn counter_totals(&self) -> Result<BTreeMap<String, u64>, ObservabilityError> {
        let mut rm = ResourceMetrics::default();
        self.reader.collect(&mut rm).context(CollectSnafu {})?;

        let mut totals = BTreeMap::new();
        for scope_metrics in rm.scope_metrics() {
            for metric in scope_metrics.metrics() {
                if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
                    let total = sum.data_points().map(|dp| dp.value()).sum::<u64>();
                    *totals.entry(metric.name().to_string()).or_default() += total;
                }
            }
        }

        Ok(totals)
    }
}

impl MetricReader for MetricsExporter {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.reader.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.reader.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.reader.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.reader.shutdown_with_timeout(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.reader.temporality(kind)
    }
}

impl Default for MetricsExporter {
    fn default() -> Self {
        Self::new()
    }
}
