use sluice_observability::Counter;

pub struct IngestMetrics {
    pub enqueued_records: Counter<u64>,
    pub enqueued_bytes: Counter<u64>,
    pub flushed_records: Counter<u64>,
    pub flushed_batches: Counter<u64>,
    pub ignored_records: Counter<u64>,
}

impl Default for IngestMetrics {
    fn default() -> Self {
        let meter = sluice_observability::meter("ingest");
        Self {
            enqueued_records: meter
                .u64_counter("sluice.ingest.enqueued.records")
                .with_unit("{message}")
                .with_description("number of messages added to stream buffers")
                .build(),
            enqueued_bytes: meter
                .u64_counter("sluice.ingest.enqueued.bytes")
                .with_unit("By")
                .with_description("estimated bytes added to stream buffers")
                .build(),
            flushed_records: meter
                .u64_counter("sluice.ingest.flushed.records")
                .with_unit("{message}")
                .with_description("number of messages flushed to the destination")
                .build(),
            flushed_batches: meter
                .u64_counter("sluice.ingest.flushed.batches")
                .with_unit("{batch}")
                .with_description("number of batches flushed to the destination")
                .build(),
            ignored_records: meter
                .u64_counter("sluice.ingest.ignored.records")
                .with_unit("{record}")
                .with_description("number of records that failed validation")
                .build(),
        }
    }
}
