use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use common::{
    FailingFlusher, RecordingFlusher, create_consumer, quiet_options, record, record_ids, stream_a,
};
use serde_json::Value;
use sluice_ingest_core::{BoxError, ConsumerState, IngestError, Result, StreamKey};

mod common;

#[tokio::test(start_paused = true)]
async fn test_close_drains_everything() -> Result<()> {
    let flusher = Arc::new(RecordingFlusher::default());
    let consumer = create_consumer(flusher.clone(), quiet_options(1024)).build();
    consumer.start().await?;

    for id in 0..10 {
        consumer.accept(record(&stream_a(), id)).await?;
    }
    assert_eq!(consumer.total_usage_bytes(), 100);
    assert_eq!(flusher.batch_count(), 0);

    consumer.close().await?;
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(consumer.total_usage_bytes(), 0);
    assert_eq!(
        record_ids(&flusher.messages(&stream_a().into())),
        (0..10).collect::<Vec<_>>()
    );

    // Nothing is flushed once close returned.
    let batches = flusher.batch_count();
    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(flusher.batch_count(), batches);

    Ok(())
}

#[tokio::test]
async fn test_close_waits_for_blocked_producers() -> Result<()> {
    let flusher = Arc::new(RecordingFlusher::default());
    let consumer = Arc::new(create_consumer(flusher.clone(), quiet_options(10)).build());
    consumer.start().await?;

    let producer = tokio::spawn({
        let consumer = consumer.clone();
        async move {
            for id in 0..20 {
                consumer.accept(record(&stream_a(), id)).await?;
            }
            Ok::<_, IngestError>(())
        }
    });

    tokio::task::yield_now().await;
    producer.await.expect("producer task")?;
    consumer.close().await?;

    assert_eq!(consumer.total_usage_bytes(), 0);
    assert_eq!(
        record_ids(&flusher.messages(&stream_a().into())),
        (0..20).collect::<Vec<_>>()
    );

    Ok(())
}

#[tokio::test]
async fn test_zero_batch_records_still_drains_on_close() -> Result<()> {
    let flusher = Arc::new(RecordingFlusher::default());
    let mut options = quiet_options(1024);
    options.flush = options.flush.with_max_batch_records(0);
    assert_eq!(options.flush.max_batch_records(), 1);

    let consumer = create_consumer(flusher.clone(), options).build();
    consumer.start().await?;

    for id in 0..3 {
        consumer.accept(record(&stream_a(), id)).await?;
    }

    tokio::time::timeout(Duration::from_secs(5), consumer.close())
        .await
        .expect("close returned")?;

    assert_eq!(consumer.total_usage_bytes(), 0);
    let batches = flusher.batches();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|(_, batch)| batch.len() == 1));
    assert_eq!(
        record_ids(&flusher.messages(&stream_a().into())),
        vec![0, 1, 2]
    );

    Ok(())
}

#[tokio::test]
async fn test_flush_failure_is_returned_from_close() {
    let flusher = Arc::new(FailingFlusher::default());
    let consumer = create_consumer(flusher.clone(), quiet_options(1024)).build();
    consumer.start().await.unwrap();

    consumer.accept(record(&stream_a(), 1)).await.unwrap();

    let err = consumer.close().await.unwrap_err();
    assert!(err.is_flush());
    let IngestError::Flush {
        stream, records, ..
    } = err
    else {
        panic!("expected flush error");
    };
    assert_eq!(stream, StreamKey::from(stream_a()));
    assert_eq!(records, 1);
    assert_eq!(flusher.attempts(), 1);
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn test_accept_fails_after_flush_failure() {
    let flusher = Arc::new(FailingFlusher::default());
    let mut options = quiet_options(1024);
    options.flush = options.flush.with_max_batch_records(1);

    let consumer = create_consumer(flusher.clone(), options)
        .with_validator(|_data: &Value| -> Result<bool, BoxError> { Ok(false) })
        .build();
    consumer.start().await.unwrap();

    // A single record is a full batch, the worker flushes it right away and fails.
    consumer.accept(record(&stream_a(), 1)).await.unwrap();
    assert_eq!(consumer.ignored_records(&stream_a()), 1);
    while flusher.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = consumer.accept(record(&stream_a(), 2)).await.unwrap_err();
    assert!(matches!(err, IngestError::BufferClosed { .. }));

    // The rejected record never reached a buffer, so it is not reported.
    assert_eq!(consumer.ignored_records(&stream_a()), 1);

    let err = consumer.close().await.unwrap_err();
    assert!(err.is_flush());
    assert_eq!(flusher.attempts(), 1);
}

#[tokio::test]
async fn test_close_hook_failure_still_drains() {
    let flusher = Arc::new(RecordingFlusher::default());
    let hook_called = Arc::new(AtomicBool::new(false));

    let on_close = {
        let hook_called = hook_called.clone();
        move || {
            let hook_called = hook_called.clone();
            async move {
                hook_called.store(true, Ordering::SeqCst);
                Err::<(), BoxError>("close hook failed".into())
            }
        }
    };

    let consumer = create_consumer(flusher.clone(), quiet_options(1024))
        .with_on_close(on_close)
        .build();
    consumer.start().await.unwrap();
    consumer.accept(record(&stream_a(), 1)).await.unwrap();

    let err = consumer.close().await.unwrap_err();
    assert!(matches!(err, IngestError::Hook { hook: "close", .. }));
    assert!(hook_called.load(Ordering::SeqCst));

    assert_eq!(consumer.total_usage_bytes(), 0);
    assert_eq!(record_ids(&flusher.messages(&stream_a().into())), vec![1]);
}

#[tokio::test]
async fn test_start_hook_failure_is_returned() {
    let flusher = Arc::new(RecordingFlusher::default());
    let on_start = || async { Err::<(), BoxError>("start hook failed".into()) };

    let consumer = create_consumer(flusher.clone(), quiet_options(1024))
        .with_on_start(on_start)
        .build();

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, IngestError::Hook { hook: "start", .. }));

    // The workers are running, so the consumer must still be closed.
    assert_eq!(consumer.state(), ConsumerState::Started);
    consumer.close().await.unwrap();
}
