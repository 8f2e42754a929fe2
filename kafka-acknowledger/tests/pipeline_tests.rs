use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kafka_acknowledger::test_utils::{
    channel_source, receiver_record, OffsetEvent, OffsetLog, RecordingOffset,
};
use kafka_acknowledger::{
    AckError, AcknowledgeableRecord, AcknowledgeableStream, AcknowledgementConfig,
    AcknowledgementStrategy, MaxInFlight, Partition, PipelineError, RawRecord, ReceiverRecord,
    RecordTransformer,
};
use parking_lot::Mutex;
use test_case::test_case;
use tokio_test::{assert_pending, assert_ready};

const TOPIC: &str = "events";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn transformer(strategy: AcknowledgementStrategy, max: usize) -> RecordTransformer {
    RecordTransformer::new(strategy, MaxInFlight::limited(max).unwrap())
}

fn partition(number: i32) -> Partition {
    Partition::new(TOPIC, number)
}

async fn next_record(stream: &mut AcknowledgeableStream<i64>) -> AcknowledgeableRecord<i64> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a record")
        .expect("stream ended")
        .expect("stream failed")
}

async fn next_error(stream: &mut AcknowledgeableStream<i64>) -> PipelineError {
    match tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for an error")
    {
        Some(Err(error)) => error,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_limit_two_emits_in_arrival_order_as_slots_free() {
    init_tracing();
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 2).transform(source);

    for offset in 1..=4 {
        records
            .send(Ok(receiver_record(&log, TOPIC, 0, offset)))
            .unwrap();
    }

    let r1 = next_record(&mut stream).await;
    let r2 = next_record(&mut stream).await;
    assert_eq!((r1.offset(), r2.offset()), (1, 2));

    // r3 is withheld until r1 resolves
    let mut next = tokio_test::task::spawn(stream.next());
    assert_pending!(next.poll());
    r1.acknowledge();
    assert!(next.is_woken());
    let r3 = assert_ready!(next.poll()).unwrap().unwrap();
    assert_eq!(r3.offset(), 3);
    drop(next);

    // r4 is withheld until r2 resolves, and a failure frees the slot too
    let mut next = tokio_test::task::spawn(stream.next());
    assert_pending!(next.poll());
    r2.fail("unparseable payload");
    assert!(next.is_woken());
    let r4 = assert_ready!(next.poll()).unwrap().unwrap();
    assert_eq!(r4.offset(), 4);
    drop(next);

    r3.acknowledge();
    r4.acknowledge();

    assert_eq!(
        log.events(),
        vec![
            OffsetEvent::Committed(partition(0), 1),
            OffsetEvent::Failed(partition(0), 2),
            OffsetEvent::Committed(partition(0), 3),
            OffsetEvent::Committed(partition(0), 4),
        ]
    );
}

#[tokio::test]
async fn test_unbounded_emits_everything_immediately() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = RecordTransformer::new(AcknowledgementStrategy::Ordered, MaxInFlight::unbounded())
        .transform(source);

    for offset in 0..100 {
        records
            .send(Ok(receiver_record(&log, TOPIC, 0, offset)))
            .unwrap();
    }

    let mut emitted = Vec::new();
    for _ in 0..100 {
        emitted.push(next_record(&mut stream).await);
    }
    assert!(log.is_empty());

    for record in emitted {
        record.acknowledge();
    }
    assert_eq!(log.committed(&partition(0)), (0..100).collect::<Vec<_>>());
}

#[test_case(AcknowledgementStrategy::Ordered, vec![0, 1, 2]; "ordered commits follow offsets")]
#[test_case(AcknowledgementStrategy::Unordered, vec![2, 1, 0]; "unordered commits follow resolution")]
#[tokio::test]
async fn test_commit_order(strategy: AcknowledgementStrategy, expected: Vec<i64>) {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(strategy, 3).transform(source);

    for offset in 0..3 {
        records
            .send(Ok(receiver_record(&log, TOPIC, 0, offset)))
            .unwrap();
    }

    let r0 = next_record(&mut stream).await;
    let r1 = next_record(&mut stream).await;
    let r2 = next_record(&mut stream).await;

    r2.acknowledge();
    r1.acknowledge();
    r0.acknowledge();

    assert_eq!(log.committed(&partition(0)), expected);
}

#[tokio::test]
async fn test_ordered_resolved_record_keeps_slot_until_head_resolves() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 2).transform(source);

    for offset in 0..3 {
        records
            .send(Ok(receiver_record(&log, TOPIC, 0, offset)))
            .unwrap();
    }

    let r0 = next_record(&mut stream).await;
    let r1 = next_record(&mut stream).await;
    r1.acknowledge();

    let mut next = tokio_test::task::spawn(stream.next());
    assert_pending!(next.poll());
    assert!(log.is_empty());

    r0.acknowledge();
    let r2 = assert_ready!(next.poll()).unwrap().unwrap();
    drop(next);
    r2.acknowledge();

    assert_eq!(log.committed(&partition(0)), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_partitions_are_bounded_independently() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1).transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 1, 0))).unwrap();

    let first = next_record(&mut stream).await;
    let other = next_record(&mut stream).await;
    assert_eq!(first.partition(), &partition(0));
    assert_eq!(other.partition(), &partition(1));

    other.acknowledge();
    first.acknowledge();
    let last = next_record(&mut stream).await;
    assert_eq!((last.partition(), last.offset()), (&partition(0), 1));
    last.acknowledge();
}

#[tokio::test]
async fn test_commit_failure_terminates_subscription() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Unordered, 4).transform(source);

    let failing = ReceiverRecord::new(
        RawRecord::new(partition(0), 0, 0),
        RecordingOffset::new(&log, partition(0), 0).failing_commit("broker unavailable"),
    );
    records.send(Ok(failing)).unwrap();

    next_record(&mut stream).await.acknowledge();

    match next_error(&mut stream).await {
        PipelineError::Acknowledgement(AckError::Commit {
            partition: p,
            offset,
            reason,
        }) => {
            assert_eq!(p, partition(0));
            assert_eq!(offset, 0);
            assert_eq!(reason, "broker unavailable");
        }
        other => panic!("expected commit failure, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_record_failure_is_local_by_default() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1).transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();

    next_record(&mut stream).await.fail(anyhow::anyhow!("bad payload"));
    next_record(&mut stream).await.acknowledge();

    assert_eq!(log.failed(&partition(0)), vec![0]);
    assert_eq!(log.committed(&partition(0)), vec![1]);
}

#[tokio::test]
async fn test_fail_fast_terminates_on_record_failure() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1)
        .with_fail_fast_on_record_failure(true)
        .transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();

    next_record(&mut stream).await.fail("bad payload");

    match next_error(&mut stream).await {
        PipelineError::Acknowledgement(error) => {
            assert_eq!(error, AckError::Processing("bad payload".to_string()));
        }
        other => panic!("expected acknowledgement failure, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert_eq!(log.failed(&partition(0)), vec![0]);
}

#[tokio::test]
async fn test_subscriptions_do_not_share_error_bus() {
    let log = OffsetLog::new();
    let transformer = transformer(AcknowledgementStrategy::Unordered, 2);

    let (records_a, source_a) = channel_source();
    let (records_b, source_b) = channel_source();
    let mut stream_a = transformer.transform(source_a);
    let mut stream_b = transformer.transform(source_b);

    records_a
        .send(Ok(ReceiverRecord::new(
            RawRecord::new(partition(0), 0, 0),
            RecordingOffset::new(&log, partition(0), 0).failing_commit("lost"),
        )))
        .unwrap();
    records_b.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records_b.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();

    let from_b = next_record(&mut stream_b).await;
    next_record(&mut stream_a).await.acknowledge();
    assert!(matches!(
        next_error(&mut stream_a).await,
        PipelineError::Acknowledgement(_)
    ));

    from_b.acknowledge();
    next_record(&mut stream_b).await.acknowledge();
    assert_eq!(log.committed(&partition(0)), vec![0, 1]);
}

#[tokio::test]
async fn test_cancellation_releases_slots_for_next_subscription() {
    let log = OffsetLog::new();
    let transformer = transformer(AcknowledgementStrategy::Ordered, 2);

    let (records, source) = channel_source();
    let mut cancelled = transformer.transform(source);
    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();
    let stale = vec![
        next_record(&mut cancelled).await,
        next_record(&mut cancelled).await,
    ];
    drop(cancelled);

    let (records, source) = channel_source();
    let mut fresh = transformer.transform(source);
    records.send(Ok(receiver_record(&log, TOPIC, 0, 2))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 3))).unwrap();
    let admitted = vec![next_record(&mut fresh).await, next_record(&mut fresh).await];

    // Late resolutions from the cancelled subscription are no-ops
    for record in stale {
        record.acknowledge();
    }
    assert!(log.is_empty());

    for record in admitted {
        record.acknowledge();
    }
    assert_eq!(log.committed(&partition(0)), vec![2, 3]);
}

#[tokio::test]
async fn test_cancellation_discards_held_records_without_callbacks() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1).transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();
    let first = next_record(&mut stream).await;

    // Offset 1 is pulled in and held behind the occupied slot
    let mut next = tokio_test::task::spawn(stream.next());
    assert_pending!(next.poll());
    drop(next);
    drop(stream);

    first.acknowledge();
    assert!(log.is_empty());
}

#[test_case(false; "commit failure")]
#[test_case(true; "fail fast record failure")]
#[tokio::test]
async fn test_injected_error_is_not_held_behind_full_partition(fail_fast: bool) {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1)
        .with_fail_fast_on_record_failure(fail_fast)
        .transform(source);

    let head = ReceiverRecord::new(
        RawRecord::new(partition(0), 0, 0),
        RecordingOffset::new(&log, partition(0), 0).failing_commit("broker unavailable"),
    );
    records.send(Ok(head)).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();
    let first = next_record(&mut stream).await;

    let mut next = tokio_test::task::spawn(stream.next());
    assert_pending!(next.poll());

    let expected = if fail_fast {
        first.fail("bad payload");
        AckError::Processing("bad payload".to_string())
    } else {
        first.acknowledge();
        AckError::commit(partition(0), 0, "broker unavailable")
    };

    assert!(next.is_woken());
    match assert_ready!(next.poll()) {
        Some(Err(PipelineError::Acknowledgement(error))) => assert_eq!(error, expected),
        other => panic!("expected acknowledgement failure, got {other:?}"),
    }
    drop(next);
    assert!(stream.next().await.is_none());

    // The held record was never emitted and reports nothing upstream
    let expected_events = if fail_fast {
        vec![OffsetEvent::Failed(partition(0), 0)]
    } else {
        vec![]
    };
    assert_eq!(log.events(), expected_events);
}

#[tokio::test]
async fn test_revocation_discards_held_records_and_releases_slots() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1).transform(source);
    let revoker = stream.revoker();

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 1, 0))).unwrap();

    let revoked = next_record(&mut stream).await;
    let kept = next_record(&mut stream).await;
    assert_eq!(revoked.partition(), &partition(0));
    assert_eq!(kept.partition(), &partition(1));

    assert!(revoker.revoke(partition(0)));
    records.send(Ok(receiver_record(&log, TOPIC, 0, 5))).unwrap();

    let reassigned = next_record(&mut stream).await;
    assert_eq!((reassigned.partition(), reassigned.offset()), (&partition(0), 5));

    revoked.acknowledge();
    reassigned.acknowledge();
    kept.acknowledge();

    assert_eq!(log.committed(&partition(0)), vec![5]);
    assert_eq!(log.committed(&partition(1)), vec![0]);
    assert!(log.failed(&partition(0)).is_empty());
}

#[tokio::test]
async fn test_dropped_record_is_failed_and_frees_slot() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 1).transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();

    drop(next_record(&mut stream).await);
    next_record(&mut stream).await.acknowledge();

    assert_eq!(log.failed(&partition(0)), vec![0]);
    assert_eq!(log.committed(&partition(0)), vec![1]);
}

#[tokio::test]
async fn test_stream_ends_once_source_ends_and_records_resolve() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 2).transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();
    drop(records);

    let r0 = next_record(&mut stream).await;
    let r1 = next_record(&mut stream).await;

    let mut next = tokio_test::task::spawn(stream.next());
    assert_pending!(next.poll());
    r0.acknowledge();
    r1.acknowledge();
    assert!(assert_ready!(next.poll()).is_none());
}

#[tokio::test]
async fn test_source_error_is_terminal() {
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(AcknowledgementStrategy::Ordered, 2).transform(source);

    records
        .send(Err(PipelineError::Source("connection reset".to_string())))
        .unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();

    assert!(matches!(
        next_error(&mut stream).await,
        PipelineError::Source(_)
    ));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_reject_policy_from_config() {
    let log = OffsetLog::new();
    let config = AcknowledgementConfig {
        max_in_flight_per_partition: Some(1),
        overflow_policy: "reject".to_string(),
        ..AcknowledgementConfig::default()
    };
    let (records, source) = channel_source();
    let mut stream = RecordTransformer::from_config(&config)
        .unwrap()
        .transform(source);

    records.send(Ok(receiver_record(&log, TOPIC, 0, 0))).unwrap();
    records.send(Ok(receiver_record(&log, TOPIC, 0, 1))).unwrap();

    let first = next_record(&mut stream).await;
    assert!(matches!(
        next_error(&mut stream).await,
        PipelineError::InFlightLimitExceeded { max_in_flight: 1, .. }
    ));
    first.acknowledge();
    assert!(log.is_empty());
}

#[test_case(AcknowledgementStrategy::Ordered; "ordered")]
#[test_case(AcknowledgementStrategy::Unordered; "unordered")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution_never_exceeds_limit(strategy: AcknowledgementStrategy) {
    const MAX_IN_FLIGHT: usize = 3;
    const PARTITIONS: i32 = 4;
    const PER_PARTITION: i64 = 50;

    init_tracing();
    let log = OffsetLog::new();
    let (records, source) = channel_source();
    let mut stream = transformer(strategy, MAX_IN_FLIGHT).transform(source);

    for offset in 0..PER_PARTITION {
        for p in 0..PARTITIONS {
            records
                .send(Ok(receiver_record(&log, TOPIC, p, offset)))
                .unwrap();
        }
    }
    drop(records);

    let outstanding: Arc<Mutex<HashMap<Partition, usize>>> = Arc::default();
    let mut last_emitted: HashMap<Partition, i64> = HashMap::new();
    let mut resolvers = Vec::new();

    while let Some(item) = stream.next().await {
        let record = item.unwrap();
        let partition = record.partition().clone();

        {
            let mut outstanding = outstanding.lock();
            let count = outstanding.entry(partition.clone()).or_default();
            *count += 1;
            assert!(*count <= MAX_IN_FLIGHT, "{partition} exceeded the limit");
        }

        if let Some(previous) = last_emitted.insert(partition.clone(), record.offset()) {
            assert!(previous < record.offset(), "{partition} emitted out of order");
        }

        let outstanding = outstanding.clone();
        resolvers.push(tokio::spawn(async move {
            let delay = (record.offset() * 7 % 5) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;

            // Resolve and uncount under one lock, so a record emitted into the
            // freed slot is only counted once this one is gone
            let mut outstanding = outstanding.lock();
            if record.offset() % 10 == 0 {
                record.fail("sampled failure");
            } else {
                record.acknowledge();
            }
            *outstanding.entry(partition).or_default() -= 1;
        }));
    }

    for resolver in resolvers {
        resolver.await.unwrap();
    }

    for p in 0..PARTITIONS {
        let committed = log.committed(&partition(p));
        let failed = log.failed(&partition(p));
        assert_eq!(committed.len() + failed.len(), PER_PARTITION as usize);

        if strategy == AcknowledgementStrategy::Ordered {
            let mut sorted = committed.clone();
            sorted.sort_unstable();
            assert_eq!(committed, sorted);
        }
    }
}
