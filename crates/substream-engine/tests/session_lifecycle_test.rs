//! Integration tests for single-session lifecycle: admission, streaming,
//! commits, stream limits and restart from the committed checkpoint

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use substream_coordination::{CoordinationStore, InMemoryCoordinationStore, RetryPolicy};
use substream_core::{Cursor, Partition, StreamBatch, SubscriptionId};
use substream_engine::{
    AdmissionError, AdmissionErrorKind, Client, CommitOutcome, EngineConfig, EngineError,
    EventType, InMemoryEventLog, InMemoryMetadata, InvalidCursorReason, ManualConnectionProbe,
    PartitionState, SessionEnd, SessionHandle, StaticAuthorizer, StreamParameters, Subscription,
    SubscriptionStreamer,
};

struct Fixture {
    streamer: SubscriptionStreamer,
    store: Arc<InMemoryCoordinationStore>,
    log: Arc<InMemoryEventLog>,
}

fn test_config(broker_id: &str) -> EngineConfig {
    EngineConfig {
        broker_id: broker_id.to_string(),
        heartbeat_interval: Duration::from_millis(50),
        disconnect_poll_interval: Duration::from_millis(10),
        log_poll_interval: Duration::from_millis(5),
        retry_policy: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0),
        ..EngineConfig::default()
    }
}

/// Subscription "sub" over event type "orders" with `partitions` partitions
async fn fixture(partitions: u32, session_ttl: Duration) -> Fixture {
    let metadata = Arc::new(InMemoryMetadata::new());
    metadata
        .put_event_type(EventType::new("orders", partitions))
        .await;
    metadata
        .put_subscription(Subscription {
            id: SubscriptionId::new("sub"),
            event_types: ["orders".to_string()].into_iter().collect(),
            consumer_group: "group".to_string(),
        })
        .await;

    let store = Arc::new(InMemoryCoordinationStore::with_session_ttl(session_ttl));
    let log = Arc::new(InMemoryEventLog::new());

    let streamer = SubscriptionStreamer::builder()
        .config(test_config("broker-1"))
        .metadata(metadata)
        .coordination_store(store.clone())
        .event_log(log.clone())
        .build()
        .unwrap();
    streamer.start().await.unwrap();

    Fixture {
        streamer,
        store,
        log,
    }
}

async fn publish(log: &InMemoryEventLog, partition: &Partition, count: usize) {
    for n in 0..count {
        log.append(partition, Bytes::from(format!("{{\"n\":{}}}", n)))
            .await;
    }
}

async fn open(f: &Fixture, params: StreamParameters) -> SessionHandle {
    f.streamer
        .open_session(
            &SubscriptionId::new("sub"),
            &Client::new("client-1"),
            params,
            Arc::new(ManualConnectionProbe::new()),
        )
        .await
        .unwrap()
}

/// Next batch carrying events, skipping keep-alives
async fn next_data_batch(handle: &mut SessionHandle) -> StreamBatch {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match handle.next_batch().await {
                Some(batch) if !batch.is_keep_alive() => return batch,
                Some(_) => continue,
                None => panic!("stream ended: {:?}", handle.end_reason()),
            }
        }
    })
    .await
    .expect("no data batch in time")
}

async fn drain(handle: &mut SessionHandle) -> Vec<StreamBatch> {
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut batches = Vec::new();
        while let Some(batch) = handle.next_batch().await {
            batches.push(batch);
        }
        batches
    })
    .await
    .expect("stream did not end in time")
}

fn offsets(batch: &StreamBatch) -> Vec<u64> {
    batch.events.iter().map(|e| e.offset).collect()
}

fn params(batch_limit: i32) -> StreamParameters {
    StreamParameters {
        batch_limit,
        batch_flush_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_invalid_parameters_register_nothing() {
    let f = fixture(1, Duration::from_secs(60)).await;

    let result = f
        .streamer
        .open_session(
            &SubscriptionId::new("sub"),
            &Client::new("client-1"),
            params(0),
            Arc::new(ManualConnectionProbe::new()),
        )
        .await;

    match result {
        Err(EngineError::Admission(e)) => {
            assert_eq!(e.kind(), AdmissionErrorKind::InvalidParameter);
            assert_eq!(e.reason(), "batch_limit can't be lower than 1");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("session opened with batch_limit 0"),
    }

    let sessions = f.store.list_sessions(&SubscriptionId::new("sub")).await.unwrap();
    assert!(sessions.is_empty());
    assert!(f.streamer.local_sessions().await.is_empty());
}

#[tokio::test]
async fn test_out_of_range_timeout_registers_nothing() {
    let f = fixture(1, Duration::from_secs(60)).await;

    let result = f
        .streamer
        .open_session(
            &SubscriptionId::new("sub"),
            &Client::new("client-1"),
            StreamParameters {
                stream_timeout: Duration::from_secs(u64::MAX),
                ..params(1)
            },
            Arc::new(ManualConnectionProbe::new()),
        )
        .await;

    match result {
        Err(EngineError::Admission(e)) => {
            assert_eq!(e.kind(), AdmissionErrorKind::InvalidParameter);
            assert_eq!(e.reason(), "stream_timeout can't be greater than 4200 seconds");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("session opened with an unbounded stream_timeout"),
    }

    let sessions = f.store.list_sessions(&SubscriptionId::new("sub")).await.unwrap();
    assert!(sessions.is_empty());
    assert!(f.streamer.local_sessions().await.is_empty());
}

#[tokio::test]
async fn test_denied_event_type_is_named() {
    let metadata = Arc::new(InMemoryMetadata::new());
    for name in ["A", "B", "C"] {
        metadata.put_event_type(EventType::new(name, 1)).await;
    }
    metadata
        .put_subscription(Subscription {
            id: SubscriptionId::new("multi"),
            event_types: ["A", "B", "C"].iter().map(|s| s.to_string()).collect(),
            consumer_group: "group".to_string(),
        })
        .await;
    let authorizer = Arc::new(StaticAuthorizer::allow_all());
    authorizer.deny("client-1", "B");
    let store = Arc::new(InMemoryCoordinationStore::new());

    let streamer = SubscriptionStreamer::builder()
        .config(test_config("broker-1"))
        .metadata(metadata)
        .authorizer(authorizer)
        .coordination_store(store.clone())
        .event_log(Arc::new(InMemoryEventLog::new()))
        .build()
        .unwrap();
    streamer.start().await.unwrap();

    let result = streamer
        .open_session(
            &SubscriptionId::new("multi"),
            &Client::new("client-1"),
            StreamParameters::default(),
            Arc::new(ManualConnectionProbe::new()),
        )
        .await;

    match result {
        Err(EngineError::Admission(e)) => {
            assert_eq!(
                e,
                AdmissionError::AccessDenied {
                    resource: "READ:B".to_string()
                }
            );
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("denied client was admitted"),
    }
    let sessions = store.list_sessions(&SubscriptionId::new("multi")).await.unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn test_unknown_subscription_is_not_found() {
    let f = fixture(1, Duration::from_secs(60)).await;

    let result = f
        .streamer
        .open_session(
            &SubscriptionId::new("missing"),
            &Client::new("client-1"),
            StreamParameters::default(),
            Arc::new(ManualConnectionProbe::new()),
        )
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Admission(AdmissionError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_batches_follow_partition_order() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 7).await;

    let mut handle = open(&f, params(3)).await;

    let first = next_data_batch(&mut handle).await;
    assert_eq!(offsets(&first), vec![0, 1, 2]);
    assert_eq!(first.cursor, Some(Cursor::new(partition.clone(), 2)));

    let second = next_data_batch(&mut handle).await;
    assert_eq!(offsets(&second), vec![3, 4, 5]);

    // the trailing event is flushed by batch_flush_timeout
    let third = next_data_batch(&mut handle).await;
    assert_eq!(offsets(&third), vec![6]);
    assert_eq!(third.cursor, Some(Cursor::new(partition, 6)));

    f.streamer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commit_outcomes() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 5).await;

    let mut handle = open(&f, params(5)).await;
    let session_id = handle.session_id();
    let batch = next_data_batch(&mut handle).await;
    assert_eq!(batch.cursor, Some(Cursor::new(partition.clone(), 4)));

    let results = f
        .streamer
        .commit_cursors(
            &session_id,
            vec![
                Cursor::new(partition.clone(), 2),
                Cursor::new(partition.clone(), 1),
                Cursor::new(partition.clone(), 99),
                Cursor::new(Partition::new("orders", 7), 0),
                Cursor::new(partition.clone(), 4),
            ],
        )
        .await
        .unwrap();

    let outcomes: Vec<CommitOutcome> = results.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            CommitOutcome::Committed,
            CommitOutcome::Outdated,
            CommitOutcome::InvalidCursor(InvalidCursorReason::OffsetNotDelivered),
            CommitOutcome::InvalidCursor(InvalidCursorReason::PartitionNotAssigned),
            CommitOutcome::Committed,
        ]
    );

    let committed = f
        .store
        .get_committed_offsets(&SubscriptionId::new("sub"))
        .await
        .unwrap();
    assert_eq!(committed.get(&partition), Some(&4));

    f.streamer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commit_for_unknown_session() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let result = f
        .streamer
        .commit_cursors(
            &substream_core::SessionId::generate(),
            vec![Cursor::new(Partition::new("orders", 0), 0)],
        )
        .await;
    assert!(matches!(result, Err(EngineError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_restart_resumes_after_committed_offset() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 10).await;

    let mut first = open(&f, params(5)).await;
    let batch = next_data_batch(&mut first).await;
    assert_eq!(offsets(&batch), vec![0, 1, 2, 3, 4]);
    f.streamer
        .commit_cursors(&first.session_id(), vec![Cursor::new(partition.clone(), 4)])
        .await
        .unwrap();

    // delivered but never committed: must be delivered again
    let batch = next_data_batch(&mut first).await;
    assert_eq!(offsets(&batch), vec![5, 6, 7, 8, 9]);

    f.streamer.close_session(&first.session_id()).await.unwrap();
    drain(&mut first).await;
    assert_eq!(first.end_reason(), Some(SessionEnd::Closed));

    let mut second = open(&f, params(5)).await;
    let batch = next_data_batch(&mut second).await;
    assert_eq!(offsets(&batch), vec![5, 6, 7, 8, 9]);

    f.streamer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_clamped_to_retention() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 10).await;
    f.log.truncate_before(&partition, 6).await;

    let mut handle = open(&f, params(10)).await;
    let batch = next_data_batch(&mut handle).await;
    assert_eq!(offsets(&batch), vec![6, 7, 8, 9]);

    f.streamer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stream_limit_ends_stream() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 10).await;

    let mut handle = open(
        &f,
        StreamParameters {
            batch_limit: 2,
            stream_limit: 5,
            ..params(2)
        },
    )
    .await;

    let batches = drain(&mut handle).await;
    let delivered: Vec<u64> = batches.iter().flat_map(offsets).collect();
    assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
    assert_eq!(handle.end_reason(), Some(SessionEnd::StreamLimitReached));

    // the ended session is deregistered
    let sub = SubscriptionId::new("sub");
    let mut deregistered = false;
    for _ in 0..50 {
        if f.store.list_sessions(&sub).await.unwrap().is_empty() {
            deregistered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(deregistered);
}

#[tokio::test]
async fn test_keep_alive_limit_ends_idle_stream() {
    let f = fixture(1, Duration::from_secs(60)).await;

    let mut handle = open(
        &f,
        StreamParameters {
            batch_flush_timeout: Duration::from_millis(30),
            stream_keep_alive_limit: 2,
            ..params(1)
        },
    )
    .await;

    let batches = drain(&mut handle).await;
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.is_keep_alive() && b.cursor.is_none()));
    assert_eq!(handle.end_reason(), Some(SessionEnd::KeepAliveLimit));
}

#[tokio::test]
async fn test_stream_timeout_ends_stream() {
    let f = fixture(1, Duration::from_secs(60)).await;

    let mut handle = open(
        &f,
        StreamParameters {
            stream_timeout: Duration::from_millis(150),
            ..params(1)
        },
    )
    .await;

    drain(&mut handle).await;
    assert_eq!(handle.end_reason(), Some(SessionEnd::StreamTimeout));
}

#[tokio::test]
async fn test_commit_timeout_closes_session() {
    let f = fixture(1, Duration::from_secs(60)).await;
    publish(&f.log, &Partition::new("orders", 0), 3).await;

    let mut handle = open(
        &f,
        StreamParameters {
            commit_timeout: Duration::from_millis(100),
            ..params(3)
        },
    )
    .await;

    let batches = drain(&mut handle).await;
    assert_eq!(batches.iter().filter(|b| !b.is_keep_alive()).count(), 1);
    assert_eq!(handle.end_reason(), Some(SessionEnd::CommitTimeout));
}

#[tokio::test]
async fn test_uncommitted_ceiling_pauses_delivery() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 10).await;

    let mut handle = open(
        &f,
        StreamParameters {
            max_uncommitted_events: 4,
            ..params(2)
        },
    )
    .await;

    assert_eq!(offsets(&next_data_batch(&mut handle).await), vec![0, 1]);
    assert_eq!(offsets(&next_data_batch(&mut handle).await), vec![2, 3]);

    // nothing more until something is committed
    let paused = tokio::time::timeout(Duration::from_millis(250), async {
        loop {
            match handle.next_batch().await {
                Some(batch) if batch.is_keep_alive() => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(paused.is_err());

    f.streamer
        .commit_cursors(&handle.session_id(), vec![Cursor::new(partition, 1)])
        .await
        .unwrap();
    assert_eq!(offsets(&next_data_batch(&mut handle).await), vec![4, 5]);

    f.streamer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscription_stats() {
    let f = fixture(2, Duration::from_secs(60)).await;
    let partition = Partition::new("orders", 0);
    publish(&f.log, &partition, 3).await;

    let mut handle = open(&f, params(3)).await;
    let batch = next_data_batch(&mut handle).await;
    f.streamer
        .commit_cursors(&handle.session_id(), vec![batch.cursor.unwrap()])
        .await
        .unwrap();

    let stats = f
        .streamer
        .subscription_stats(&SubscriptionId::new("sub"))
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.state == PartitionState::Assigned
        && s.session_id == Some(handle.session_id())));
    assert_eq!(stats[0].committed_offset, Some(2));
    assert_eq!(stats[1].committed_offset, None);

    f.streamer.close_session(&handle.session_id()).await.unwrap();
    let stats = f
        .streamer
        .subscription_stats(&SubscriptionId::new("sub"))
        .await
        .unwrap();
    assert!(stats
        .iter()
        .all(|s| s.state == PartitionState::Unassigned && s.session_id.is_none()));
    assert_eq!(stats[0].committed_offset, Some(2));
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive() {
    let f = fixture(1, Duration::from_millis(200)).await;
    let handle = open(&f, params(1)).await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let sessions = f.store.list_sessions(&SubscriptionId::new("sub")).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, handle.session_id());
    assert_eq!(sessions[0].broker_id, "broker-1");

    f.streamer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let f = fixture(1, Duration::from_secs(60)).await;
    let handle = open(&f, params(1)).await;

    f.streamer.close_session(&handle.session_id()).await.unwrap();
    f.streamer.close_session(&handle.session_id()).await.unwrap();

    let sessions = f.store.list_sessions(&SubscriptionId::new("sub")).await.unwrap();
    assert!(sessions.is_empty());
    let assignment = f.store.get_assignment(&SubscriptionId::new("sub")).await.unwrap();
    assert!(assignment.value.owners.is_empty());
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let f = fixture(1, Duration::from_secs(60)).await;
    f.store.set_available(false);

    let result = f
        .streamer
        .open_session(
            &SubscriptionId::new("sub"),
            &Client::new("client-1"),
            params(1),
            Arc::new(ManualConnectionProbe::new()),
        )
        .await;
    assert!(matches!(result, Err(EngineError::CoordinationUnavailable(_))));
    assert!(f.streamer.local_sessions().await.is_empty());
}
