//! Optimistic Concurrency Tests
//!
//! Verifies the assignment record is only ever replaced through conditional
//! writes when several brokers race:
//! - exactly one of N concurrent writers with the same expected version wins
//! - losers can re-read and succeed on the fresh version

use std::sync::Arc;
use substream_coordination::{
    AssignmentRecord, CoordinationError, CoordinationStore, InMemoryCoordinationStore,
};
use substream_core::SubscriptionId;

#[tokio::test]
async fn test_only_one_concurrent_writer_wins() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let sub = SubscriptionId::new("sub-race");

    let mut handles = Vec::new();
    for generation in 1..=8u64 {
        let store = Arc::clone(&store);
        let sub = sub.clone();
        handles.push(tokio::spawn(async move {
            store
                .put_assignment(
                    &sub,
                    0,
                    AssignmentRecord {
                        generation,
                        ..Default::default()
                    },
                )
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(CoordinationError::VersionConflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.get_assignment(&sub).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_loser_succeeds_after_fresh_read() {
    let store = InMemoryCoordinationStore::new();
    let sub = SubscriptionId::new("sub-retry");

    let broker_a_view = store.get_assignment(&sub).await.unwrap();
    let broker_b_view = store.get_assignment(&sub).await.unwrap();

    store
        .put_assignment(
            &sub,
            broker_a_view.version,
            AssignmentRecord {
                generation: broker_a_view.value.generation + 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let lost = store
        .put_assignment(&sub, broker_b_view.version, AssignmentRecord::default())
        .await;
    assert!(matches!(lost, Err(CoordinationError::VersionConflict { .. })));

    let fresh = store.get_assignment(&sub).await.unwrap();
    assert_eq!(fresh.value.generation, 1);
    let version = store
        .put_assignment(
            &sub,
            fresh.version,
            AssignmentRecord {
                generation: fresh.value.generation + 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(version, 2);
}
