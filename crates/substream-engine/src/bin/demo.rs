//! Substream Demo Binary
//!
//! Runs one broker process in memory: publishes synthetic events to a
//! subscription, streams it with two consumers, prints every batch as the JSON
//! line a client would receive and commits each cursor.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: log level (default: info)
//! - `SUBSTREAM_*`: engine configuration, see `EngineConfig::from_env`
//! - `DEMO_PARTITIONS`: partitions of the demo event type (default: 4)
//! - `DEMO_EVENTS`: events published per partition (default: 20)
//!
//! # Example
//!
//! ```bash
//! RUST_LOG=debug DEMO_EVENTS=50 cargo run --bin substream-demo
//! ```

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use substream_coordination::InMemoryCoordinationStore;
use substream_core::{Partition, SubscriptionId};
use substream_engine::{
    Client, EngineConfig, EventType, InMemoryEventLog, InMemoryMetadata, ManualConnectionProbe,
    SessionHandle, StreamParameters, Subscription, SubscriptionStreamer,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const EVENT_TYPE: &str = "order.created";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EngineConfig::from_env();
    let partition_count = env_u32("DEMO_PARTITIONS").unwrap_or(4);
    let events_per_partition = env_u32("DEMO_EVENTS").unwrap_or(20);

    info!(
        broker_id = %config.broker_id,
        partitions = partition_count,
        events_per_partition,
        "Substream demo starting"
    );

    let subscription_id = SubscriptionId::new("demo-subscription");
    let metadata = Arc::new(InMemoryMetadata::new());
    metadata
        .put_event_type(EventType::new(EVENT_TYPE, partition_count))
        .await;
    metadata
        .put_subscription(Subscription {
            id: subscription_id.clone(),
            event_types: [EVENT_TYPE.to_string()].into_iter().collect(),
            consumer_group: "demo".to_string(),
        })
        .await;

    let log = Arc::new(InMemoryEventLog::new());
    for index in 0..partition_count {
        let partition = Partition::new(EVENT_TYPE, index);
        for n in 0..events_per_partition {
            let payload = format!(
                "{{\"order_id\":\"{}-{}\",\"partition\":{}}}",
                index, n, index
            );
            log.append(&partition, Bytes::from(payload)).await;
        }
    }

    let store = Arc::new(InMemoryCoordinationStore::with_session_ttl(
        config.session_ttl,
    ));
    let streamer = Arc::new(
        SubscriptionStreamer::builder()
            .config(config)
            .metadata(metadata)
            .coordination_store(store)
            .event_log(log)
            .build()?,
    );
    streamer.start().await?;

    let params = StreamParameters {
        batch_limit: 5,
        stream_keep_alive_limit: 2,
        batch_flush_timeout: Duration::from_millis(500),
        ..Default::default()
    };

    let mut consumers = Vec::new();
    for name in ["consumer-a", "consumer-b"] {
        let handle = streamer
            .open_session(
                &subscription_id,
                &Client::new(name),
                params.clone(),
                Arc::new(ManualConnectionProbe::new()),
            )
            .await?;
        consumers.push(tokio::spawn(consume(
            Arc::clone(&streamer),
            name,
            handle,
        )));
    }

    let mut total = 0;
    for consumer in consumers {
        match consumer.await {
            Ok(events) => total += events,
            Err(e) => error!(error = %e, "Consumer task failed"),
        }
    }

    let stats = streamer.subscription_stats(&subscription_id).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    streamer.shutdown().await?;
    info!(events = total, "Substream demo finished");
    Ok(())
}

/// Print and commit every batch until the stream ends
async fn consume(
    streamer: Arc<SubscriptionStreamer>,
    name: &'static str,
    mut handle: SessionHandle,
) -> usize {
    let session_id = handle.session_id();
    let mut received = 0;

    while let Some(batch) = handle.next_batch().await {
        match batch.to_json_line() {
            Ok(line) => print!("[{}] {}", name, String::from_utf8_lossy(&line)),
            Err(e) => error!(consumer = name, error = %e, "Could not render batch"),
        }
        received += batch.events.len();

        if let Some(cursor) = batch.cursor {
            if let Err(e) = streamer.commit_cursors(&session_id, vec![cursor]).await {
                error!(consumer = name, error = %e, "Commit failed");
            }
        }
    }

    info!(
        consumer = name,
        events = received,
        reason = ?handle.end_reason(),
        "Stream ended"
    );
    received
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
