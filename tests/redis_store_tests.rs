use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use push_fanout::{
    clients::{
        clock::ManualClock,
        quota::QuotaTracker,
        redis::RedisStore,
        store::{Direction, DocumentStore, Filter, WriteOp},
    },
    models::quota::{QuotaConfig, ReservationMode},
};
use serde_json::{Value, json};
use testcontainers::{
    ContainerAsync, GenericImage,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

async fn redis_store() -> Result<(RedisStore, ContainerAsync<GenericImage>)> {
    let container = GenericImage::new("redis", "7.2-alpine")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(6379.tcp()).await?;
    let prefix = format!("test_{}", uuid::Uuid::new_v4());

    let store = RedisStore::connect(&format!("redis://{host}:{port}"), &prefix).await?;
    Ok((store, container))
}

fn doc(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Test: Documents round-trip and queries filter, order and limit
#[tokio::test]
#[ignore] // Requires Docker, run explicitly with --ignored
async fn test_crud_and_query() -> Result<()> {
    let (store, _container) = redis_store().await?;
    store.ping().await?;

    for (id, next, status) in [("a", 30, "pending"), ("b", 10, "pending"), ("c", 20, "failed")] {
        store
            .set("retry", id, doc(json!({ "next_attempt": next, "status": status })))
            .await?;
    }

    let due = store
        .query(
            "retry",
            &Filter::new()
                .eq("status", "pending")
                .le("next_attempt", 30)
                .order_by("next_attempt", Direction::Ascending)
                .limit(1),
        )
        .await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, "b");

    store
        .update("retry", "a", doc(json!({ "status": "failed" })))
        .await?;
    let a = store.get("retry", "a").await?.expect("document a");
    assert_eq!(a.get("status"), Some(&json!("failed")));
    assert_eq!(a.get("next_attempt"), Some(&json!(30)));

    assert!(
        store
            .update("retry", "missing", doc(json!({ "status": "x" })))
            .await
            .is_err()
    );

    store.delete("retry", "c").await?;
    assert!(store.get("retry", "c").await?.is_none());
    assert_eq!(store.query("retry", &Filter::new()).await?.len(), 2);

    Ok(())
}

/// Test: Batch writes apply every operation
#[tokio::test]
#[ignore]
async fn test_batch_write() -> Result<()> {
    let (store, _container) = redis_store().await?;

    store.set("users", "u1", doc(json!({ "isActive": true }))).await?;
    store
        .batch_write(vec![
            WriteOp::Set {
                collection: "users".to_string(),
                id: "u2".to_string(),
                doc: doc(json!({ "isActive": true })),
            },
            WriteOp::Update {
                collection: "users".to_string(),
                id: "u1".to_string(),
                fields: doc(json!({ "isActive": false })),
            },
        ])
        .await?;

    let active = store
        .query("users", &Filter::new().eq("isActive", true))
        .await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].0, "u2");

    store
        .batch_write(vec![WriteOp::delete("users", "u1"), WriteOp::delete("users", "u2")])
        .await?;
    assert!(store.query("users", &Filter::new()).await?.is_empty());

    Ok(())
}

/// Test: Concurrent quota reservations against Redis stop at the limit
#[tokio::test]
#[ignore]
async fn test_quota_transactions_under_contention() -> Result<()> {
    let (store, _container) = redis_store().await?;
    let tracker = QuotaTracker::new(
        Arc::new(store),
        Arc::new(ManualClock::new(Utc::now())),
        QuotaConfig {
            daily_limit: 50,
            mode: ReservationMode::AllOrNothing,
            utc_offset_minutes: 420,
        },
    );

    let results = join_all((0..10).map(|_| tracker.try_reserve(10))).await;
    let granted: u64 = results
        .into_iter()
        .map(|r| r.map(|reservation| reservation.granted))
        .sum::<Result<u64>>()?;

    assert_eq!(granted, 50);
    assert_eq!(tracker.state().await?.count, 50);

    Ok(())
}
