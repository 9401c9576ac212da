use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use push_fanout::{
    clients::{
        cache::{CacheConfig, TtlCache},
        circuit_breaker::CircuitBreaker,
        clock::{Clock, ManualClock},
        dead_letter::{DEAD_LETTER_COLLECTION, DeadLetterSink},
        recipients::{RECIPIENTS_COLLECTION, RecipientStore},
        store::{DocumentStore, Filter},
    },
    models::{
        circuit_breaker::CircuitBreakerConfig,
        dead_letter::{REASON_ENQUEUE_FAILED, REASON_UNCLASSIFIED},
        message::NotificationMessage, retry::RetryConfig,
    },
    services::{
        dispatcher::{BatchSender, DispatchConfig, Dispatcher},
        retry_queue::{RETRY_COLLECTION, RetryQueue},
    },
};
use serde_json::Value;
use tokio::time::Instant;

use crate::support::{ScriptedGateway, ScriptedStore, seed_recipient, valid_token};

struct Rig {
    store: Arc<ScriptedStore>,
    gateway: Arc<ScriptedGateway>,
    breaker: Arc<CircuitBreaker>,
    dead_letters: Arc<DeadLetterSink>,
    retry_queue: Arc<RetryQueue>,
    dispatcher: Dispatcher,
}

fn rig(dispatch: DispatchConfig) -> Rig {
    let store = ScriptedStore::new();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let gateway = ScriptedGateway::new();
    let breaker = Arc::new(CircuitBreaker::new(
        "push_gateway".to_string(),
        CircuitBreakerConfig::default(),
        clock.clone(),
    ));

    let cache_config = CacheConfig {
        ttl_seconds: 300,
        capacity: 100,
    };
    let recipients = Arc::new(RecipientStore::new(
        store.clone(),
        Arc::new(TtlCache::new("recipients", cache_config.clone(), clock.clone())),
        Arc::new(TtlCache::new("entities", cache_config, clock.clone())),
    ));
    let dead_letters = Arc::new(DeadLetterSink::new(store.clone(), clock.clone(), 7));
    let sender = Arc::new(BatchSender::new(gateway.clone(), breaker.clone(), &dispatch));

    let retry_queue = Arc::new(RetryQueue::new(
        store.clone(),
        clock,
        sender.clone(),
        breaker.clone(),
        recipients.clone(),
        dead_letters.clone(),
        RetryConfig::default(),
        true,
    ));
    let dispatcher = Dispatcher::new(sender, recipients, retry_queue.clone());

    Rig {
        store,
        gateway,
        breaker,
        dead_letters,
        retry_queue,
        dispatcher,
    }
}

fn message() -> NotificationMessage {
    NotificationMessage::new("Flood · Sukhumvit", "Water rising").with_data("type", "new_post")
}

/// Test: 120 tokens at batch size 100 go out as 100 + 20 with one pause between
#[tokio::test(start_paused = true)]
async fn test_batches_split_with_inter_batch_delay() -> Result<()> {
    let rig = rig(DispatchConfig {
        batch_size: 100,
        inter_batch_delay: Duration::from_millis(1000),
    });
    let tokens: Vec<String> = (0..120).map(|i| valid_token(&format!("d{i}"))).collect();

    let started = Instant::now();
    let report = rig.dispatcher.dispatch("evt-120", &message(), tokens).await;
    let elapsed = started.elapsed();

    let sizes: Vec<usize> = rig.gateway.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![100, 20]);
    assert_eq!(report.batches.len(), 2);
    assert_eq!(report.sent_count, 120);
    assert_eq!(report.success_rate, 1.0);

    assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "no pause after the last batch");

    Ok(())
}

/// Test: Each failure class is routed to its own follow-up
#[tokio::test]
async fn test_failures_are_routed_by_class() -> Result<()> {
    let rig = rig(DispatchConfig {
        batch_size: 100,
        inter_batch_delay: Duration::ZERO,
    });

    let delivered = valid_token("ok");
    let stale = valid_token("stale");
    let busy = valid_token("busy");
    let weird = valid_token("weird");

    seed_recipient(rig.store.as_ref(), "u-stale", None, vec![stale.clone()]).await?;
    rig.gateway
        .fail_token(&stale, "messaging/registration-token-not-registered");
    rig.gateway.fail_token(&busy, "messaging/server-unavailable");
    rig.gateway.fail_token(&weird, "messaging/mismatched-credential");

    let report = rig
        .dispatcher
        .dispatch(
            "evt-mixed",
            &message(),
            vec![delivered, stale.clone(), busy.clone(), weird.clone()],
        )
        .await;

    assert_eq!(report.sent_count, 1);
    assert_eq!(report.failed_count, 3);
    assert_eq!(report.invalid_tokens, vec![stale]);
    assert_eq!(report.retryable_tokens, vec![busy.clone()]);
    assert_eq!(report.unclassified_tokens, vec![weird.clone()]);
    assert_eq!(report.success_rate, 0.25);

    let doc = rig
        .store
        .get(RECIPIENTS_COLLECTION, "u-stale")
        .await?
        .expect("recipient document");
    assert_eq!(doc.get("isActive"), Some(&Value::Bool(false)));

    let entry_id = report.retry_entry_id.expect("retry entry queued");
    let entry = rig.retry_queue.get(&entry_id).await?.expect("entry stored");
    assert_eq!(entry.tokens, vec![busy]);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.reason, "evt-mixed");

    assert_eq!(rig.dead_letters.count().await?, 1);
    let status = rig.retry_queue.status().await?;
    assert_eq!(status.total_items, 1);

    Ok(())
}

/// Test: A transport failure fails its batch only and feeds the breaker
#[tokio::test]
async fn test_transport_failure_marks_batch_retryable() -> Result<()> {
    let rig = rig(DispatchConfig {
        batch_size: 2,
        inter_batch_delay: Duration::ZERO,
    });
    rig.gateway.set_transport_down(true);

    let tokens = vec![valid_token("a"), valid_token("b"), valid_token("c")];
    let report = rig.dispatcher.dispatch("evt-down", &message(), tokens.clone()).await;

    assert_eq!(report.batches.len(), 2);
    assert!(report.batches.iter().all(|b| b.transport_error.is_some()));
    assert_eq!(report.sent_count, 0);
    assert_eq!(report.retryable_tokens, tokens);
    assert!(rig.breaker.is_open());

    Ok(())
}

/// Test: Unclassified errors are archived with their own reason
#[tokio::test]
async fn test_unclassified_tokens_reach_dead_letters() -> Result<()> {
    let rig = rig(DispatchConfig::default());
    let weird = valid_token("weird");
    rig.gateway.fail_token(&weird, "messaging/third-party-auth-error");

    let report = rig
        .dispatcher
        .dispatch("evt-weird", &message(), vec![weird.clone()])
        .await;

    assert!(report.retry_entry_id.is_none());
    assert_eq!(rig.retry_queue.status().await?.total_items, 0);

    let dead = rig
        .store
        .query(DEAD_LETTER_COLLECTION, &Filter::new())
        .await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].1.get("reason"),
        Some(&Value::String(REASON_UNCLASSIFIED.to_string()))
    );

    Ok(())
}

/// Test: Retryable tokens that cannot be queued are archived and reported
#[tokio::test]
async fn test_failed_enqueue_is_archived_and_reported() -> Result<()> {
    let rig = rig(DispatchConfig::default());
    let busy = valid_token("busy");
    rig.gateway.fail_token(&busy, "messaging/server-unavailable");
    rig.store.fail_sets(RETRY_COLLECTION, 1);

    let report = rig
        .dispatcher
        .dispatch("evt-lost", &message(), vec![busy.clone()])
        .await;

    assert!(report.retry_entry_id.is_none());
    assert!(report.retry_error.is_some());
    assert_eq!(report.retryable_tokens, vec![busy.clone()]);
    assert_eq!(rig.retry_queue.status().await?.total_items, 0);

    let dead = rig
        .store
        .query(DEAD_LETTER_COLLECTION, &Filter::new())
        .await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].1.get("reason"),
        Some(&Value::String(REASON_ENQUEUE_FAILED.to_string()))
    );
    assert_eq!(
        dead[0].1["entry"]["tokens"],
        serde_json::json!([busy])
    );

    Ok(())
}
