use anyhow::Result;
use chrono::Duration;
use push_fanout::{
    clients::{recipients::RECIPIENTS_COLLECTION, store::DocumentStore},
    config::Config,
    models::{
        dead_letter::{REASON_MAX_ATTEMPTS, REASON_STALE},
        message::NotificationMessage,
        retry::RetryStatus,
    },
    services::retry_queue::RETRY_COLLECTION,
};

use crate::support::{harness, harness_with, seed_recipient, test_config, valid_token};

const UNAVAILABLE: &str = "messaging/server-unavailable";

fn message() -> NotificationMessage {
    NotificationMessage::new("Flood · Sukhumvit", "Water rising")
}

/// Test: A failing entry walks the backoff ladder and lands in dead letters
#[tokio::test]
async fn test_entry_is_dead_lettered_after_max_attempts() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();
    let token = valid_token("flaky");
    h.gateway.fail_token(&token, UNAVAILABLE);

    let entry = queue.enqueue(message(), vec![token], "evt-1").await?;
    assert_eq!(entry.attempt_count, 1);
    let max_attempts = entry.max_attempts;

    let mut schedule = vec![entry.next_attempt];
    let mut previous_attempt = entry.attempt_count;

    for _ in 1..max_attempts - 1 {
        h.clock.set(*schedule.last().unwrap());
        let run = queue.process_due().await?;
        assert_eq!(run.rescheduled, 1, "run {run:?}");

        let stored = queue.get(&entry.id).await?.expect("entry still queued");
        assert_eq!(stored.attempt_count, previous_attempt + 1);
        assert_eq!(stored.status, RetryStatus::Pending);
        previous_attempt = stored.attempt_count;
        schedule.push(stored.next_attempt);
    }

    // The last retry exhausts the entry.
    h.clock.set(*schedule.last().unwrap());
    let run = queue.process_due().await?;
    assert_eq!(run.dead_lettered, 1);
    assert!(queue.get(&entry.id).await?.is_none());

    let dead = h
        .service
        .dead_letters()
        .get(&entry.id)
        .await?
        .expect("dead letter recorded");
    assert_eq!(dead.reason, REASON_MAX_ATTEMPTS);
    assert_eq!(dead.entry.attempt_count, max_attempts);

    // Gaps between attempts follow min(5 * 2^k, 300) minutes.
    let gaps: Vec<i64> = schedule
        .windows(2)
        .map(|w| (w[1] - w[0]).num_minutes())
        .collect();
    assert_eq!(gaps, vec![20, 40, 80, 160]);
    assert_eq!((schedule[0] - entry.created_at).num_minutes(), 10);

    Ok(())
}

/// Test: Entries are not retried before they are due
#[tokio::test]
async fn test_entries_wait_for_next_attempt() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();
    let token = valid_token("later");
    h.gateway.fail_token(&token, UNAVAILABLE);

    queue.enqueue(message(), vec![token], "evt-2").await?;

    h.clock.advance(Duration::minutes(9));
    let run = queue.process_due().await?;
    assert_eq!(run.processed, 0);
    assert!(h.gateway.batches().is_empty());

    h.clock.advance(Duration::minutes(1));
    let run = queue.process_due().await?;
    assert_eq!(run.processed, 1);

    Ok(())
}

/// Test: A recovered token completes its entry early
#[tokio::test]
async fn test_entry_deleted_once_tokens_deliver() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();
    let token = valid_token("recovers");

    let entry = queue.enqueue(message(), vec![token], "evt-3").await?;
    h.clock.set(entry.next_attempt);

    let run = queue.process_due().await?;
    assert_eq!(run.completed, 1);
    assert!(queue.get(&entry.id).await?.is_none());
    assert_eq!(h.service.dead_letters().count().await?, 0);

    Ok(())
}

/// Test: Invalid tokens found on retry are purged and dropped from the entry
#[tokio::test]
async fn test_retry_purges_invalid_tokens() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();
    let gone = valid_token("gone");
    let busy = valid_token("busy");

    seed_recipient(h.store.as_ref(), "u-1", None, vec![gone.clone(), valid_token("other")]).await?;
    h.gateway
        .fail_token(&gone, "messaging/registration-token-not-registered");
    h.gateway.fail_token(&busy, UNAVAILABLE);

    let entry = queue
        .enqueue(message(), vec![gone.clone(), busy.clone()], "evt-4")
        .await?;
    h.clock.set(entry.next_attempt);
    queue.process_due().await?;

    let stored = queue.get(&entry.id).await?.expect("entry rescheduled");
    assert_eq!(stored.tokens, vec![busy]);
    assert_eq!(stored.attempt_count, 2);

    let doc = h
        .store
        .get(RECIPIENTS_COLLECTION, "u-1")
        .await?
        .expect("recipient");
    let tokens = doc.get("tokens").and_then(|t| t.as_array()).expect("token list");
    assert_eq!(tokens.len(), 1);
    assert_ne!(tokens[0].as_str(), Some(gone.as_str()));

    Ok(())
}

/// Test: Stale entries are archived and removed
#[tokio::test]
async fn test_stale_sweep_archives_old_entries() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();

    let old = queue
        .enqueue(message(), vec![valid_token("old")], "evt-5")
        .await?;
    h.clock.advance(Duration::hours(20));
    let fresh = queue
        .enqueue(message(), vec![valid_token("fresh")], "evt-6")
        .await?;
    h.clock.advance(Duration::hours(5));

    let removed = queue.sweep_stale().await?;
    assert_eq!(removed, 1);
    assert!(queue.get(&old.id).await?.is_none());
    assert!(queue.get(&fresh.id).await?.is_some());

    let dead = h
        .service
        .dead_letters()
        .get(&old.id)
        .await?
        .expect("stale entry archived");
    assert_eq!(dead.reason, REASON_STALE);

    // Dead letters expire after the retention window.
    h.clock.advance(Duration::days(7) + Duration::seconds(1));
    assert_eq!(h.service.dead_letters().sweep_expired().await?, 1);
    assert_eq!(h.service.dead_letters().count().await?, 0);

    Ok(())
}

/// Test: Queue status counts entries and lists the newest first
#[tokio::test]
async fn test_queue_status_reports_recent_items() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();

    let mut ids = Vec::new();
    for i in 0..12 {
        let entry = queue
            .enqueue(message(), vec![valid_token(&format!("s{i}"))], "evt-status")
            .await?;
        ids.push(entry.id);
        h.clock.advance(Duration::seconds(1));
    }

    let status = h.service.queue_status().await?;
    assert_eq!(status.total_items, 12);
    assert_eq!(status.pending_items, 12);
    assert_eq!(status.failed_items, 0);
    assert_eq!(status.recent_items.len(), 10);
    assert_eq!(status.recent_items[0].id, ids[11]);

    Ok(())
}

/// Test: A failed write after a send never re-delivers to the same tokens
#[tokio::test]
async fn test_failed_delete_after_delivery_does_not_resend() -> Result<()> {
    let h = harness();
    let queue = h.service.retry_queue();
    let token = valid_token("healed");
    h.gateway.fail_token(&token, UNAVAILABLE);

    let entry = queue.enqueue(message(), vec![token.clone()], "evt-8").await?;
    h.gateway.heal_token(&token);
    h.store.fail_deletes(RETRY_COLLECTION, 1);
    h.clock.set(entry.next_attempt);

    let run = queue.process_due().await?;
    assert_eq!(run.errors, 1);

    let stored = queue.get(&entry.id).await?.expect("entry kept after failed delete");
    assert!(stored.tokens.is_empty());
    assert_eq!(stored.attempt_count, entry.attempt_count + 1);
    assert!(stored.next_attempt > entry.next_attempt);

    // Same instant: nothing is due.
    let run = queue.process_due().await?;
    assert_eq!(run.processed, 0);

    // Once due again the entry is cleaned up without another send.
    h.clock.set(stored.next_attempt);
    let run = queue.process_due().await?;
    assert_eq!(run.completed, 1);
    assert!(queue.get(&entry.id).await?.is_none());

    let sends = h.gateway.sent_tokens().iter().filter(|t| **t == token).count();
    assert_eq!(sends, 1);

    Ok(())
}

/// Test: An exhausted entry whose removal fails is archived later without another send
#[tokio::test]
async fn test_failed_delete_after_dead_letter_does_not_resend() -> Result<()> {
    let h = harness_with(Config {
        max_retry_attempts: 2,
        ..test_config()
    });
    let queue = h.service.retry_queue();
    let token = valid_token("doomed");
    h.gateway.fail_token(&token, UNAVAILABLE);

    let entry = queue.enqueue(message(), vec![token.clone()], "evt-9").await?;
    h.store.fail_deletes(RETRY_COLLECTION, 1);
    h.clock.set(entry.next_attempt);

    let run = queue.process_due().await?;
    assert_eq!(run.errors, 1);

    let stored = queue.get(&entry.id).await?.expect("entry kept after failed delete");
    assert_eq!(stored.attempt_count, 2);
    assert!(stored.attempt_count <= stored.max_attempts);

    h.clock.set(stored.next_attempt);
    let run = queue.process_due().await?;
    assert_eq!(run.dead_lettered, 1);
    assert!(queue.get(&entry.id).await?.is_none());
    assert_eq!(h.gateway.sent_tokens(), vec![token]);

    let dead = h
        .service
        .dead_letters()
        .get(&entry.id)
        .await?
        .expect("dead letter recorded");
    assert_eq!(dead.entry.attempt_count, 2);

    Ok(())
}

/// Test: Attempt counts never exceed the configured maximum
#[tokio::test]
async fn test_single_attempt_budget_dead_letters_at_enqueue() -> Result<()> {
    let h = harness_with(Config {
        max_retry_attempts: 1,
        ..test_config()
    });
    let queue = h.service.retry_queue();
    let token = valid_token("once");
    h.gateway.fail_token(&token, UNAVAILABLE);

    let entry = queue.enqueue(message(), vec![token], "evt-10").await?;
    assert!(queue.get(&entry.id).await?.is_none());

    h.clock.advance(Duration::days(1));
    let run = queue.process_due().await?;
    assert_eq!(run.processed, 0);
    assert!(h.gateway.batches().is_empty());

    let dead = h
        .service
        .dead_letters()
        .get(&entry.id)
        .await?
        .expect("dead letter recorded");
    assert_eq!(dead.reason, REASON_MAX_ATTEMPTS);
    assert!(dead.entry.attempt_count <= dead.entry.max_attempts);

    Ok(())
}

/// Test: A zero attempt budget is raised to one
#[tokio::test]
async fn test_zero_attempt_budget_is_clamped() -> Result<()> {
    let h = harness_with(Config {
        max_retry_attempts: 0,
        ..test_config()
    });
    let queue = h.service.retry_queue();

    assert_eq!(queue.config().max_attempts, 1);
    let entry = queue
        .enqueue(message(), vec![valid_token("none")], "evt-11")
        .await?;
    let dead = h
        .service
        .dead_letters()
        .get(&entry.id)
        .await?
        .expect("dead letter recorded");
    assert_eq!(dead.entry.attempt_count, 1);
    assert_eq!(dead.entry.max_attempts, 1);

    Ok(())
}
