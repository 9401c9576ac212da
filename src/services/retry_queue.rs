use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        clock::Clock,
        dead_letter::DeadLetterSink,
        recipients::RecipientStore,
        store::{
            Direction, DocumentStore, Filter, WriteOp, commit_in_chunks, from_document,
            to_document,
        },
    },
    models::{
        dead_letter::{
            REASON_ENQUEUE_FAILED, REASON_MAX_ATTEMPTS, REASON_STALE, REASON_UNCLASSIFIED,
        },
        message::NotificationMessage,
        retry::{
            QueueStatus, RetryConfig, RetryEntry, RetryEntrySummary, RetryRunSummary, RetryStatus,
        },
    },
    services::dispatcher::BatchSender,
};

pub const RETRY_COLLECTION: &str = "notification_retry_queue";

const RECENT_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    /// Nothing left to retry; the entry was deleted.
    Completed,
    Rescheduled,
    DeadLettered,
    /// Exhausted but the dead-letter write failed; kept with status `failed`.
    Failed,
}

/// Durable queue of tokens that failed with a retryable error.
pub struct RetryQueue {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    sender: Arc<BatchSender>,
    breaker: Arc<CircuitBreaker>,
    recipients: Arc<RecipientStore>,
    dead_letters: Arc<DeadLetterSink>,
    config: RetryConfig,
    dead_letter_unclassified: bool,
}

impl RetryQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        sender: Arc<BatchSender>,
        breaker: Arc<CircuitBreaker>,
        recipients: Arc<RecipientStore>,
        dead_letters: Arc<DeadLetterSink>,
        config: RetryConfig,
        dead_letter_unclassified: bool,
    ) -> Self {
        Self {
            store,
            clock,
            sender,
            breaker,
            recipients,
            dead_letters,
            config,
            dead_letter_unclassified,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Queues `tokens` for retry. When the configured attempts leave no
    /// room for a retry the entry goes straight to the dead-letter sink.
    pub async fn enqueue(
        &self,
        message: NotificationMessage,
        tokens: Vec<String>,
        reason: &str,
    ) -> Result<RetryEntry, Error> {
        let entry = RetryEntry::new(message, tokens, reason, &self.config, self.clock.now());

        // The first dispatch already used the whole budget.
        if entry.is_exhausted() {
            self.dead_letters
                .record(&entry, REASON_MAX_ATTEMPTS, Some("No retry attempts allowed"))
                .await?;
            info!(
                entry_id = %entry.id,
                reason,
                tokens = entry.tokens.len(),
                "Retry budget exhausted at enqueue, tokens dead-lettered"
            );
            return Ok(entry);
        }

        self.save(&entry).await?;

        info!(
            entry_id = %entry.id,
            reason,
            tokens = entry.tokens.len(),
            next_attempt = %entry.next_attempt,
            "Retry entry queued"
        );

        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Result<Option<RetryEntry>, Error> {
        self.store
            .get(RETRY_COLLECTION, id)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn save(&self, entry: &RetryEntry) -> Result<(), Error> {
        self.store
            .set(RETRY_COLLECTION, &entry.id, to_document(entry)?)
            .await
    }

    async fn load(&self, filter: Filter) -> Result<Vec<RetryEntry>, Error> {
        let docs = self.store.query(RETRY_COLLECTION, &filter).await?;

        Ok(docs
            .into_iter()
            .filter_map(|(id, doc)| match from_document::<RetryEntry>(doc) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "Skipping unreadable retry entry");
                    None
                }
            })
            .collect())
    }

    /// Pending entries whose `next_attempt` has passed, earliest first.
    pub async fn due_entries(&self, limit: usize) -> Result<Vec<RetryEntry>, Error> {
        let now_ms = self.clock.now().timestamp_millis();
        self.load(
            Filter::new()
                .eq("status", RetryStatus::Pending.as_str())
                .le("next_attempt", now_ms)
                .order_by("next_attempt", Direction::Ascending)
                .limit(limit),
        )
        .await
    }

    /// One worker tick: retries up to `batch_limit` due entries concurrently.
    ///
    /// Does nothing while the breaker is open.
    pub async fn process_due(&self) -> Result<RetryRunSummary, Error> {
        if self.breaker.is_open() {
            info!("Circuit breaker open, retry worker skipping this run");
            return Ok(RetryRunSummary {
                skipped_circuit_open: true,
                ..Default::default()
            });
        }

        let entries = self.due_entries(self.config.batch_limit).await?;
        Ok(self.process_entries(entries).await)
    }

    /// Retries every pending entry once, regardless of its schedule.
    pub async fn flush(&self) -> Result<RetryRunSummary, Error> {
        if self.breaker.is_open() {
            warn!("Circuit breaker open, retry queue flush skipped");
            return Ok(RetryRunSummary {
                skipped_circuit_open: true,
                ..Default::default()
            });
        }

        let entries = self
            .load(
                Filter::new()
                    .eq("status", RetryStatus::Pending.as_str())
                    .order_by("next_attempt", Direction::Ascending),
            )
            .await?;

        info!(entries = entries.len(), "Flushing retry queue");
        Ok(self.process_entries(entries).await)
    }

    async fn process_entries(&self, entries: Vec<RetryEntry>) -> RetryRunSummary {
        let mut summary = RetryRunSummary {
            processed: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return summary;
        }

        let outcomes = join_all(entries.into_iter().map(|entry| self.process_entry(entry))).await;

        for outcome in outcomes {
            match outcome {
                Some(EntryOutcome::Completed) => summary.completed += 1,
                Some(EntryOutcome::Rescheduled) => summary.rescheduled += 1,
                Some(EntryOutcome::DeadLettered) => summary.dead_lettered += 1,
                Some(EntryOutcome::Failed) => summary.failed += 1,
                None => summary.errors += 1,
            }
        }

        info!(
            processed = summary.processed,
            completed = summary.completed,
            rescheduled = summary.rescheduled,
            dead_lettered = summary.dead_lettered,
            errors = summary.errors,
            "Retry run finished"
        );

        summary
    }

    /// `retry_entry` applies the post-send state to `entry` before touching
    /// the store, so a failed write persists that state instead of the
    /// pre-send one and delivered tokens are never sent again.
    async fn process_entry(&self, mut entry: RetryEntry) -> Option<EntryOutcome> {
        match self.retry_entry(&mut entry).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "Retry entry processing failed");

                entry.last_error = Some(e.to_string());
                if let Err(save_err) = self.save(&entry).await {
                    warn!(entry_id = %entry.id, error = %save_err, "Failed to record retry error");
                }
                None
            }
        }
    }

    async fn retry_entry(&self, entry: &mut RetryEntry) -> Result<EntryOutcome, Error> {
        if entry.tokens.is_empty() {
            self.store.delete(RETRY_COLLECTION, &entry.id).await?;
            return Ok(EntryOutcome::Completed);
        }
        if entry.is_exhausted() {
            return self.exhaust(entry).await;
        }

        let now = self.clock.now();
        let summary = self.sender.send(&entry.message, &entry.tokens).await;

        entry.last_attempt = Some(now);
        entry.attempt_count += 1;
        entry.next_attempt = self.config.next_attempt_after(now, entry.attempt_count);
        entry.tokens = summary.retryable.clone();
        entry.last_error = (!entry.tokens.is_empty()).then(|| {
            format!(
                "{} token(s) failed on attempt {}",
                entry.tokens.len(),
                entry.attempt_count
            )
        });

        if !summary.invalid.is_empty()
            && let Err(e) = self.recipients.purge_tokens(&summary.invalid).await
        {
            warn!(entry_id = %entry.id, error = %e, "Failed to purge invalid tokens");
        }

        if !summary.unclassified.is_empty() {
            self.archive_unclassified(&entry.reason, &entry.message, &summary.unclassified)
                .await;
        }

        if entry.tokens.is_empty() {
            self.store.delete(RETRY_COLLECTION, &entry.id).await?;
            debug!(
                entry_id = %entry.id,
                delivered = summary.delivered.len(),
                purged = summary.invalid.len(),
                "Retry entry completed"
            );
            return Ok(EntryOutcome::Completed);
        }

        if entry.is_exhausted() {
            return self.exhaust(entry).await;
        }

        self.save(entry).await?;

        info!(
            entry_id = %entry.id,
            attempt = entry.attempt_count,
            max_attempts = entry.max_attempts,
            tokens = entry.tokens.len(),
            next_attempt = %entry.next_attempt,
            "Retry entry rescheduled"
        );

        Ok(EntryOutcome::Rescheduled)
    }

    /// Moves an entry with no attempts left to the dead-letter sink.
    ///
    /// A failed dead-letter write keeps the entry with status `failed`.
    async fn exhaust(&self, entry: &mut RetryEntry) -> Result<EntryOutcome, Error> {
        let error = format!(
            "{} token(s) still failing after {} attempts",
            entry.tokens.len(),
            entry.attempt_count
        );
        entry.last_error = Some(error.clone());

        match self
            .dead_letters
            .record(entry, REASON_MAX_ATTEMPTS, Some(&error))
            .await
        {
            Ok(_) => {
                self.store.delete(RETRY_COLLECTION, &entry.id).await?;
                Ok(EntryOutcome::DeadLettered)
            }
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "Dead letter write failed, marking entry failed");
                entry.status = RetryStatus::Failed;
                self.save(entry).await?;
                Ok(EntryOutcome::Failed)
            }
        }
    }

    /// Archives tokens that could not be queued, so they are not lost silently.
    pub async fn archive_unqueued(
        &self,
        source: &str,
        message: &NotificationMessage,
        tokens: &[String],
        error: &str,
    ) -> Result<(), Error> {
        let entry = RetryEntry::new(
            message.clone(),
            tokens.to_vec(),
            source,
            &self.config,
            self.clock.now(),
        );
        self.dead_letters
            .record(&entry, REASON_ENQUEUE_FAILED, Some(error))
            .await?;
        Ok(())
    }

    /// Records tokens that failed with an unknown error code, or just logs
    /// them when archiving is disabled.
    pub async fn archive_unclassified(
        &self,
        source: &str,
        message: &NotificationMessage,
        tokens: &[String],
    ) {
        if !self.dead_letter_unclassified {
            warn!(source, tokens = tokens.len(), "Dropping tokens with unclassified errors");
            return;
        }

        let entry = RetryEntry::new(
            message.clone(),
            tokens.to_vec(),
            source,
            &self.config,
            self.clock.now(),
        );
        if let Err(e) = self
            .dead_letters
            .record(&entry, REASON_UNCLASSIFIED, Some("Unclassified push error"))
            .await
        {
            error!(source, error = %e, "Failed to record unclassified tokens");
        }
    }

    /// Removes entries older than the stale age whatever their status,
    /// archiving the pending ones first.
    pub async fn sweep_stale(&self) -> Result<usize, Error> {
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(self.config.stale_after())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self
            .load(Filter::new().lt("created_at", cutoff.timestamp_millis()))
            .await?;

        if stale.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(stale.len());
        for entry in &stale {
            if entry.status == RetryStatus::Pending
                && let Err(e) = self
                    .dead_letters
                    .record(entry, REASON_STALE, entry.last_error.as_deref())
                    .await
            {
                warn!(entry_id = %entry.id, error = %e, "Failed to archive stale entry");
            }
            ops.push(WriteOp::delete(RETRY_COLLECTION, entry.id.clone()));
        }

        let deleted = commit_in_chunks(self.store.as_ref(), ops).await?;
        info!(deleted, "Stale retry entries removed");

        Ok(deleted)
    }

    pub async fn status(&self) -> Result<QueueStatus, Error> {
        let mut entries = self.load(Filter::new()).await?;

        let pending_items = entries
            .iter()
            .filter(|e| e.status == RetryStatus::Pending)
            .count();
        let failed_items = entries.len() - pending_items;

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(QueueStatus {
            total_items: entries.len(),
            pending_items,
            failed_items,
            recent_items: entries
                .iter()
                .take(RECENT_ITEMS)
                .map(RetryEntrySummary::from)
                .collect(),
        })
    }
}
