use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::{
    clients::{
        clock::Clock,
        store::{DocumentStore, Filter, WriteOp, commit_in_chunks, from_document, to_document},
    },
    models::{dead_letter::DeadLetterEntry, retry::RetryEntry},
};

pub const DEAD_LETTER_COLLECTION: &str = "notification_dead_letters";

/// Write-once archive of abandoned retry entries.
pub struct DeadLetterSink {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl DeadLetterSink {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, retention_days: i64) -> Self {
        Self {
            store,
            clock,
            retention: Duration::try_days(retention_days).unwrap_or(Duration::MAX),
        }
    }

    /// Archives `entry`. Recording the same id twice keeps the first record.
    pub async fn record(
        &self,
        entry: &RetryEntry,
        reason: &str,
        error: Option<&str>,
    ) -> Result<DeadLetterEntry, Error> {
        let now = self.clock.now();
        let dead_letter = DeadLetterEntry {
            id: entry.id.clone(),
            entry: entry.clone(),
            reason: reason.to_string(),
            error: error.map(str::to_string),
            failed_at: now,
            expires_at: now
                .checked_add_signed(self.retention)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let doc = to_document(&dead_letter)?;

        let outcome = self
            .store
            .transaction(DEAD_LETTER_COLLECTION, &dead_letter.id, &|current| {
                Ok(current.is_none().then(|| doc.clone()))
            })
            .await?;

        match outcome.previous {
            Some(existing) => {
                warn!(entry_id = %entry.id, "Dead letter already recorded, keeping original");
                from_document(existing)
            }
            None => {
                info!(
                    entry_id = %entry.id,
                    reason,
                    tokens = entry.tokens.len(),
                    attempts = entry.attempt_count,
                    "Entry moved to dead letters"
                );
                Ok(dead_letter)
            }
        }
    }

    /// Deletes entries past their retention. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, Error> {
        let now_ms = self.clock.now().timestamp_millis();
        let expired = self
            .store
            .query(DEAD_LETTER_COLLECTION, &Filter::new().lt("expires_at", now_ms))
            .await?;

        let ops: Vec<WriteOp> = expired
            .into_iter()
            .map(|(id, _)| WriteOp::delete(DEAD_LETTER_COLLECTION, id))
            .collect();

        let deleted = commit_in_chunks(self.store.as_ref(), ops).await?;
        if deleted > 0 {
            info!(deleted, "Expired dead letters removed");
        }

        Ok(deleted)
    }

    pub async fn count(&self) -> Result<usize, Error> {
        Ok(self
            .store
            .query(DEAD_LETTER_COLLECTION, &Filter::new())
            .await?
            .len())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>, Error> {
        self.store
            .get(DEAD_LETTER_COLLECTION, id)
            .await?
            .map(from_document)
            .transpose()
    }
}
