use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    clients::{
        clock::Clock,
        store::{Document, DocumentStore, to_document},
    },
    models::quota::{DailyQuotaCounter, QuotaConfig, QuotaReservation, QuotaState, ReservationMode},
};

pub const QUOTA_COLLECTION: &str = "daily_quota_counters";

fn stored_count(doc: Option<&Document>) -> u64 {
    doc.and_then(|d| d.get("count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Daily send allowance, one counter document per calendar date.
pub struct QuotaTracker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: QuotaConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// `YYYY-MM-DD` in the configured timezone.
    pub fn date_key(&self) -> String {
        let offset = FixedOffset::east_opt(self.config.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        self.clock
            .now()
            .with_timezone(&offset)
            .format("%Y-%m-%d")
            .to_string()
    }

    pub async fn try_reserve(&self, n: u64) -> Result<QuotaReservation, Error> {
        self.try_reserve_with(n, self.config.mode).await
    }

    /// Transactionally adds up to `n` to today's counter.
    ///
    /// Store failures propagate: an unreserved quota must not turn into
    /// unmetered sending.
    pub async fn try_reserve_with(
        &self,
        n: u64,
        mode: ReservationMode,
    ) -> Result<QuotaReservation, Error> {
        let date = self.date_key();
        let limit = self.config.daily_limit;

        if n == 0 {
            let state = self.state().await?;
            return Ok(QuotaReservation {
                allowed: true,
                requested: 0,
                granted: 0,
                current_count: state.count,
                remaining: state.remaining,
                date,
            });
        }

        let now = self.clock.now();
        let outcome = self
            .store
            .transaction(QUOTA_COLLECTION, &date, &|current| {
                let count = stored_count(current);
                let remaining = limit.saturating_sub(count);

                let granted = match mode {
                    ReservationMode::AllOrNothing if n <= remaining => n,
                    ReservationMode::AllOrNothing => 0,
                    ReservationMode::AllowPartial => n.min(remaining),
                };

                if granted == 0 {
                    return Ok(None);
                }

                let counter = DailyQuotaCounter {
                    date: date.clone(),
                    count: count + granted,
                    updated_at: now,
                };
                Ok(Some(to_document(&counter)?))
            })
            .await?;

        let previous = stored_count(outcome.previous.as_ref());
        let current_count = outcome
            .written
            .as_ref()
            .map_or(previous, |doc| stored_count(Some(doc)));
        let granted = current_count - previous;
        let remaining = limit.saturating_sub(current_count);

        if granted == 0 {
            warn!(date = %date, requested = n, current_count, limit, "Daily quota exhausted");
        } else if granted < n {
            info!(date = %date, requested = n, granted, remaining, "Partial quota granted");
        }

        Ok(QuotaReservation {
            allowed: granted > 0,
            requested: n,
            granted,
            current_count,
            remaining,
            date,
        })
    }

    pub async fn state(&self) -> Result<QuotaState, Error> {
        let date = self.date_key();
        let doc = self.store.get(QUOTA_COLLECTION, &date).await?;
        let count = stored_count(doc.as_ref());

        Ok(QuotaState {
            remaining: self.config.daily_limit.saturating_sub(count),
            limit: self.config.daily_limit,
            count,
            date,
        })
    }
}
