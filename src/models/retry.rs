use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::message::NotificationMessage;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_minutes: u64,
    pub max_delay_minutes: u64,
    pub backoff_multiplier: u64,
    /// Entries processed per worker tick.
    pub batch_limit: usize,
    pub stale_after_hours: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_minutes: 5,
            max_delay_minutes: 300,
            backoff_multiplier: 2,
            batch_limit: 50,
            stale_after_hours: 24,
        }
    }
}

impl RetryConfig {
    /// `min(base * multiplier^attempt_count, cap)` in minutes.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let minutes = self
            .backoff_multiplier
            .checked_pow(attempt_count)
            .and_then(|factor| self.base_delay_minutes.checked_mul(factor))
            .map_or(self.max_delay_minutes, |delay| delay.min(self.max_delay_minutes));

        i64::try_from(minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .unwrap_or(Duration::MAX)
    }

    /// When an entry at `attempt_count` should next be tried.
    pub fn next_attempt_after(&self, now: DateTime<Utc>, attempt_count: u32) -> DateTime<Utc> {
        now.checked_add_signed(self.delay_for_attempt(attempt_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::try_hours(self.stale_after_hours).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Failed,
}

impl RetryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Failed => "failed",
        }
    }
}

/// A message and the tokens that still need it.
///
/// Timestamps are stored as epoch milliseconds so store filters can compare
/// them numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: String,
    pub message: NotificationMessage,
    pub tokens: Vec<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_attempt: Option<DateTime<Utc>>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_attempt: DateTime<Utc>,

    #[serde(default)]
    pub last_error: Option<String>,

    pub status: RetryStatus,

    /// Why the entry was created, e.g. the event it came from.
    #[serde(default)]
    pub reason: String,
}

impl RetryEntry {
    /// A fresh entry counts the original dispatch as its first attempt.
    pub fn new(
        message: NotificationMessage,
        tokens: Vec<String>,
        reason: impl Into<String>,
        config: &RetryConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let attempt_count = 1;

        Self {
            id: Uuid::new_v4().to_string(),
            message,
            tokens,
            attempt_count,
            max_attempts: config.max_attempts,
            created_at: now,
            last_attempt: Some(now),
            next_attempt: config.next_attempt_after(now, attempt_count),
            last_error: None,
            status: RetryStatus::Pending,
            reason: reason.into(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntrySummary {
    pub id: String,
    pub tokens: usize,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub next_attempt: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<&RetryEntry> for RetryEntrySummary {
    fn from(entry: &RetryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            tokens: entry.tokens.len(),
            attempt_count: entry.attempt_count,
            max_attempts: entry.max_attempts,
            status: entry.status,
            created_at: entry.created_at,
            next_attempt: entry.next_attempt,
            last_error: entry.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total_items: usize,
    pub pending_items: usize,
    pub failed_items: usize,
    pub recent_items: Vec<RetryEntrySummary>,
}

/// What one worker pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRunSummary {
    pub skipped_circuit_open: bool,
    pub processed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub failed: usize,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let config = RetryConfig::default();

        let minutes: Vec<i64> = (0..9)
            .map(|k| config.delay_for_attempt(k).num_minutes())
            .collect();

        assert_eq!(minutes, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
    }

    #[test]
    fn test_delay_saturates_on_overflow() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(200).num_minutes(), 300);
    }

    #[test]
    fn test_new_entry_starts_at_first_attempt() {
        let config = RetryConfig::default();
        let now = Utc::now();
        let entry = RetryEntry::new(
            NotificationMessage::new("t", "b"),
            vec!["tok".to_string()],
            "evt-1",
            &config,
            now,
        );

        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.next_attempt, now + Duration::minutes(10));
        assert_eq!(entry.status, RetryStatus::Pending);
        assert!(!entry.is_exhausted());
    }
}
