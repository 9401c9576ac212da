use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::retry::RetryEntry;

pub const REASON_MAX_ATTEMPTS: &str = "max_attempts_exceeded";
pub const REASON_STALE: &str = "stale";
pub const REASON_UNCLASSIFIED: &str = "unclassified_error";
pub const REASON_ENQUEUE_FAILED: &str = "enqueue_failed";

/// Terminal record of an abandoned retry entry, kept for postmortems only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub entry: RetryEntry,
    pub reason: String,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}
