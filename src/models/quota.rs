use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationMode {
    /// Reject the whole request when it does not fit.
    AllOrNothing,
    /// Grant whatever is left of today's allowance.
    AllowPartial,
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub daily_limit: u64,
    pub mode: ReservationMode,
    /// Offset of the calendar day boundary from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10_000,
            mode: ReservationMode::AllowPartial,
            utc_offset_minutes: 7 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReservation {
    pub allowed: bool,
    pub requested: u64,
    pub granted: u64,
    pub current_count: u64,
    pub remaining: u64,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub date: String,
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Stored row, one per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyQuotaCounter {
    pub date: String,
    pub count: u64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}
