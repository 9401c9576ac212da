use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{models::quota::QuotaReservation, services::geo_filter::GeoSelectionStats};

/// The token is stale; purge it and never retry.
pub const INVALID_TOKEN_CODES: &[&str] = &[
    "messaging/invalid-registration-token",
    "messaging/registration-token-not-registered",
    "messaging/invalid-package-name",
];

/// Transient gateway conditions worth another attempt later.
pub const RETRYABLE_CODES: &[&str] = &[
    "messaging/internal-error",
    "messaging/server-unavailable",
    "messaging/timeout",
    "messaging/quota-exceeded",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidToken,
    Retryable,
    Unclassified,
}

impl ErrorClass {
    pub fn classify(code: Option<&str>) -> Self {
        match code {
            Some(code) if INVALID_TOKEN_CODES.contains(&code) => ErrorClass::InvalidToken,
            Some(code) if RETRYABLE_CODES.contains(&code) => ErrorClass::Retryable,
            _ => ErrorClass::Unclassified,
        }
    }
}

/// One message addressed to one device, as handed to the push gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendError {
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SendError>,
}

impl SendResponse {
    pub fn delivered(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(SendError {
                code: Some(code.into()),
                message: message.into(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.code.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub index: usize,
    pub size: usize,
    pub sent: usize,
    pub failed: usize,
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub sent_count: usize,
    pub failed_count: usize,
    pub invalid_tokens: Vec<String>,
    pub retryable_tokens: Vec<String>,
    pub unclassified_tokens: Vec<String>,
    pub batches: Vec<BatchReport>,
    pub success_rate: f64,
    pub total_duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_entry_id: Option<String>,

    /// Set when the retryable tokens could not be queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MaintenanceMode,
    CircuitOpen,
    QuotaExceeded,
    NoRecipients,
    SelfNotification,
    RecipientNotFound,
}

impl SkipReason {
    pub fn as_str(&self) -> &str {
        match self {
            SkipReason::MaintenanceMode => "maintenance_mode",
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::QuotaExceeded => "quota_exceeded",
            SkipReason::NoRecipients => "no_recipients",
            SkipReason::SelfNotification => "self_notification",
            SkipReason::RecipientNotFound => "recipient_not_found",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    Skipped(SkipReason),
}

/// Outcome of one event trigger.
///
/// Backpressure (maintenance, open breaker, spent quota) is reported here as
/// `Skipped` rather than as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub event_id: String,
    pub status: DispatchStatus,
    pub candidates: usize,
    pub selected_tokens: usize,
    pub users_without_valid_token: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoSelectionStats>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaReservation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DispatchReport>,
}

impl DispatchResult {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            status: DispatchStatus::Sent,
            candidates: 0,
            selected_tokens: 0,
            users_without_valid_token: 0,
            geo: None,
            quota: None,
            report: None,
        }
    }

    pub fn skipped(mut self, reason: SkipReason) -> Self {
        self.status = DispatchStatus::Skipped(reason);
        self
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.status {
            DispatchStatus::Skipped(reason) => Some(reason),
            DispatchStatus::Sent => None,
        }
    }

    pub fn sent_count(&self) -> usize {
        self.report.as_ref().map_or(0, |r| r.sent_count)
    }
}
