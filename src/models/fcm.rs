use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmRequest {
    pub message: FcmMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmMessage {
    pub token: String,
    pub notification: FcmNotification,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmNotification {
    pub title: String,
    pub body: String,
}

/// Successful `messages:send` reply; `name` is the message resource id.
#[derive(Debug, Clone, Deserialize)]
pub struct FcmSendResponse {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcmErrorResponse {
    pub error: FcmErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcmErrorBody {
    #[serde(default)]
    pub code: u16,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub details: Vec<FcmErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcmErrorDetail {
    #[serde(rename = "@type", default)]
    pub type_url: String,

    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,
}

impl FcmErrorBody {
    /// The FCM-specific `errorCode` when present, else the RPC status.
    pub fn fcm_error_code(&self) -> &str {
        self.details
            .iter()
            .find_map(|detail| detail.error_code.as_deref())
            .unwrap_or(&self.status)
    }

    /// Maps the HTTP v1 error onto the `messaging/*` codes used for classification.
    pub fn classification_code(&self) -> &'static str {
        match self.fcm_error_code() {
            "UNREGISTERED" | "NOT_FOUND" => "messaging/registration-token-not-registered",
            "INVALID_ARGUMENT" if self.message.contains("registration token") => {
                "messaging/invalid-registration-token"
            }
            "INVALID_ARGUMENT" => "messaging/invalid-argument",
            "SENDER_ID_MISMATCH" => "messaging/mismatched-credential",
            "QUOTA_EXCEEDED" | "RESOURCE_EXHAUSTED" => "messaging/quota-exceeded",
            "UNAVAILABLE" => "messaging/server-unavailable",
            "INTERNAL" => "messaging/internal-error",
            "DEADLINE_EXCEEDED" => "messaging/timeout",
            "THIRD_PARTY_AUTH_ERROR" => "messaging/third-party-auth-error",
            _ => status_classification_code(self.code),
        }
    }
}

/// Fallback when the body carries no recognisable status.
pub fn status_classification_code(http_status: u16) -> &'static str {
    match http_status {
        404 => "messaging/registration-token-not-registered",
        429 => "messaging/quota-exceeded",
        500 => "messaging/internal-error",
        502..=504 => "messaging/server-unavailable",
        _ => "messaging/unknown-error",
    }
}
