use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::future::join_all;
use gcp_auth::TokenProvider;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::{
    clients::gateway::PushGateway,
    config::Config,
    models::{
        dispatch::{OutboundMessage, SendResponse},
        fcm::{
            FcmErrorResponse, FcmMessage, FcmNotification, FcmRequest, FcmSendResponse,
            status_classification_code,
        },
    },
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];
pub const DEFAULT_FCM_BASE_URL: &str = "https://fcm.googleapis.com";

/// FCM HTTP v1 gateway. Each message in a batch is its own request, sent concurrently.
pub struct FcmGateway {
    http_client: Client,
    project_id: String,
    base_url: String,
    auth: Option<Arc<dyn TokenProvider>>,
    request_timeout: Duration,
}

impl FcmGateway {
    pub async fn new(config: &Config, project_id: &str) -> Result<Self, Error> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|e| anyhow!("Failed to load Google credentials: {}", e))?;

        info!(project_id = %project_id, "FCM gateway initialized");

        Ok(Self::with_base_url(
            project_id,
            config
                .fcm_base_url
                .as_deref()
                .unwrap_or(DEFAULT_FCM_BASE_URL),
            Some(provider),
        )
        .with_request_timeout(Duration::from_millis(config.fcm_request_timeout_ms)))
    }

    /// Gateway against an arbitrary endpoint; without `auth` no bearer token is sent.
    pub fn with_base_url(
        project_id: &str,
        base_url: &str,
        auth: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            http_client: Client::new(),
            project_id: project_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url, self.project_id
        )
    }

    async fn send_one(
        &self,
        url: &str,
        bearer: Option<&str>,
        message: &OutboundMessage,
    ) -> SendResponse {
        let request = FcmRequest {
            message: FcmMessage {
                token: message.token.clone(),
                notification: FcmNotification {
                    title: message.title.clone(),
                    body: message.body.clone(),
                },
                data: (!message.data.is_empty()).then(|| message.data.clone()),
            },
        };

        let mut builder = self
            .http_client
            .post(url)
            .timeout(self.request_timeout)
            .json(&request);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return SendResponse::failed("messaging/timeout", e.to_string());
            }
            Err(e) if e.is_connect() => {
                return SendResponse::failed("messaging/server-unavailable", e.to_string());
            }
            Err(e) => return SendResponse::failed("messaging/unknown-error", e.to_string()),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return SendResponse::failed("messaging/internal-error", e.to_string()),
        };

        if status.is_success() {
            return match serde_json::from_str::<FcmSendResponse>(&body) {
                Ok(sent) => SendResponse::delivered(sent.name),
                Err(_) => SendResponse::delivered(String::new()),
            };
        }

        match serde_json::from_str::<FcmErrorResponse>(&body) {
            Ok(error) => {
                let code = error.error.classification_code();
                debug!(status = %status, code, fcm_status = %error.error.status, "FCM rejected message");
                SendResponse::failed(code, error.error.message)
            }
            Err(_) => SendResponse::failed(status_classification_code(status.as_u16()), body),
        }
    }
}

#[async_trait]
impl PushGateway for FcmGateway {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<SendResponse>, Error> {
        let bearer = match &self.auth {
            Some(provider) => Some(
                provider
                    .token(FCM_SCOPES)
                    .await
                    .map_err(|e| anyhow!("Failed to obtain FCM access token: {}", e))?,
            ),
            None => None,
        };
        let bearer = bearer.as_ref().map(|token| token.as_str());

        let url = self.send_url();
        let responses = join_all(
            messages
                .iter()
                .map(|message| self.send_one(&url, bearer, message)),
        )
        .await;

        let failed = responses.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!(messages = messages.len(), failed, "FCM batch completed with failures");
        } else {
            debug!(messages = messages.len(), "FCM batch delivered");
        }

        Ok(responses)
    }
}
