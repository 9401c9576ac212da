use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::models::dispatch::{OutboundMessage, SendResponse};

/// Delivers messages to devices.
///
/// `send_batch` answers one [`SendResponse`] per message, in order. An `Err`
/// means the whole batch failed in transport.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<SendResponse>, Error>;
}

/// Logs instead of sending; used when no push project is configured.
#[derive(Debug, Default)]
pub struct DryRunGateway;

#[async_trait]
impl PushGateway for DryRunGateway {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<SendResponse>, Error> {
        info!(messages = messages.len(), "Dry run: push batch not sent");

        Ok(messages
            .iter()
            .map(|_| SendResponse::delivered(format!("dry-run/{}", Uuid::new_v4())))
            .collect())
    }
}
