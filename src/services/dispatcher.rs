use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker, gateway::PushGateway, recipients::RecipientStore,
    },
    models::{
        dispatch::{BatchReport, DispatchReport, ErrorClass, SendResponse},
        message::NotificationMessage,
    },
    services::retry_queue::RetryQueue,
};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            inter_batch_delay: Duration::from_millis(1000),
        }
    }
}

/// Per-token results of one send, already sorted by error class.
#[derive(Debug, Clone, Default)]
pub struct SendSummary {
    pub batches: Vec<BatchReport>,
    pub delivered: Vec<String>,
    pub invalid: Vec<String>,
    pub retryable: Vec<String>,
    pub unclassified: Vec<String>,
    pub duration_ms: u64,
}

impl SendSummary {
    pub fn failed_count(&self) -> usize {
        self.invalid.len() + self.retryable.len() + self.unclassified.len()
    }
}

/// The send primitive shared by first dispatch and retries.
///
/// Sends in sequential batches and feeds one outcome per batch to the
/// breaker. It never fails as a whole: a batch the transport rejects is
/// reported with all of its tokens retryable.
pub struct BatchSender {
    gateway: Arc<dyn PushGateway>,
    breaker: Arc<CircuitBreaker>,
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl BatchSender {
    pub fn new(
        gateway: Arc<dyn PushGateway>,
        breaker: Arc<CircuitBreaker>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            gateway,
            breaker,
            batch_size: config.batch_size.max(1),
            inter_batch_delay: config.inter_batch_delay,
        }
    }

    pub async fn send(&self, message: &NotificationMessage, tokens: &[String]) -> SendSummary {
        let started = Instant::now();
        let mut summary = SendSummary::default();
        let total_batches = tokens.len().div_ceil(self.batch_size);

        for (index, chunk) in tokens.chunks(self.batch_size).enumerate() {
            let batch_started = Instant::now();
            let messages: Vec<_> = chunk.iter().map(|token| message.to_outbound(token)).collect();

            let mut report = BatchReport {
                index,
                size: chunk.len(),
                ..Default::default()
            };
            let mut retryable_in_batch = 0;

            match self.gateway.send_batch(&messages).await {
                Ok(responses) => {
                    if responses.len() != chunk.len() {
                        warn!(
                            batch = index,
                            expected = chunk.len(),
                            received = responses.len(),
                            "Gateway returned a mismatched response count"
                        );
                    }

                    for (position, token) in chunk.iter().enumerate() {
                        let class = match responses.get(position) {
                            Some(SendResponse { success: true, .. }) => {
                                summary.delivered.push(token.clone());
                                report.sent += 1;
                                continue;
                            }
                            Some(response) => ErrorClass::classify(response.error_code()),
                            None => ErrorClass::Retryable,
                        };

                        report.failed += 1;
                        match class {
                            ErrorClass::InvalidToken => summary.invalid.push(token.clone()),
                            ErrorClass::Retryable => {
                                retryable_in_batch += 1;
                                summary.retryable.push(token.clone());
                            }
                            ErrorClass::Unclassified => {
                                debug!(
                                    code = ?responses.get(position).and_then(SendResponse::error_code),
                                    "Unclassified push error"
                                );
                                summary.unclassified.push(token.clone());
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = index, size = chunk.len(), error = %e, "Push batch failed in transport");
                    report.failed = chunk.len();
                    report.transport_error = Some(e.to_string());
                    retryable_in_batch = chunk.len();
                    summary.retryable.extend(chunk.iter().cloned());
                }
            }

            let batch_failed = retryable_in_batch == chunk.len();
            self.breaker.record(!batch_failed);

            report.duration_ms = batch_started.elapsed().as_millis() as u64;
            debug!(
                batch = index,
                of = total_batches,
                sent = report.sent,
                failed = report.failed,
                duration_ms = report.duration_ms,
                "Push batch sent"
            );
            summary.batches.push(report);

            if index + 1 < total_batches && !self.inter_batch_delay.is_zero() {
                sleep(self.inter_batch_delay).await;
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary
    }
}

/// First-attempt delivery of an event's message and the follow-up on failures.
pub struct Dispatcher {
    sender: Arc<BatchSender>,
    recipients: Arc<RecipientStore>,
    retry_queue: Arc<RetryQueue>,
}

impl Dispatcher {
    pub fn new(
        sender: Arc<BatchSender>,
        recipients: Arc<RecipientStore>,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            sender,
            recipients,
            retry_queue,
        }
    }

    /// Sends `message` to `tokens`, purges invalid tokens and queues the
    /// retryable ones as a single retry entry.
    pub async fn dispatch(
        &self,
        event_id: &str,
        message: &NotificationMessage,
        tokens: Vec<String>,
    ) -> DispatchReport {
        let total = tokens.len();
        let summary = self.sender.send(message, &tokens).await;

        if !summary.invalid.is_empty()
            && let Err(e) = self.recipients.purge_tokens(&summary.invalid).await
        {
            error!(event_id, tokens = summary.invalid.len(), error = %e, "Failed to purge invalid tokens");
        }

        let mut retry_entry_id = None;
        let mut retry_error = None;
        if !summary.retryable.is_empty() {
            match self
                .retry_queue
                .enqueue(message.clone(), summary.retryable.clone(), event_id)
                .await
            {
                Ok(entry) => retry_entry_id = Some(entry.id),
                Err(e) => {
                    error!(
                        event_id,
                        tokens = summary.retryable.len(),
                        error = %e,
                        "Failed to enqueue retryable tokens"
                    );
                    let reason = e.to_string();
                    if let Err(archive_err) = self
                        .retry_queue
                        .archive_unqueued(event_id, message, &summary.retryable, &reason)
                        .await
                    {
                        error!(event_id, error = %archive_err, "Failed to archive unqueued tokens");
                    }
                    retry_error = Some(reason);
                }
            }
        }

        if !summary.unclassified.is_empty() {
            self.retry_queue
                .archive_unclassified(event_id, message, &summary.unclassified)
                .await;
        }

        let success_rate = if total == 0 {
            0.0
        } else {
            summary.delivered.len() as f64 / total as f64
        };

        info!(
            event_id,
            tokens = total,
            sent = summary.delivered.len(),
            failed = summary.failed_count(),
            invalid = summary.invalid.len(),
            retryable = summary.retryable.len(),
            batches = summary.batches.len(),
            success_rate,
            "Dispatch completed"
        );

        DispatchReport {
            sent_count: summary.delivered.len(),
            failed_count: summary.failed_count(),
            invalid_tokens: summary.invalid,
            retryable_tokens: summary.retryable,
            unclassified_tokens: summary.unclassified,
            batches: summary.batches,
            success_rate,
            total_duration_ms: summary.duration_ms,
            retry_entry_id,
            retry_error,
        }
    }
}
