use anyhow::{Error, Result};
use tracing::info;

use crate::{
    models::{dispatch::DispatchResult, message::InboundEvent},
    services::notifier::NotificationService,
};

const MASK: &str = "*******";
const MASK_VISIBLE_CHARS: usize = 4;

/// Parses one broker payload and runs it through the pipeline.
///
/// A parse failure is an `Err`; skips (maintenance, quota, breaker) are not.
pub async fn process_message(
    payload: &str,
    service: &NotificationService,
) -> Result<DispatchResult, Error> {
    let event = serde_json::from_str::<InboundEvent>(payload)?;

    info!(event_id = %event.event_id(), "Processing inbound event");

    let result = match &event {
        InboundEvent::NewPost(submission) => service.submit_event(submission).await?,
        InboundEvent::NewComment(comment) => service.submit_comment(comment).await?,
    };

    match result.skip_reason() {
        Some(reason) => info!(event_id = %result.event_id, reason = %reason, "Event skipped"),
        None => info!(
            event_id = %result.event_id,
            sent = result.sent_count(),
            tokens = result.selected_tokens,
            "Event dispatched"
        ),
    }

    Ok(result)
}

/// First characters of a display name followed by a fixed mask.
pub fn mask_name(name: &str) -> String {
    let visible: String = name.trim().chars().take(MASK_VISIBLE_CHARS).collect();
    format!("{visible} {MASK}")
}

/// At most `max_chars` characters of `text`, never splitting a character.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
