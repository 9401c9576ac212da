use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    models::{dispatch::OutboundMessage, recipient::GeoPoint},
    utils::{mask_name, truncate_chars},
};

const POST_BODY_CHARS: usize = 100;
const COMMENT_PREVIEW_CHARS: usize = 50;

/// Content shared by every device that receives one event.
///
/// Built once per event and only read after that; the only way to add to it
/// is the consuming [`NotificationMessage::with_data`] builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl NotificationMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn for_post(event: &EventSubmission) -> Self {
        let payload = &event.payload;
        let location = payload.location_label.as_deref().unwrap_or("Nearby");
        let title = format!("{} · {}", category_label(&payload.category), location);

        let mut body = truncate_chars(&payload.description, POST_BODY_CHARS);
        if let Some(name) = payload.author_name.as_deref().filter(|n| !n.trim().is_empty()) {
            body = format!("{body} ({})", mask_name(name));
        }

        Self::new(title, body)
            .with_data("type", "new_post")
            .with_data("event_id", &event.event_id)
            .with_data("category", &payload.category)
            .with_data("location", location)
            .with_data("lat", event.location.lat.to_string())
            .with_data("lng", event.location.lng.to_string())
            .with_data("action", "open_post")
    }

    pub fn for_comment(event: &CommentEvent) -> Self {
        let name = event
            .commenter_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("Someone");

        let preview = truncate_chars(&event.comment, COMMENT_PREVIEW_CHARS);
        let body = if event.comment.chars().count() > COMMENT_PREVIEW_CHARS {
            format!("{name}: {preview}...")
        } else {
            format!("{name}: {preview}")
        };

        Self::new("New comment on your post", body)
            .with_data("type", "new_comment")
            .with_data("report_id", &event.post_id)
            .with_data("comment_id", &event.comment_id)
            .with_data("action", "open_post")
    }

    pub fn to_outbound(&self, token: &str) -> OutboundMessage {
        OutboundMessage {
            token: token.to_string(),
            title: self.title.clone(),
            body: self.body.clone(),
            data: self.data.clone(),
        }
    }
}

/// "traffic_accident" -> "Traffic accident"
fn category_label(category: &str) -> String {
    let spaced = category.trim().replace(['_', '-'], " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Update".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub category: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub location_label: Option<String>,

    #[serde(default)]
    pub author_name: Option<String>,
}

/// A new post near `location` that nearby recipients should hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubmission {
    pub event_id: String,
    pub location: GeoPoint,
    pub payload: EventPayload,
    pub author_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub post_id: String,

    #[serde(default)]
    pub comment_id: String,

    pub post_owner_id: String,
    pub commenter_id: String,

    #[serde(default)]
    pub commenter_name: Option<String>,

    pub comment: String,
}

/// Broker payload, discriminated by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    NewPost(EventSubmission),
    NewComment(CommentEvent),
}

impl InboundEvent {
    pub fn event_id(&self) -> &str {
        match self {
            InboundEvent::NewPost(event) => &event.event_id,
            InboundEvent::NewComment(event) => &event.post_id,
        }
    }
}
