//! Slack-compatible incoming webhook payloads.

use serde::Deserialize;

use super::WebhookRequest;
use crate::error::{XwhError, XwhResult};
use crate::message::AlertMessage;

#[derive(Debug, Deserialize)]
struct SlackPayload {
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(default)]
    title: String,
    #[serde(default)]
    title_link: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    fallback: String,
}

/// Message text followed by each attachment's title, link and text.
/// Attachments with no text fall back to their `fallback` field.
pub fn slack(request: &WebhookRequest<'_>) -> XwhResult<AlertMessage> {
    let payload: SlackPayload = serde_json::from_slice(request.body)?;

    let mut lines = Vec::new();
    if !payload.text.is_empty() {
        lines.push(payload.text);
    }
    for a in payload.attachments {
        if !a.title.is_empty() {
            lines.push(a.title);
        }
        if !a.title_link.is_empty() {
            lines.push(a.title_link);
        }
        if !a.text.is_empty() {
            lines.push(a.text);
        } else if !a.fallback.is_empty() {
            lines.push(a.fallback);
        }
    }

    if lines.is_empty() {
        return Err(XwhError::Parse("slack payload has no text".into()));
    }
    Ok(request.alert(lines.join("\n")))
}
