//! Prometheus Alertmanager webhook payloads.

use std::collections::HashMap;

use serde::Deserialize;

use super::WebhookRequest;
use crate::error::{XwhError, XwhResult};
use crate::message::AlertMessage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertmanagerPayload {
    #[serde(default)]
    status: String,
    #[serde(default)]
    alerts: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Alert {
    #[serde(default)]
    status: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
    #[serde(default)]
    starts_at: String,
    #[serde(default, rename = "generatorURL")]
    generator_url: String,
}

/// One block per alert: `[STATUS] alertname`, summary and description
/// annotations, start time and generator URL. Blocks are separated by a
/// blank line.
pub fn alertmanager(request: &WebhookRequest<'_>) -> XwhResult<AlertMessage> {
    let payload: AlertmanagerPayload = serde_json::from_slice(request.body)?;
    if payload.alerts.is_empty() {
        return Err(XwhError::Parse("alertmanager payload has no alerts".into()));
    }

    let blocks: Vec<String> = payload
        .alerts
        .iter()
        .map(|alert| {
            let status = if alert.status.is_empty() {
                &payload.status
            } else {
                &alert.status
            };
            let name = alert
                .labels
                .get("alertname")
                .map_or("unnamed alert", String::as_str);

            let mut lines = vec![format!("[{}] {}", status.to_ascii_uppercase(), name)];
            for key in ["summary", "description"] {
                if let Some(text) = alert.annotations.get(key).filter(|t| !t.is_empty()) {
                    lines.push(text.clone());
                }
            }
            if !alert.starts_at.is_empty() {
                lines.push(format!("since {}", alert.starts_at));
            }
            if !alert.generator_url.is_empty() {
                lines.push(alert.generator_url.clone());
            }
            lines.join("\n")
        })
        .collect();

    Ok(request.alert(blocks.join("\n\n")))
}
