//! Grafana webhook notifications (legacy and unified alerting).

use serde::Deserialize;

use super::WebhookRequest;
use crate::error::{XwhError, XwhResult};
use crate::message::AlertMessage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrafanaPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    rule_name: String,
    #[serde(default)]
    rule_url: String,
    #[serde(default)]
    state: String,
    /// Unified alerting reports `status` instead of `state`.
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    eval_matches: Vec<EvalMatch>,
}

#[derive(Debug, Deserialize)]
struct EvalMatch {
    #[serde(default)]
    metric: String,
    #[serde(default)]
    value: serde_json::Value,
}

fn state_label(state: &str) -> String {
    match state.to_ascii_lowercase().as_str() {
        "alerting" | "firing" => "ALERTING".to_string(),
        "ok" | "resolved" => "RESOLVED".to_string(),
        "no_data" | "nodata" => "NO DATA".to_string(),
        "paused" => "PAUSED".to_string(),
        "" => "UNKNOWN".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// Format a Grafana notification as `[STATE] title` followed by the rule
/// URL, message and evaluated metrics.
pub fn grafana(request: &WebhookRequest<'_>) -> XwhResult<AlertMessage> {
    let payload: GrafanaPayload = serde_json::from_slice(request.body)?;

    let title = if payload.title.is_empty() {
        payload.rule_name.as_str()
    } else {
        payload.title.as_str()
    };
    if title.is_empty() && payload.message.is_empty() {
        return Err(XwhError::Parse("grafana payload has neither title nor message".into()));
    }

    let state = if payload.state.is_empty() {
        &payload.status
    } else {
        &payload.state
    };

    let mut lines = vec![format!("[{}] {}", state_label(state), title)];
    if !payload.rule_url.is_empty() {
        lines.push(payload.rule_url.clone());
    }
    if !payload.message.is_empty() {
        lines.push(String::new());
        lines.push(payload.message.clone());
    }
    if !payload.eval_matches.is_empty() {
        lines.push(String::new());
        for m in &payload.eval_matches {
            let value = match &m.value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => "null".to_string(),
                other => other.to_string(),
            };
            lines.push(format!("{}: {}", m.metric, value));
        }
    }

    Ok(request.alert(lines.join("\n")))
}
