//! Ingestion parsers: webhook body → [`AlertMessage`].
//!
//! Every parser is a pure function of the request. The gateway is generic
//! over [`AlertParser`], which plain functions and closures implement.

mod alertmanager;
mod grafana;
mod slack;

pub use alertmanager::alertmanager;
pub use grafana::grafana;
pub use slack::slack;

use crate::error::XwhResult;
use crate::message::AlertMessage;

/// The parts of an HTTP request a parser may look at.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    /// Raw request body.
    pub body: &'a [u8],
    /// Recipients named by the caller, if any.
    pub recipients: Option<&'a [String]>,
}

impl<'a> WebhookRequest<'a> {
    pub fn new(body: &'a [u8], recipients: Option<&'a [String]>) -> Self {
        Self { body, recipients }
    }

    /// Build the alert for this request, carrying over explicit recipients.
    pub fn alert(&self, text: impl Into<String>) -> AlertMessage {
        AlertMessage::with_recipients(text, self.recipients.map(<[String]>::to_vec))
    }
}

/// Turns one webhook request into an alert.
pub trait AlertParser: Send + Sync + 'static {
    fn parse(&self, request: &WebhookRequest<'_>) -> XwhResult<AlertMessage>;
}

impl<F> AlertParser for F
where
    F: Fn(&WebhookRequest<'_>) -> XwhResult<AlertMessage> + Send + Sync + 'static,
{
    fn parse(&self, request: &WebhookRequest<'_>) -> XwhResult<AlertMessage> {
        self(request)
    }
}

/// A parser registered under an HTTP path.
pub type BuiltinParser = fn(&WebhookRequest<'_>) -> XwhResult<AlertMessage>;

/// Parsers shipped with the relay, keyed by endpoint path.
pub fn builtin() -> [(&'static str, BuiltinParser); 3] {
    [
        ("/grafana", grafana as BuiltinParser),
        ("/slack", slack as BuiltinParser),
        ("/alertmanager", alertmanager as BuiltinParser),
    ]
}

/// Split a comma-separated recipient list, dropping blank entries.
/// Returns `None` when nothing is left.
pub fn split_recipients(raw: &str) -> Option<Vec<String>> {
    let list: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_trims_and_drops_blanks() {
        assert_eq!(
            split_recipients(" a@b.com, ,c@d.com,"),
            Some(vec!["a@b.com".to_string(), "c@d.com".to_string()])
        );
        assert_eq!(split_recipients(" , "), None);
        assert_eq!(split_recipients(""), None);
    }

    #[test]
    fn closures_are_parsers() {
        let upper = |req: &WebhookRequest<'_>| -> XwhResult<AlertMessage> {
            Ok(req.alert(String::from_utf8_lossy(req.body).to_uppercase()))
        };
        let recipients = vec!["a@b.com".to_string()];
        let msg = upper
            .parse(&WebhookRequest::new(b"hello", Some(&recipients)))
            .unwrap();
        assert_eq!(msg.text(), "HELLO");
        assert_eq!(msg.recipients().unwrap(), ["a@b.com"]);
    }

    #[test]
    fn builtin_paths() {
        let paths: Vec<&str> = builtin().iter().map(|(p, _)| *p).collect();
        assert_eq!(paths, ["/grafana", "/slack", "/alertmanager"]);
    }
}
