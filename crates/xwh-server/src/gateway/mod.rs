//! Ingestion gateway: one HTTP endpoint per alert source.
//!
//! Each endpoint owns an [`AlertParser`]. A request body that parses is
//! queued for the fan-out and answered with `200 OK`; anything else gets a
//! client error and nothing is queued. The gateway never looks inside a
//! payload itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xwh_core::parser::{self, split_recipients};
use xwh_core::{AlertMessage, AlertParser, WebhookRequest, XwhError, XwhResult};

/// Query parameter carrying explicit recipients (comma-separated).
pub const RECIPIENTS_PARAM: &str = "recipients";

/// A registered endpoint.
pub struct Endpoint {
    path: String,
    parser: Box<dyn AlertParser>,
    queue: mpsc::Sender<AlertMessage>,
}

impl Endpoint {
    /// Parse one request and queue the resulting alert.
    pub async fn accept(&self, body: &[u8], recipients: Option<&[String]>) -> XwhResult<()> {
        let alert = self.parser.parse(&WebhookRequest::new(body, recipients))?;
        self.queue
            .send(alert)
            .await
            .map_err(|_| XwhError::QueueClosed)
    }
}

/// Builder for the HTTP router of the gateway.
pub struct Gateway {
    queue: mpsc::Sender<AlertMessage>,
    endpoints: Vec<Endpoint>,
}

impl Gateway {
    pub fn new(queue: mpsc::Sender<AlertMessage>) -> Self {
        Self {
            queue,
            endpoints: Vec::new(),
        }
    }

    /// Register `parser` for POST requests on `path`.
    pub fn endpoint(mut self, path: impl Into<String>, parser: impl AlertParser) -> Self {
        self.endpoints.push(Endpoint {
            path: path.into(),
            parser: Box::new(parser),
            queue: self.queue.clone(),
        });
        self
    }

    /// Register the parsers shipped with the relay.
    pub fn with_builtin_parsers(self) -> Self {
        parser::builtin()
            .into_iter()
            .fold(self, |gateway, (path, parser)| gateway.endpoint(path, parser))
    }

    /// Build the router. Fails on a path registered twice or one that does
    /// not start with `/`.
    pub fn into_router(self) -> XwhResult<Router> {
        let mut seen = HashSet::new();
        let mut router = Router::new();
        for endpoint in self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(XwhError::Config(format!(
                    "webhook path {:?} must start with '/'",
                    endpoint.path
                )));
            }
            if !seen.insert(endpoint.path.clone()) {
                return Err(XwhError::Config(format!(
                    "webhook path {:?} registered twice",
                    endpoint.path
                )));
            }
            info!(path = %endpoint.path, "registered webhook endpoint");
            let path = endpoint.path.clone();
            router = router.route(&path, post(ingest).with_state(Arc::new(endpoint)));
        }
        Ok(router)
    }
}

async fn ingest(
    State(endpoint): State<Arc<Endpoint>>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let recipients = params
        .get(RECIPIENTS_PARAM)
        .and_then(|raw| split_recipients(raw));

    match endpoint.accept(&body, recipients.as_deref()).await {
        Ok(()) => {
            debug!(path = %endpoint.path, bytes = body.len(), "alert queued");
            StatusCode::OK
        }
        Err(XwhError::QueueClosed) => {
            warn!(path = %endpoint.path, "alert queue closed");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            debug!(path = %endpoint.path, error = %e, "rejected webhook payload");
            StatusCode::BAD_REQUEST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use xwh_core::Jid;

    use crate::relay::{Fanout, LogSink};
    use crate::session::writer::tests::{parse_messages, ChunkedWriter};
    use crate::session::StanzaWriter;

    fn echo_parser(request: &WebhookRequest<'_>) -> XwhResult<AlertMessage> {
        let text = std::str::from_utf8(request.body)
            .map_err(|e| XwhError::Parse(e.to_string()))?;
        if text.is_empty() {
            return Err(XwhError::Parse("empty body".into()));
        }
        Ok(request.alert(text))
    }

    fn post_to(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    #[test]
    fn duplicate_or_relative_paths_are_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let result = Gateway::new(tx)
            .with_builtin_parsers()
            .endpoint("/grafana", echo_parser)
            .into_router();
        assert!(matches!(result, Err(XwhError::Config(msg)) if msg.contains("/grafana")));

        let (tx, _rx) = mpsc::channel(1);
        let result = Gateway::new(tx).endpoint("echo", echo_parser).into_router();
        assert!(matches!(result, Err(XwhError::Config(_))));
    }

    #[tokio::test]
    async fn parsed_alert_is_queued() {
        let (tx, mut rx) = mpsc::channel(1);
        let app = Gateway::new(tx).endpoint("/echo", echo_parser).into_router().unwrap();

        let response = app.oneshot(post_to("/echo", "disk full")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.text(), "disk full");
        assert!(alert.recipients().is_none());
    }

    #[tokio::test]
    async fn parse_failure_is_a_client_error_and_queues_nothing() {
        let (tx, mut rx) = mpsc::channel(1);
        let app = Gateway::new(tx).endpoint("/echo", echo_parser).into_router().unwrap();

        let response = app.oneshot(post_to("/echo", "")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recipients_come_from_the_query() {
        let (tx, mut rx) = mpsc::channel(1);
        let app = Gateway::new(tx).endpoint("/echo", echo_parser).into_router().unwrap();

        let response = app
            .oneshot(post_to("/echo?recipients=a@b.com,%20c@d.com", "x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.recipients().unwrap(), ["a@b.com", "c@d.com"]);
    }

    #[tokio::test]
    async fn closed_queue_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let app = Gateway::new(tx).endpoint("/echo", echo_parser).into_router().unwrap();

        let response = app.oneshot(post_to("/echo", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn builtin_endpoints_are_routed() {
        let (tx, mut rx) = mpsc::channel(1);
        let app = Gateway::new(tx).with_builtin_parsers().into_router().unwrap();

        let body = r#"{"title":"[Alerting] CPU","ruleUrl":"http://grafana/d/1","state":"alerting","message":"high"}"#;
        let response = app.clone().oneshot(post_to("/grafana", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_ok());

        let response = app.clone().oneshot(post_to("/slack", "not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(post_to("/unknown", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn closures_can_be_parsers() {
        let (tx, mut rx) = mpsc::channel(1);
        let app = Gateway::new(tx)
            .endpoint("/fixed", |request: &WebhookRequest<'_>| -> XwhResult<AlertMessage> {
                Ok(request.alert("fixed text"))
            })
            .into_router().unwrap();

        let response = app.oneshot(post_to("/fixed", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.try_recv().unwrap().text(), "fixed text");
    }

    #[tokio::test]
    async fn concurrent_requests_reach_the_stream_intact() {
        let out = ChunkedWriter::default();
        let writer = Arc::new(StanzaWriter::new(out.clone()));
        let (tx, rx) = mpsc::channel(1);
        let app = Gateway::new(tx).endpoint("/echo", echo_parser).into_router().unwrap();

        let fanout = Fanout::new(
            Jid::parse("relay@example.org").unwrap(),
            vec!["ops@example.org".into(), "oncall@example.org".into()],
            writer,
            Arc::new(LogSink),
        );
        let fanout_task = tokio::spawn(async move { fanout.run(rx, CancellationToken::new()).await });

        let requests: Vec<_> = (0..16)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move {
                    let body = format!("alert {i} from a concurrent request");
                    app.oneshot(post_to("/echo", body)).await.unwrap().status()
                })
            })
            .collect();
        for request in requests {
            assert_eq!(request.await.unwrap(), StatusCode::OK);
        }
        drop(app);
        fanout_task.await.unwrap();

        let messages = parse_messages(&out.contents());
        assert_eq!(messages.len(), 32);
        let mut bodies: Vec<String> = messages
            .iter()
            .map(|m| m.child("body").unwrap().text())
            .collect();
        bodies.sort();
        bodies.dedup();
        assert_eq!(bodies.len(), 16);
        assert!(bodies.iter().all(|b| b.ends_with("from a concurrent request")));
    }
}
