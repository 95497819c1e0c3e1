//! Outbound fan-out: expands queued alerts into one chat message per
//! recipient.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use xwh_core::{AlertMessage, Delivery, Jid};

use super::{DeliverySink, DropSite, ErrorSink};

/// Sole consumer of the alert queue.
pub struct Fanout {
    identity: Jid,
    defaults: Vec<String>,
    sink: Arc<dyn DeliverySink>,
    errors: Arc<dyn ErrorSink>,
}

impl Fanout {
    pub fn new(
        identity: Jid,
        defaults: Vec<String>,
        sink: Arc<dyn DeliverySink>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            identity,
            defaults,
            sink,
            errors,
        }
    }

    /// Consume alerts in FIFO order until the queue closes or `cancel` fires.
    pub async fn run(&self, mut queue: mpsc::Receiver<AlertMessage>, cancel: CancellationToken) {
        info!(defaults = self.defaults.len(), "fan-out started");
        loop {
            let alert = tokio::select! {
                _ = cancel.cancelled() => break,
                alert = queue.recv() => match alert {
                    Some(alert) => alert,
                    None => break,
                },
            };
            let delivered = self.deliver(&alert, &cancel).await;
            debug!(delivered, "alert fanned out");
        }
        info!("fan-out stopped");
    }

    /// Recipients for `alert`: its own list if it has one, else the defaults.
    pub fn resolve<'a>(&'a self, alert: &'a AlertMessage) -> &'a [String] {
        alert.recipients().unwrap_or(self.defaults.as_slice())
    }

    /// Send `alert` to each recipient in order. Invalid addresses and send
    /// failures are recorded and skipped. Cancellation is checked between
    /// recipients only, so a stanza already being written is finished.
    /// Returns the number delivered.
    pub async fn deliver(&self, alert: &AlertMessage, cancel: &CancellationToken) -> usize {
        let mut delivered = 0;
        for recipient in self.resolve(alert) {
            if cancel.is_cancelled() {
                debug!(delivered, "fan-out interrupted by shutdown");
                break;
            }
            let to = match Jid::parse(recipient) {
                Ok(to) => to,
                Err(e) => {
                    self.errors.record(DropSite::InvalidRecipient, &e);
                    continue;
                }
            };
            let delivery = Delivery::new(self.identity.clone(), to, alert.text());
            match self.sink.deliver(&delivery).await {
                Ok(()) => delivered += 1,
                Err(e) => self.errors.record(DropSite::Delivery, &e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use crate::relay::testing::{CapturingSink, RecordingErrors, ScriptedSource};
    use crate::relay::InboundDispatcher;
    use crate::session::writer::tests::{parse_messages, ChunkedWriter};
    use crate::session::StanzaWriter;

    fn identity() -> Jid {
        Jid::parse("relay@example.org/bot").unwrap()
    }

    fn fanout(defaults: &[&str], sink: Arc<dyn DeliverySink>, errors: Arc<RecordingErrors>) -> Fanout {
        Fanout::new(
            identity(),
            defaults.iter().map(|s| s.to_string()).collect(),
            sink,
            errors,
        )
    }

    fn recipients(sink: &CapturingSink) -> Vec<String> {
        sink.sent().iter().map(|d| d.to.to_string()).collect()
    }

    #[tokio::test]
    async fn defaults_are_used_in_order() {
        let sink = Arc::new(CapturingSink::default());
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&["x@y.com", "z@y.com"], sink.clone(), errors.clone());

        let n = fanout
            .deliver(&AlertMessage::new("disk full"), &CancellationToken::new())
            .await;

        assert_eq!(n, 2);
        assert_eq!(recipients(&sink), ["x@y.com", "z@y.com"]);
        assert!(sink.sent().iter().all(|d| d.text == "disk full" && d.from == identity()));
    }

    #[tokio::test]
    async fn explicit_recipients_replace_defaults() {
        let sink = Arc::new(CapturingSink::default());
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&["x@y.com"], sink.clone(), errors);
        let alert = AlertMessage::with_recipients("cpu", Some(vec!["ops@y.com".into()]));

        assert_eq!(fanout.resolve(&alert), ["ops@y.com"]);
        fanout.deliver(&alert, &CancellationToken::new()).await;
        assert_eq!(recipients(&sink), ["ops@y.com"]);
    }

    #[tokio::test]
    async fn invalid_recipient_is_skipped() {
        let sink = Arc::new(CapturingSink::default());
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&[], sink.clone(), errors.clone());
        let alert = AlertMessage::with_recipients(
            "x",
            Some(vec!["a@b.com".into(), "@".into(), "c@d.com".into()]),
        );

        let n = fanout.deliver(&alert, &CancellationToken::new()).await;

        assert_eq!(n, 2);
        assert_eq!(recipients(&sink), ["a@b.com", "c@d.com"]);
        assert_eq!(errors.sites(), vec![DropSite::InvalidRecipient]);
    }

    #[tokio::test]
    async fn send_failure_does_not_abort_remaining_recipients() {
        let sink = Arc::new(CapturingSink::failing_for("a@b.com"));
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&["a@b.com", "c@d.com"], sink.clone(), errors.clone());

        let n = fanout
            .deliver(&AlertMessage::new("x"), &CancellationToken::new())
            .await;

        assert_eq!(n, 1);
        assert_eq!(recipients(&sink), ["c@d.com"]);
        assert_eq!(errors.sites(), vec![DropSite::Delivery]);
    }

    #[tokio::test]
    async fn run_drains_queue_in_order_until_closed() {
        let sink = Arc::new(CapturingSink::default());
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&["x@y.com"], sink.clone(), errors);
        let (tx, rx) = mpsc::channel(4);

        tx.send(AlertMessage::new("first")).await.unwrap();
        tx.send(AlertMessage::new("second")).await.unwrap();
        drop(tx);
        fanout.run(rx, CancellationToken::new()).await;

        let texts: Vec<String> = sink.sent().into_iter().map(|d| d.text).collect();
        assert_eq!(texts, ["first", "second"]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let sink = Arc::new(CapturingSink::default());
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&["x@y.com"], sink.clone(), errors);
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        fanout.run(rx, cancel).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn cancel_lets_the_stanza_in_flight_finish() {
        // A pipe far smaller than one stanza keeps the first write pending.
        let (client, mut server) = tokio::io::duplex(32);
        let sink: Arc<dyn DeliverySink> = Arc::new(StanzaWriter::new(client));
        let errors = Arc::new(RecordingErrors::default());
        let fanout = fanout(&["a@b.com", "c@d.com"], sink, errors.clone());
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                fanout
                    .deliver(&AlertMessage::new("x".repeat(200)), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let reader = tokio::spawn(async move {
            let mut wire = String::new();
            server.read_to_string(&mut wire).await.unwrap();
            wire
        });

        assert_eq!(task.await.unwrap(), 1);
        let wire = reader.await.unwrap();
        let messages = parse_messages(&wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attr("to"), Some("a@b.com"));
        assert!(wire.ends_with("</message>"));
        assert!(errors.sites().is_empty());
    }

    #[tokio::test]
    async fn echo_and_fanout_share_the_stream_without_interleaving() {
        let out = ChunkedWriter::default();
        let writer: Arc<dyn DeliverySink> = Arc::new(StanzaWriter::new(out.clone()));
        let errors = Arc::new(RecordingErrors::default());

        let fanout = fanout(&["x@y.com", "z@y.com"], writer.clone(), errors.clone());
        let dispatcher = InboundDispatcher::new(identity(), writer, errors.clone());

        let inbound: Vec<String> = (0..8)
            .map(|i| {
                format!(r#"<message from="user{i}@b.com/phone" type="chat"><body>echo {i}</body></message>"#)
            })
            .collect();
        let inbound: Vec<&str> = inbound.iter().map(String::as_str).collect();
        let mut source = ScriptedSource::new(&inbound);

        let (tx, rx) = mpsc::channel(8);
        for i in 0..8 {
            tx.send(AlertMessage::new(format!("alert {i}"))).await.unwrap();
        }
        drop(tx);

        let dispatch_cancel = CancellationToken::new();
        let (echo, ()) = tokio::join!(
            dispatcher.run(&mut source, &dispatch_cancel),
            fanout.run(rx, CancellationToken::new())
        );
        echo.unwrap();

        let messages = parse_messages(&out.contents());
        assert_eq!(messages.len(), 8 + 16);
        assert!(errors.sites().is_empty());
        for m in &messages {
            let body = m.child("body").unwrap().text();
            let to = m.attr("to").unwrap();
            if let Some(i) = body.strip_prefix("echo ") {
                assert_eq!(to, format!("user{i}@b.com"));
            } else {
                assert!(body.starts_with("alert "));
                assert!(to == "x@y.com" || to == "z@y.com");
            }
        }
    }
}
