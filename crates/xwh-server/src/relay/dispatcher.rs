//! Inbound dispatcher: echoes chat messages back to their sender.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use xwh_core::{Delivery, Element, InboundMessage, Jid, MessageType, XwhResult};

use super::{DeliverySink, DropSite, ErrorSink, StanzaSource};

/// Sole reader of the session's incoming stanzas.
pub struct InboundDispatcher {
    identity: Jid,
    sink: Arc<dyn DeliverySink>,
    errors: Arc<dyn ErrorSink>,
}

impl InboundDispatcher {
    pub fn new(identity: Jid, sink: Arc<dyn DeliverySink>, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            identity,
            sink,
            errors,
        }
    }

    /// Dispatch until the stream ends or `cancel` fires. A clean end of
    /// stream or a cancellation returns `Ok`; a read failure is returned so
    /// the process can shut down. Cancellation is only observed while
    /// waiting for input, never during an echo write.
    pub async fn run<S: StanzaSource + ?Sized>(
        &self,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> XwhResult<()> {
        info!("inbound dispatcher started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("inbound dispatcher stopped");
                    return Ok(());
                }
                next = source.next_stanza() => next?,
            };
            let Some(stanza) = next else {
                break;
            };
            self.handle(&stanza).await;
        }
        info!("server closed the stream");
        Ok(())
    }

    /// Handle one top-level stanza.
    pub async fn handle(&self, stanza: &Element) {
        if stanza.local_name() != "message" {
            trace!(stanza = stanza.name(), "ignoring non-message stanza");
            return;
        }

        let message = match InboundMessage::from_element(stanza) {
            Ok(message) => message,
            Err(e) => {
                self.errors.record(DropSite::InboundDecode, &e);
                return;
            }
        };
        if message.kind != MessageType::Chat || message.body.is_empty() {
            trace!(kind = %message.kind, "skipping message");
            return;
        }
        let Some(sender) = message.from else {
            debug!("chat message without sender");
            return;
        };

        let reply = Delivery::new(self.identity.clone(), sender.bare(), message.body);
        debug!(to = %reply.to, "echoing message");
        if let Err(e) = self.sink.deliver(&reply).await {
            self.errors.record(DropSite::EchoReply, &e);
        }
    }
}
