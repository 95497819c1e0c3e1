//! Message relaying: echo replies to inbound chat and alert fan-out.
//!
//! Both directions share one outbound path, the [`DeliverySink`]. Failures
//! that do not end the session are handed to an [`ErrorSink`] and dropped.

pub mod dispatcher;
pub mod fanout;

pub use dispatcher::InboundDispatcher;
pub use fanout::Fanout;

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};
use xwh_core::{Delivery, Element, XwhError, XwhResult};

/// Outbound path for chat messages.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> XwhResult<()>;
}

/// Inbound stanza stream.
#[async_trait]
pub trait StanzaSource: Send {
    /// Next stanza, `Ok(None)` when the stream ended cleanly.
    async fn next_stanza(&mut self) -> XwhResult<Option<Element>>;
}

/// Where a non-fatal failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropSite {
    /// An inbound message could not be decoded.
    InboundDecode,
    /// The echo reply could not be sent.
    EchoReply,
    /// A fan-out recipient is not a valid address.
    InvalidRecipient,
    /// A fan-out message could not be sent.
    Delivery,
}

impl DropSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InboundDecode => "inbound_decode",
            Self::EchoReply => "echo_reply",
            Self::InvalidRecipient => "invalid_recipient",
            Self::Delivery => "delivery",
        }
    }
}

impl fmt::Display for DropSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives failures that are skipped rather than propagated.
pub trait ErrorSink: Send + Sync {
    fn record(&self, site: DropSite, error: &XwhError);
}

/// Reports dropped work through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn record(&self, site: DropSite, error: &XwhError) {
        match site {
            DropSite::InboundDecode => debug!(site = %site, error = %error, "dropped stanza"),
            _ => warn!(site = %site, error = %error, "dropped message"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every delivery; fails those addressed to `fail_for`.
    #[derive(Default)]
    pub(crate) struct CapturingSink {
        pub(crate) sent: Mutex<Vec<Delivery>>,
        pub(crate) fail_for: Option<String>,
    }

    impl CapturingSink {
        pub(crate) fn failing_for(jid: &str) -> Self {
            Self {
                fail_for: Some(jid.to_string()),
                ..Default::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<Delivery> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliverySink for CapturingSink {
        async fn deliver(&self, delivery: &Delivery) -> XwhResult<()> {
            if self.fail_for.as_deref() == Some(delivery.to.to_string().as_str()) {
                return Err(XwhError::Transport("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(delivery.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingErrors {
        pub(crate) seen: Mutex<Vec<DropSite>>,
    }

    impl RecordingErrors {
        pub(crate) fn sites(&self) -> Vec<DropSite> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ErrorSink for RecordingErrors {
        fn record(&self, site: DropSite, _error: &XwhError) {
            self.seen.lock().unwrap().push(site);
        }
    }

    /// Replays scripted stanzas, then ends or fails.
    pub(crate) struct ScriptedSource {
        pub(crate) stanzas: VecDeque<Element>,
        pub(crate) fail_at_end: bool,
    }

    impl ScriptedSource {
        pub(crate) fn new(xml: &[&str]) -> Self {
            Self {
                stanzas: xml.iter().map(|s| Element::parse(s).unwrap()).collect(),
                fail_at_end: false,
            }
        }
    }

    #[async_trait]
    impl StanzaSource for ScriptedSource {
        async fn next_stanza(&mut self) -> XwhResult<Option<Element>> {
            match self.stanzas.pop_front() {
                Some(el) => Ok(Some(el)),
                None if self.fail_at_end => Err(XwhError::Transport("connection reset".into())),
                None => Ok(None),
            }
        }
    }
}
