//! Alert messages, outbound deliveries and decoded inbound chat messages.

use std::fmt;

use rand::Rng;

use crate::error::{XwhError, XwhResult};
use crate::jid::Jid;
use crate::stanza::Element;

/// Normalized alert produced by an ingestion parser.
///
/// Consumed exactly once by the fan-out, which expands it into one
/// [`Delivery`] per resolved recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    text: String,
    recipients: Option<Vec<String>>,
}

impl AlertMessage {
    /// An alert for the configured default recipients.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            recipients: None,
        }
    }

    /// An alert with an explicit recipient list (textual JIDs, unvalidated).
    pub fn with_recipients(text: impl Into<String>, recipients: Option<Vec<String>>) -> Self {
        Self {
            text: text.into(),
            recipients,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Explicit recipients, if the request named any.
    pub fn recipients(&self) -> Option<&[String]> {
        self.recipients.as_deref()
    }
}

/// One chat message to one recipient. Built at send time, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: Jid,
    pub to: Jid,
    pub text: String,
}

impl Delivery {
    pub fn new(from: Jid, to: Jid, text: impl Into<String>) -> Self {
        Self {
            from,
            to,
            text: text.into(),
        }
    }

    /// Encode as a `<message type="chat">` stanza.
    pub fn to_stanza(&self) -> Element {
        Element::new("message")
            .with_attr("from", self.from.to_string())
            .with_attr("to", self.to.to_string())
            .with_attr("type", MessageType::Chat.as_str())
            .with_attr("id", stanza_id())
            .with_child(Element::new("body").with_text(self.text.clone()))
    }
}

/// Random stanza id, 8 bytes hex-encoded.
pub fn stanza_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// The `type` attribute of a message stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Normal,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Normal => "normal",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }

    fn parse(s: &str) -> XwhResult<Self> {
        match s {
            "chat" => Ok(MessageType::Chat),
            "normal" => Ok(MessageType::Normal),
            "groupchat" => Ok(MessageType::Groupchat),
            "headline" => Ok(MessageType::Headline),
            "error" => Ok(MessageType::Error),
            other => Err(XwhError::Xml(format!("unknown message type {other:?}"))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `<message>` stanza received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: MessageType,
    pub body: String,
}

impl InboundMessage {
    /// Decode a message stanza. A missing `type` means `normal`; a missing
    /// `<body>` decodes as an empty body.
    pub fn from_element(element: &Element) -> XwhResult<Self> {
        if element.local_name() != "message" {
            return Err(XwhError::Xml(format!(
                "expected <message>, got <{}>",
                element.name()
            )));
        }
        let from = element.attr("from").map(Jid::parse).transpose()?;
        let to = element.attr("to").map(Jid::parse).transpose()?;
        let kind = match element.attr("type") {
            Some(t) => MessageType::parse(t)?,
            None => MessageType::Normal,
        };
        let body = element.child("body").map(Element::text).unwrap_or_default();
        Ok(Self {
            from,
            to,
            kind,
            body,
        })
    }
}
