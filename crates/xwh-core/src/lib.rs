//! xwh-core: shared protocol library for xmpp-webhook.
//!
//! Provides XMPP addresses, an owned stanza tree with a streaming builder,
//! SASL client mechanisms, the alert/delivery model and the built-in
//! webhook parsers.

pub mod error;
pub mod jid;
pub mod message;
pub mod parser;
pub mod sasl;
pub mod stanza;

// Re-export commonly used items at crate root.
pub use error::{XwhError, XwhResult};
pub use jid::Jid;
pub use message::{AlertMessage, Delivery, InboundMessage, MessageType};
pub use parser::{AlertParser, WebhookRequest};
pub use stanza::{Element, Feed, TreeBuilder};
