//! Owned XML element tree for XMPP stanzas.
//!
//! The session reads the stream as a sequence of quick-xml events. A
//! [`TreeBuilder`] turns those events into one [`Element`] per top-level
//! stanza, so everything above the transport works on complete trees.

use std::borrow::Cow;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{XwhError, XwhResult};
use crate::jid::Jid;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Opening tag of a client-to-server stream.
pub fn stream_header(from: &Jid) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{NS_CLIENT}' xmlns:stream='{NS_STREAM}' \
         to='{}' from='{}' version='1.0'>",
        escape(from.domain()),
        escape(from.bare().to_string().as_str()),
    )
}

/// Closing tag of a stream.
pub const STREAM_FOOTER: &str = "</stream:stream>";

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Parse a single element from a standalone XML fragment.
    pub fn parse(xml: &str) -> XwhResult<Self> {
        let mut reader = Reader::from_str(xml);
        let mut builder = TreeBuilder::for_content();
        loop {
            let event = reader
                .read_event()
                .map_err(|e| XwhError::Xml(e.to_string()))?;
            match builder.feed(event)? {
                Feed::Stanza(element) => return Ok(element),
                Feed::StreamEnd => return Err(XwhError::Xml("no element in input".into())),
                Feed::Pending | Feed::Header(_) => {}
            }
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Qualified name as it appeared on the wire (e.g. `stream:features`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Child elements, skipping text nodes.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.children().find(|c| c.local_name() == local_name)
    }

    pub fn has_child(&self, local_name: &str) -> bool {
        self.child(local_name).is_some()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize to XML text.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(element) => element.write_xml(out),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Outcome of feeding one event to a [`TreeBuilder`].
#[derive(Debug)]
pub enum Feed {
    /// More events are needed.
    Pending,
    /// The opening `<stream:stream>` tag, without children.
    Header(Element),
    /// A complete top-level element.
    Stanza(Element),
    /// The stream (or input) ended between stanzas.
    StreamEnd,
}

/// Builds top-level elements out of a flat event sequence.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    stack: Vec<Element>,
    awaiting_header: bool,
}

impl TreeBuilder {
    /// Builder for a fresh stream: the first start tag must be `stream:stream`.
    pub fn for_stream() -> Self {
        Self {
            stack: Vec::new(),
            awaiting_header: true,
        }
    }

    /// Builder positioned inside an already opened stream.
    pub fn for_content() -> Self {
        Self::default()
    }

    /// Whether a stanza is partially built.
    pub fn in_stanza(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn feed(&mut self, event: Event<'_>) -> XwhResult<Feed> {
        match event {
            Event::Start(start) => {
                let element = element_from_start(&start)?;
                if self.awaiting_header && self.stack.is_empty() {
                    if element.local_name() != "stream" {
                        return Err(XwhError::Xml(format!(
                            "expected stream header, got <{}>",
                            element.name()
                        )));
                    }
                    self.awaiting_header = false;
                    return Ok(Feed::Header(element));
                }
                self.stack.push(element);
                Ok(Feed::Pending)
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                if self.awaiting_header && self.stack.is_empty() {
                    return Err(XwhError::Xml(format!(
                        "expected stream header, got <{}/>",
                        element.name()
                    )));
                }
                Ok(self.complete(element))
            }
            Event::End(_) => match self.stack.pop() {
                Some(element) => Ok(self.complete(element)),
                None => Ok(Feed::StreamEnd),
            },
            Event::Text(text) => {
                if let Some(parent) = self.stack.last_mut() {
                    let text = text.unescape().map_err(|e| XwhError::Xml(e.to_string()))?;
                    parent.children.push(Node::Text(text.into_owned()));
                }
                Ok(Feed::Pending)
            }
            Event::CData(data) => {
                if let Some(parent) = self.stack.last_mut() {
                    let data = data.into_inner();
                    parent
                        .children
                        .push(Node::Text(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Feed::Pending)
            }
            Event::Eof => match self.stack.first() {
                None => Ok(Feed::StreamEnd),
                Some(open) => Err(XwhError::Xml(format!(
                    "input ended inside <{}>",
                    open.name()
                ))),
            },
            _ => Ok(Feed::Pending),
        }
    }

    fn complete(&mut self, element: Element) -> Feed {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.children.push(Node::Element(element));
                Feed::Pending
            }
            None => Feed::Stanza(element),
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> XwhResult<Element> {
    let name = String::from_utf8(start.name().as_ref().to_vec())
        .map_err(|e| XwhError::Xml(format!("non-utf8 element name: {e}")))?;
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XwhError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value: Cow<'_, str> = attr
            .unescape_value()
            .map_err(|e| XwhError::Xml(e.to_string()))?;
        element.attrs.push((key, value.into_owned()));
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_message() {
        let el = Element::parse(
            r#"<message from="a@b.com/phone" type="chat"><body>hi &amp; bye</body></message>"#,
        )
        .unwrap();
        assert_eq!(el.name(), "message");
        assert_eq!(el.attr("from"), Some("a@b.com/phone"));
        assert_eq!(el.child("body").unwrap().text(), "hi & bye");
    }

    #[test]
    fn local_name_strips_prefix() {
        let el = Element::parse("<stream:features><bind/></stream:features>").unwrap();
        assert_eq!(el.name(), "stream:features");
        assert_eq!(el.local_name(), "features");
        assert!(el.has_child("bind"));
    }

    #[test]
    fn serializes_with_escaping() {
        let el = Element::new("message")
            .with_attr("to", "a@b.com")
            .with_child(Element::new("body").with_text("1 < 2 & \"q\""));
        let xml = el.to_xml();
        assert_eq!(
            xml,
            r#"<message to="a@b.com"><body>1 &lt; 2 &amp; &quot;q&quot;</body></message>"#
        );
        assert_eq!(Element::parse(&xml).unwrap(), el);
    }

    #[test]
    fn empty_element_is_self_closing() {
        assert_eq!(Element::new("presence").to_xml(), "<presence/>");
    }

    #[test]
    fn set_attr_replaces_existing() {
        let mut el = Element::new("iq").with_attr("id", "1");
        el.set_attr("id", "2");
        assert_eq!(el.attr("id"), Some("2"));
        assert_eq!(el.to_xml(), r#"<iq id="2"/>"#);
    }

    #[test]
    fn builder_yields_header_then_stanzas() {
        let xml = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' id='abc'>\
                   <stream:features><starttls/></stream:features> \
                   <presence/></stream:stream>";
        let mut reader = Reader::from_str(xml);
        reader.config_mut().check_end_names = false;
        let mut builder = TreeBuilder::for_stream();
        let mut out = Vec::new();
        loop {
            match builder.feed(reader.read_event().unwrap()).unwrap() {
                Feed::Pending => {}
                Feed::StreamEnd => break,
                other => out.push(other),
            }
        }
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Feed::Header(h) if h.attr("id") == Some("abc")));
        assert!(matches!(&out[1], Feed::Stanza(f) if f.has_child("starttls")));
        assert!(matches!(&out[2], Feed::Stanza(p) if p.name() == "presence"));
    }

    #[test]
    fn builder_rejects_non_stream_header() {
        let mut reader = Reader::from_str("<message/>");
        let mut builder = TreeBuilder::for_stream();
        let event = reader.read_event().unwrap();
        assert!(builder.feed(event).is_err());
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(Element::parse("<message><body>cut").is_err());
    }

    #[test]
    fn stream_header_names_domain() {
        let jid = Jid::parse("relay@example.org/bot").unwrap();
        let header = stream_header(&jid);
        assert!(header.contains("to='example.org'"));
        assert!(header.contains("from='relay@example.org'"));
        assert!(header.ends_with("version='1.0'>"));
    }
}
