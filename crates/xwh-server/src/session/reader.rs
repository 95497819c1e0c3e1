//! Incoming half of the stream: quick-xml events assembled into stanzas.

use async_trait::async_trait;
use quick_xml::Reader;
use tokio::io::AsyncBufRead;
use xwh_core::{Element, Feed, TreeBuilder, XwhError, XwhResult};

use crate::relay::StanzaSource;

/// Reads top-level elements from an XMPP stream.
pub struct StanzaReader<R> {
    reader: Reader<R>,
    builder: TreeBuilder,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> StanzaReader<R> {
    /// Reader for a new stream; the server's `<stream:stream>` comes first.
    pub fn new(inner: R) -> Self {
        Self::with_builder(inner, TreeBuilder::for_stream())
    }

    /// Reader for a stream whose header was already consumed.
    pub fn resume(inner: R) -> Self {
        Self::with_builder(inner, TreeBuilder::for_content())
    }

    fn with_builder(inner: R, builder: TreeBuilder) -> Self {
        let mut reader = Reader::from_reader(inner);
        // `</stream:stream>` closes a tag this reader may never have seen.
        reader.config_mut().check_end_names = false;
        Self {
            reader,
            builder,
            buf: Vec::new(),
        }
    }

    /// Read the server's stream header.
    pub async fn read_header(&mut self) -> XwhResult<Element> {
        loop {
            match self.next_feed().await? {
                Feed::Header(header) => return Ok(header),
                Feed::Pending => {}
                Feed::Stanza(el) => {
                    return Err(XwhError::Negotiation(format!(
                        "expected stream header, got <{}>",
                        el.name()
                    )))
                }
                Feed::StreamEnd => {
                    return Err(XwhError::Transport("stream closed before header".into()))
                }
            }
        }
    }

    /// Next complete stanza, or `None` once the stream has ended cleanly.
    pub async fn read_stanza(&mut self) -> XwhResult<Option<Element>> {
        loop {
            match self.next_feed().await? {
                Feed::Stanza(el) => return Ok(Some(el)),
                Feed::StreamEnd => return Ok(None),
                Feed::Pending => {}
                Feed::Header(_) => {
                    return Err(XwhError::Xml("unexpected stream header mid-stream".into()))
                }
            }
        }
    }

    async fn next_feed(&mut self) -> XwhResult<Feed> {
        self.buf.clear();
        let event = self
            .reader
            .read_event_into_async(&mut self.buf)
            .await
            .map_err(|e| match e {
                quick_xml::Error::Io(io) => XwhError::Transport(io.to_string()),
                other => XwhError::Xml(other.to_string()),
            })?;
        self.builder.feed(event)
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.reader.get_mut()
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> StanzaSource for StanzaReader<R> {
    async fn next_stanza(&mut self) -> XwhResult<Option<Element>> {
        self.read_stanza().await
    }
}
