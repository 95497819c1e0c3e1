//! Session manager: the single XMPP client session of the relay.
//!
//! Opening a session dials the server, negotiates TLS, SASL and a resource,
//! announces availability, and splits the stream. The read half goes to
//! the inbound dispatcher; the write half stays here behind one lock and is
//! shared by everything that sends.

pub mod negotiate;
pub mod reader;
pub mod transport;
pub mod writer;

pub use reader::StanzaReader;
pub use transport::{Transport, XmppStream};
pub use writer::StanzaWriter;

use async_trait::async_trait;
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use xwh_core::stanza::STREAM_FOOTER;
use xwh_core::{Delivery, Element, Jid, XwhResult};

use crate::relay::DeliverySink;

type SessionStream = BufReader<XmppStream>;

/// Incoming stanza stream of an open session.
pub type Inbound = StanzaReader<BufReader<ReadHalf<SessionStream>>>;

/// How to reach and secure the server.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Accept any server certificate.
    pub skip_verify: bool,
    /// Start TLS at connect time instead of via STARTTLS.
    pub direct_tls: bool,
    /// Explicit `host:port` to dial, skipping SRV discovery.
    pub server: Option<String>,
}

/// A live, authenticated client session.
pub struct XmppSession {
    jid: Jid,
    writer: StanzaWriter<WriteHalf<SessionStream>>,
}

impl XmppSession {
    /// Connect and authenticate as `identity`. Any failure is returned as is;
    /// there is no retry.
    pub async fn open(
        identity: &Jid,
        secret: &str,
        options: &SessionOptions,
    ) -> XwhResult<(Self, Inbound)> {
        let connector = transport::tls_connector(options)?;
        let stream = transport::dial(identity, options, &connector).await?;
        let established = establish(stream, identity, secret, &connector).await?;
        info!(jid = %established.jid, "session established");
        Ok((
            Self {
                jid: established.jid,
                writer: established.writer,
            },
            established.inbound,
        ))
    }

    /// Full JID bound by the server.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// Close the stream, then the transport. Failures are logged only.
    pub async fn close(&self) {
        if let Err(e) = self.writer.write_raw(STREAM_FOOTER).await {
            warn!(error = %e, "failed to close XMPP stream");
        }
        if let Err(e) = self.writer.shutdown().await {
            warn!(error = %e, "failed to close transport");
        }
        info!(jid = %self.jid, "session closed");
    }
}

/// A negotiated stream, split and announced as available.
pub(crate) struct Established<T> {
    pub jid: Jid,
    pub writer: StanzaWriter<WriteHalf<BufReader<T>>>,
    pub inbound: StanzaReader<BufReader<ReadHalf<BufReader<T>>>>,
}

/// Negotiate over an open transport, split it and send initial presence.
pub(crate) async fn establish<T: Transport>(
    stream: T,
    identity: &Jid,
    secret: &str,
    connector: &TlsConnector,
) -> XwhResult<Established<T>> {
    let negotiated = negotiate::negotiate(stream, identity, secret, connector).await?;

    let (read_half, write_half) = tokio::io::split(negotiated.reader.into_inner());
    let writer = StanzaWriter::new(write_half);
    writer.send(&Element::new("presence")).await?;
    debug!("initial presence sent");

    Ok(Established {
        jid: negotiated.jid,
        writer,
        inbound: StanzaReader::resume(BufReader::new(read_half)),
    })
}

#[async_trait]
impl DeliverySink for XmppSession {
    async fn deliver(&self, delivery: &Delivery) -> XwhResult<()> {
        self.writer.deliver(delivery).await
    }
}
