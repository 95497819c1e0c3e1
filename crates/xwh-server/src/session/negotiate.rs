//! Stream negotiation: STARTTLS, SASL and resource binding.
//!
//! Each round opens a stream, reads the server's features and performs one
//! step. STARTTLS and SASL both end the round with a stream restart; binding
//! ends negotiation.

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use xwh_core::message::stanza_id;
use xwh_core::sasl::{self, ChannelBinding, Mechanism, ScramClient};
use xwh_core::stanza::{stream_header, NS_BIND, NS_SASL, NS_TLS};
use xwh_core::{Element, Jid, XwhError, XwhResult};

use super::reader::StanzaReader;
use super::transport::Transport;

pub(crate) type NegotiationReader<T> = StanzaReader<BufReader<T>>;

/// Result of a completed negotiation.
pub(crate) struct Negotiated<T> {
    /// Full JID assigned by the server.
    pub jid: Jid,
    pub reader: NegotiationReader<T>,
}

/// What to do with the features of the current stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    StartTls,
    Authenticate(Vec<String>),
    Bind,
}

/// Pick the next step. Encryption is mandatory: a plaintext stream whose
/// server does not offer STARTTLS is rejected.
pub(crate) fn next_step(features: &Element, secure: bool, authenticated: bool) -> XwhResult<Step> {
    if !secure {
        return if features.has_child("starttls") {
            Ok(Step::StartTls)
        } else {
            Err(XwhError::Negotiation(
                "server does not offer STARTTLS; refusing to continue in plaintext".into(),
            ))
        };
    }
    if !authenticated {
        let mechanisms = features.child("mechanisms").ok_or_else(|| {
            XwhError::Negotiation("server offers no SASL mechanisms".into())
        })?;
        let offered = mechanisms
            .children()
            .filter(|m| m.local_name() == "mechanism")
            .map(|m| m.text().trim().to_string())
            .collect();
        return Ok(Step::Authenticate(offered));
    }
    if features.has_child("bind") {
        Ok(Step::Bind)
    } else {
        Err(XwhError::Negotiation(
            "server does not offer resource binding".into(),
        ))
    }
}

/// Channel binding to announce for `mechanism`.
///
/// `y` is only claimed when the server advertised no `-PLUS` mechanism at
/// all; otherwise a server supporting binding would treat it as a downgrade.
pub(crate) fn channel_binding_for(
    mechanism: Mechanism,
    offered: &[String],
    exporter: Option<Vec<u8>>,
) -> ChannelBinding {
    let server_binds = offered.iter().any(|m| m.ends_with("-PLUS"));
    match exporter {
        Some(data) if mechanism.is_channel_bound() => ChannelBinding::TlsExporter(data),
        Some(_) if !server_binds => ChannelBinding::NotOffered,
        _ => ChannelBinding::Unsupported,
    }
}

/// Run the negotiation rounds until a resource is bound.
pub(crate) async fn negotiate<T: Transport>(
    stream: T,
    identity: &Jid,
    secret: &str,
    connector: &TlsConnector,
) -> XwhResult<Negotiated<T>> {
    let mut stream = stream;
    let mut authenticated = false;

    loop {
        let mut reader = StanzaReader::new(BufReader::new(stream));
        write_str(reader.get_mut(), &stream_header(identity)).await?;
        let header = reader.read_header().await?;
        debug!(stream_id = header.attr("id").unwrap_or_default(), "stream opened");

        let features = expect_stanza(&mut reader).await?;
        if features.local_name() != "features" {
            return Err(XwhError::Negotiation(format!(
                "expected stream features, got <{}>",
                features.name()
            )));
        }

        let secure = reader.get_ref().get_ref().is_secure();
        match next_step(&features, secure, authenticated)? {
            Step::StartTls => {
                send(reader.get_mut(), &Element::new("starttls").with_attr("xmlns", NS_TLS))
                    .await?;
                let reply = expect_stanza(&mut reader).await?;
                if reply.local_name() != "proceed" {
                    return Err(XwhError::Negotiation(format!(
                        "server refused STARTTLS with <{}>",
                        reply.name()
                    )));
                }
                stream = reader
                    .into_inner()
                    .into_inner()
                    .upgrade(connector, identity.domain())
                    .await?;
                info!("STARTTLS complete");
            }
            Step::Authenticate(offered) => {
                let exporter = reader.get_ref().get_ref().channel_binding();
                authenticate(&mut reader, identity, secret, &offered, exporter).await?;
                authenticated = true;
                stream = reader.into_inner().into_inner();
            }
            Step::Bind => {
                let jid = bind(&mut reader, identity).await?;
                return Ok(Negotiated { jid, reader });
            }
        }
    }
}

async fn authenticate<T: Transport>(
    reader: &mut NegotiationReader<T>,
    identity: &Jid,
    secret: &str,
    offered: &[String],
    exporter: Option<Vec<u8>>,
) -> XwhResult<()> {
    let username = identity
        .local()
        .ok_or_else(|| XwhError::AuthFailed(format!("{identity} has no local part")))?;
    let mechanism = Mechanism::select(offered, exporter.is_some()).ok_or_else(|| {
        XwhError::AuthFailed(format!("no supported mechanism among {offered:?}"))
    })?;
    info!(mechanism = mechanism.name(), "authenticating");

    let Some(hash) = mechanism.scram_hash() else {
        let initial = sasl::plain_initial(username, secret);
        send(reader.get_mut(), &auth_element(mechanism, &initial)).await?;
        return match read_sasl_reply(reader).await? {
            SaslReply::Success(_) => Ok(()),
            SaslReply::Challenge(_) => Err(XwhError::Sasl("unexpected challenge for PLAIN".into())),
        };
    };

    let binding = channel_binding_for(mechanism, offered, exporter);
    let mut scram = ScramClient::new(hash, username, secret, binding)?;
    send(
        reader.get_mut(),
        &auth_element(mechanism, scram.client_first().as_bytes()),
    )
    .await?;

    let server_first = match read_sasl_reply(reader).await? {
        SaslReply::Challenge(data) => utf8(data)?,
        SaslReply::Success(_) => {
            return Err(XwhError::Sasl("server skipped the SCRAM challenge".into()))
        }
    };
    let client_final = scram.handle_server_first(&server_first)?;
    send(reader.get_mut(), &response_element(client_final.as_bytes())).await?;

    match read_sasl_reply(reader).await? {
        SaslReply::Success(data) => scram.verify_server_final(&utf8(data)?),
        SaslReply::Challenge(data) => {
            scram.verify_server_final(&utf8(data)?)?;
            send(reader.get_mut(), &response_element(&[])).await?;
            match read_sasl_reply(reader).await? {
                SaslReply::Success(_) => Ok(()),
                SaslReply::Challenge(_) => {
                    Err(XwhError::Sasl("unexpected extra challenge".into()))
                }
            }
        }
    }
}

enum SaslReply {
    Challenge(Vec<u8>),
    Success(Vec<u8>),
}

async fn read_sasl_reply<T: Transport>(
    reader: &mut NegotiationReader<T>,
) -> XwhResult<SaslReply> {
    let reply = expect_stanza(reader).await?;
    match reply.local_name() {
        "challenge" => Ok(SaslReply::Challenge(sasl::decode_payload(&reply.text())?)),
        "success" => Ok(SaslReply::Success(sasl::decode_payload(&reply.text())?)),
        "failure" => Err(XwhError::AuthFailed(failure_reason(&reply))),
        other => Err(XwhError::Negotiation(format!(
            "unexpected <{other}> during authentication"
        ))),
    }
}

/// `condition: text` from a SASL `<failure>` element.
fn failure_reason(failure: &Element) -> String {
    let condition = failure
        .children()
        .find(|c| c.local_name() != "text")
        .map_or("unknown-failure", Element::local_name);
    match failure.child("text").map(Element::text) {
        Some(text) if !text.is_empty() => format!("{condition}: {text}"),
        _ => condition.to_string(),
    }
}

fn auth_element(mechanism: Mechanism, initial: &[u8]) -> Element {
    Element::new("auth")
        .with_attr("xmlns", NS_SASL)
        .with_attr("mechanism", mechanism.name())
        .with_text(sasl::encode_payload(initial))
}

fn response_element(data: &[u8]) -> Element {
    let el = Element::new("response").with_attr("xmlns", NS_SASL);
    if data.is_empty() {
        el
    } else {
        el.with_text(sasl::encode_payload(data))
    }
}

async fn bind<T: Transport>(
    reader: &mut NegotiationReader<T>,
    identity: &Jid,
) -> XwhResult<Jid> {
    let mut request = Element::new("bind").with_attr("xmlns", NS_BIND);
    if let Some(resource) = identity.resource() {
        request = request.with_child(Element::new("resource").with_text(resource));
    }
    let id = stanza_id();
    let iq = Element::new("iq")
        .with_attr("type", "set")
        .with_attr("id", id.as_str())
        .with_child(request);
    send(reader.get_mut(), &iq).await?;

    loop {
        let reply = expect_stanza(reader).await?;
        if reply.local_name() != "iq" || reply.attr("id") != Some(id.as_str()) {
            debug!(stanza = reply.name(), "ignoring stanza while binding");
            continue;
        }
        if reply.attr("type") != Some("result") {
            let condition = reply
                .child("error")
                .and_then(|e| e.children().find(|c| c.local_name() != "text"))
                .map_or("unknown-error", Element::local_name);
            return Err(XwhError::Negotiation(format!(
                "resource binding failed: {condition}"
            )));
        }
        let jid = reply
            .child("bind")
            .and_then(|b| b.child("jid"))
            .map(Element::text)
            .ok_or_else(|| XwhError::Negotiation("bind result without jid".into()))?;
        let jid = Jid::parse(jid.trim())?;
        info!(jid = %jid, "resource bound");
        return Ok(jid);
    }
}

/// Next stanza during negotiation; the stream ending or a stream error is
/// fatal here.
async fn expect_stanza<T: Transport>(
    reader: &mut NegotiationReader<T>,
) -> XwhResult<Element> {
    let stanza = reader
        .read_stanza()
        .await?
        .ok_or_else(|| XwhError::Transport("stream closed during negotiation".into()))?;
    if stanza.local_name() == "error" {
        let condition = stanza
            .children()
            .find(|c| c.local_name() != "text")
            .map_or("undefined-condition", Element::local_name);
        return Err(XwhError::Negotiation(format!("stream error: {condition}")));
    }
    Ok(stanza)
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, element: &Element) -> XwhResult<()> {
    write_str(writer, &element.to_xml()).await
}

async fn write_str<W: AsyncWrite + Unpin>(writer: &mut W, data: &str) -> XwhResult<()> {
    writer.write_all(data.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn utf8(data: Vec<u8>) -> XwhResult<String> {
    String::from_utf8(data).map_err(|_| XwhError::Sasl("non-utf8 SASL payload".into()))
}
