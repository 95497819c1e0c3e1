//! TCP dialing and TLS for the XMPP client stream.
//!
//! The stream starts as plain TCP and is upgraded in place by STARTTLS, or
//! is TLS from the first byte when direct TLS is requested. The server is
//! found through the domain's SRV records, falling back to the domain.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use xwh_core::sasl::{TLS_EXPORTER_LABEL, TLS_EXPORTER_LEN};
use xwh_core::{Jid, XwhError, XwhResult};

use super::SessionOptions;

/// Standard client port for STARTTLS.
pub const DEFAULT_PORT: u16 = 5222;

/// Standard client port for direct TLS.
pub const DEFAULT_TLS_PORT: u16 = 5223;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// ALPN protocol id for direct TLS client connections (XEP-0368).
const ALPN_XMPP_CLIENT: &[u8] = b"xmpp-client";

/// A byte stream the session can negotiate over.
#[async_trait]
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sized {
    fn is_secure(&self) -> bool;

    /// `tls-exporter` channel binding data, when the stream has any.
    fn channel_binding(&self) -> Option<Vec<u8>>;

    /// Wrap the stream in TLS. Fails if it already is.
    async fn upgrade(self, connector: &TlsConnector, domain: &str) -> XwhResult<Self>;
}

/// A client stream, either plain TCP or TLS over TCP.
pub enum XmppStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

#[async_trait]
impl Transport for XmppStream {
    fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    async fn upgrade(self, connector: &TlsConnector, domain: &str) -> XwhResult<Self> {
        match self {
            Self::Plain(tcp) => {
                let tls = tls_handshake(connector, domain, tcp).await?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(XwhError::Tls("stream is already encrypted".into())),
        }
    }

    /// Only available on TLS 1.3, where the exporter is unique to the
    /// connection.
    fn channel_binding(&self) -> Option<Vec<u8>> {
        let Self::Tls(tls) = self else {
            return None;
        };
        let (_, conn) = tls.get_ref();
        if conn.protocol_version() != Some(rustls::ProtocolVersion::TLSv1_3) {
            return None;
        }
        match conn.export_keying_material([0u8; TLS_EXPORTER_LEN], TLS_EXPORTER_LABEL, None) {
            Ok(data) => Some(data.to_vec()),
            Err(e) => {
                warn!(error = %e, "TLS exporter unavailable");
                None
            }
        }
    }
}

impl AsyncRead for XmppStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for XmppStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn default_port(options: &SessionOptions) -> u16 {
    if options.direct_tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PORT
    }
}

/// `host[:port]` given explicitly instead of discovering the server.
pub fn server_override(server: &str) -> XwhResult<(String, u16)> {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| XwhError::Config(format!("invalid port in server address {server:?}")))?;
            Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
        }
        Some(_) => Err(XwhError::Config(format!("invalid server address {server:?}"))),
        None => Ok((server.to_string(), DEFAULT_PORT)),
    }
}

/// The identity's domain on the standard port for the chosen TLS mode.
pub fn fallback_target(identity: &Jid, options: &SessionOptions) -> (String, u16) {
    (identity.domain().to_string(), default_port(options))
}

/// Hosts to try, in order: the explicit override, else the domain's SRV
/// records, else the domain itself.
pub async fn dial_targets(
    identity: &Jid,
    options: &SessionOptions,
) -> XwhResult<Vec<(String, u16)>> {
    if let Some(server) = options.server.as_deref() {
        return Ok(vec![server_override(server)?]);
    }
    let domain = identity.domain();
    if domain.parse::<IpAddr>().is_ok() {
        return Ok(vec![fallback_target(identity, options)]);
    }
    match lookup_srv(domain, options.direct_tls).await? {
        Some(targets) => Ok(targets),
        None => Ok(vec![fallback_target(identity, options)]),
    }
}

/// One SRV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub host: String,
    pub port: u16,
}

/// `Ok(None)` when the domain publishes no usable records.
async fn lookup_srv(
    domain: &str,
    direct_tls: bool,
) -> XwhResult<Option<Vec<(String, u16)>>> {
    let service = if direct_tls { "_xmpps-client" } else { "_xmpp-client" };
    let name = format!("{service}._tcp.{domain}.");

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!(error = %e, "no system resolver, skipping SRV lookup");
            return Ok(None);
        }
    };
    let lookup = match resolver.srv_lookup(name.as_str()).await {
        Ok(lookup) => lookup,
        Err(e) => {
            debug!(name = %name, error = %e, "SRV lookup failed");
            return Ok(None);
        }
    };

    let records: Vec<SrvTarget> = lookup
        .iter()
        .map(|srv| SrvTarget {
            priority: srv.priority(),
            weight: srv.weight(),
            host: srv.target().to_utf8().trim_end_matches('.').to_string(),
            port: srv.port(),
        })
        .collect();
    if records.is_empty() {
        return Ok(None);
    }
    if records.iter().all(|r| r.host.is_empty()) {
        return Err(XwhError::Transport(format!(
            "{domain} does not offer {service} service"
        )));
    }
    let targets = order_srv(
        records.into_iter().filter(|r| !r.host.is_empty()).collect(),
        &mut rand::thread_rng(),
    );
    debug!(name = %name, targets = ?targets, "SRV targets");
    Ok(Some(targets))
}

/// Order SRV records for connection attempts (RFC 2782): ascending
/// priority, weighted random order within a priority.
pub fn order_srv<R: Rng + ?Sized>(
    mut records: Vec<SrvTarget>,
    rng: &mut R,
) -> Vec<(String, u16)> {
    records.sort_by_key(|r| r.priority);
    let mut ordered = Vec::with_capacity(records.len());
    while !records.is_empty() {
        let priority = records[0].priority;
        let end = records
            .iter()
            .position(|r| r.priority != priority)
            .unwrap_or(records.len());
        let mut group: Vec<SrvTarget> = records.drain(..end).collect();
        // Zero-weight records go first so they keep a small chance.
        group.sort_by_key(|r| r.weight != 0);
        while !group.is_empty() {
            let total: u32 = group.iter().map(|r| u32::from(r.weight)).sum();
            let pick = rng.gen_range(0..=total);
            let mut running = 0;
            let index = group
                .iter()
                .position(|r| {
                    running += u32::from(r.weight);
                    running >= pick
                })
                .unwrap_or(0);
            let chosen = group.remove(index);
            ordered.push((chosen.host, chosen.port));
        }
    }
    ordered
}

/// Open the transport for `identity`, trying each target in turn and
/// performing the TLS handshake right away when direct TLS is requested.
pub async fn dial(
    identity: &Jid,
    options: &SessionOptions,
    connector: &TlsConnector,
) -> XwhResult<XmppStream> {
    let targets = dial_targets(identity, options).await?;
    let mut last_error = None;
    for (host, port) in &targets {
        match connect(host, *port).await {
            Ok(tcp) => {
                return if options.direct_tls {
                    let tls = tls_handshake(connector, identity.domain(), tcp).await?;
                    Ok(XmppStream::Tls(Box::new(tls)))
                } else {
                    Ok(XmppStream::Plain(tcp))
                };
            }
            Err(e) => {
                warn!(host = %host, port, error = %e, "connect failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| XwhError::Transport("no server to dial".into())))
}

async fn connect(host: &str, port: u16) -> XwhResult<TcpStream> {
    debug!(host = %host, port, "dialing");
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| XwhError::Transport(format!("connect to {host}:{port} timed out")))?
        .map_err(|e| XwhError::Transport(format!("connect to {host}:{port} failed: {e}")))?;
    tcp.set_nodelay(true)?;

    info!(
        host = %host,
        port,
        remote = %tcp.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
        "connected"
    );
    Ok(tcp)
}

async fn tls_handshake(
    connector: &TlsConnector,
    domain: &str,
    tcp: TcpStream,
) -> XwhResult<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| XwhError::Tls(format!("invalid server name {domain:?}: {e}")))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| XwhError::Tls(format!("handshake with {domain} failed: {e}")))?;
    debug!(
        version = ?tls.get_ref().1.protocol_version(),
        "TLS established"
    );
    Ok(tls)
}

/// Build the TLS connector. Certificates are checked against the platform
/// trust store unless `skip_verify` is set.
pub fn tls_connector(options: &SessionOptions) -> XwhResult<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| XwhError::Tls(format!("TLS config error: {e}")))?;

    let mut config = if options.skip_verify {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            warn!(error = %e, "failed to load a platform certificate");
        }
        let mut roots = rustls::RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, ignored, "loaded platform trust roots");
        if roots.is_empty() {
            return Err(XwhError::Tls("no trusted root certificates found".into()));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    if options.direct_tls {
        config.alpn_protocols = vec![ALPN_XMPP_CLIENT.to_vec()];
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts any server certificate.
///
/// Only installed when verification is explicitly disabled.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
