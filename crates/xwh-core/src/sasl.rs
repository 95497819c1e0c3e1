//! SASL client mechanisms: SCRAM (RFC 5802, RFC 7677) with optional
//! `tls-exporter` channel binding (RFC 9266), and PLAIN.
//!
//! Mechanisms are tried strongest first; see [`Mechanism::PREFERENCE`].

use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};

use crate::error::{XwhError, XwhResult};

/// Exporter label for `tls-exporter` channel binding.
pub const TLS_EXPORTER_LABEL: &[u8] = b"EXPORTER-Channel-Binding";

/// Length of the exported channel binding data.
pub const TLS_EXPORTER_LEN: usize = 32;

/// Supported SASL mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha256Plus,
    ScramSha256,
    ScramSha1Plus,
    ScramSha1,
    Plain,
}

impl Mechanism {
    /// Client preference, strongest first.
    pub const PREFERENCE: [Mechanism; 5] = [
        Mechanism::ScramSha256Plus,
        Mechanism::ScramSha256,
        Mechanism::ScramSha1Plus,
        Mechanism::ScramSha1,
        Mechanism::Plain,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::ScramSha256Plus => "SCRAM-SHA-256-PLUS",
            Mechanism::ScramSha256 => "SCRAM-SHA-256",
            Mechanism::ScramSha1Plus => "SCRAM-SHA-1-PLUS",
            Mechanism::ScramSha1 => "SCRAM-SHA-1",
            Mechanism::Plain => "PLAIN",
        }
    }

    pub fn is_channel_bound(&self) -> bool {
        matches!(self, Mechanism::ScramSha256Plus | Mechanism::ScramSha1Plus)
    }

    pub fn scram_hash(&self) -> Option<ScramHash> {
        match self {
            Mechanism::ScramSha256Plus | Mechanism::ScramSha256 => Some(ScramHash::Sha256),
            Mechanism::ScramSha1Plus | Mechanism::ScramSha1 => Some(ScramHash::Sha1),
            Mechanism::Plain => None,
        }
    }

    /// Pick the strongest mechanism the server offers. Channel-bound
    /// variants are only eligible when binding data is available.
    pub fn select<S: AsRef<str>>(offered: &[S], channel_binding: bool) -> Option<Mechanism> {
        Self::PREFERENCE
            .into_iter()
            .filter(|m| channel_binding || !m.is_channel_bound())
            .find(|m| offered.iter().any(|o| o.as_ref() == m.name()))
    }
}

/// Channel binding state for the GS2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBinding {
    /// Client cannot bind (`n`).
    Unsupported,
    /// Client could bind but the server offered no `-PLUS` mechanism (`y`).
    NotOffered,
    /// Bind to the TLS exporter output (`p=tls-exporter`).
    TlsExporter(Vec<u8>),
}

impl ChannelBinding {
    fn gs2_header(&self) -> &'static str {
        match self {
            ChannelBinding::Unsupported => "n,,",
            ChannelBinding::NotOffered => "y,,",
            ChannelBinding::TlsExporter(_) => "p=tls-exporter,,",
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            ChannelBinding::TlsExporter(data) => data,
            _ => &[],
        }
    }
}

/// Hash function underlying a SCRAM mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

impl ScramHash {
    fn output_len(&self) -> usize {
        match self {
            ScramHash::Sha1 => 20,
            ScramHash::Sha256 => 32,
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let algorithm = match self {
            ScramHash::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            ScramHash::Sha256 => hmac::HMAC_SHA256,
        };
        hmac::sign(&hmac::Key::new(algorithm, key), data)
            .as_ref()
            .to_vec()
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let algorithm = match self {
            ScramHash::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            ScramHash::Sha256 => &digest::SHA256,
        };
        digest::digest(algorithm, data).as_ref().to_vec()
    }

    fn salted_password(&self, password: &[u8], salt: &[u8], iterations: NonZeroU32) -> Vec<u8> {
        let algorithm = match self {
            ScramHash::Sha1 => pbkdf2::PBKDF2_HMAC_SHA1,
            ScramHash::Sha256 => pbkdf2::PBKDF2_HMAC_SHA256,
        };
        let mut out = vec![0u8; self.output_len()];
        pbkdf2::derive(algorithm, iterations, salt, password, &mut out);
        out
    }
}

enum ScramState {
    Initial,
    AwaitingServerFinal { server_signature: Vec<u8> },
    Done,
}

/// Client side of a SCRAM exchange.
pub struct ScramClient {
    hash: ScramHash,
    username: String,
    password: String,
    binding: ChannelBinding,
    client_nonce: String,
    state: ScramState,
}

impl ScramClient {
    pub fn new(
        hash: ScramHash,
        username: &str,
        password: &str,
        binding: ChannelBinding,
    ) -> XwhResult<Self> {
        let mut raw = [0u8; 18];
        SystemRandom::new()
            .fill(&mut raw)
            .map_err(|_| XwhError::Sasl("failed to generate client nonce".into()))?;
        Ok(Self::with_nonce(hash, username, password, binding, &BASE64.encode(raw)))
    }

    /// Construct with a fixed client nonce.
    pub fn with_nonce(
        hash: ScramHash,
        username: &str,
        password: &str,
        binding: ChannelBinding,
        nonce: &str,
    ) -> Self {
        Self {
            hash,
            username: username.to_string(),
            password: password.to_string(),
            binding,
            client_nonce: nonce.to_string(),
            state: ScramState::Initial,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_username(&self.username), self.client_nonce)
    }

    /// The initial client message (GS2 header + client-first-bare).
    pub fn client_first(&self) -> String {
        format!("{}{}", self.binding.gs2_header(), self.client_first_bare())
    }

    /// Process the server-first message and produce the client-final message.
    pub fn handle_server_first(&mut self, server_first: &str) -> XwhResult<String> {
        if !matches!(self.state, ScramState::Initial) {
            return Err(XwhError::Sasl("unexpected server-first message".into()));
        }

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(BASE64.decode(v)?),
                Some(("i", v)) => {
                    iterations = Some(v.parse::<u32>().map_err(|_| {
                        XwhError::Sasl(format!("invalid iteration count {v:?}"))
                    })?)
                }
                Some(("m", _)) => {
                    return Err(XwhError::Sasl("unsupported mandatory extension".into()))
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or_else(|| XwhError::Sasl("server-first without nonce".into()))?;
        let salt = salt.ok_or_else(|| XwhError::Sasl("server-first without salt".into()))?;
        let iterations = iterations
            .and_then(NonZeroU32::new)
            .ok_or_else(|| XwhError::Sasl("missing or zero iteration count".into()))?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(XwhError::Sasl("server nonce does not extend client nonce".into()));
        }

        let mut cbind_input = self.binding.gs2_header().as_bytes().to_vec();
        cbind_input.extend_from_slice(self.binding.data());
        let without_proof = format!("c={},r={}", BASE64.encode(&cbind_input), nonce);

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let salted = self
            .hash
            .salted_password(self.password.as_bytes(), &salt, iterations);
        let client_key = self.hash.hmac(&salted, b"Client Key");
        let stored_key = self.hash.digest(&client_key);
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(k, s)| k ^ s)
            .collect();
        let server_key = self.hash.hmac(&salted, b"Server Key");
        let server_signature = self.hash.hmac(&server_key, auth_message.as_bytes());

        self.state = ScramState::AwaitingServerFinal { server_signature };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the server-final message. Fails on a server error or a
    /// signature mismatch.
    pub fn verify_server_final(&mut self, server_final: &str) -> XwhResult<()> {
        let expected = match std::mem::replace(&mut self.state, ScramState::Done) {
            ScramState::AwaitingServerFinal { server_signature } => server_signature,
            _ => return Err(XwhError::Sasl("unexpected server-final message".into())),
        };
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(XwhError::AuthFailed(err.to_string()));
        }
        let verifier = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| XwhError::Sasl("server-final without verifier".into()))?;
        if BASE64.decode(verifier)? != expected {
            return Err(XwhError::AuthFailed("server signature mismatch".into()));
        }
        Ok(())
    }
}

/// PLAIN initial response: `authzid \0 authcid \0 password` with empty authzid.
pub fn plain_initial(username: &str, password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() + password.len() + 2);
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(password.as_bytes());
    out
}

/// Encode a SASL payload for an XMPP `<auth>`/`<response>` element. An
/// empty payload is sent as `=`.
pub fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64.encode(data)
    }
}

/// Decode the text of a `<challenge>`/`<success>` element.
pub fn decode_payload(text: &str) -> XwhResult<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Ok(BASE64.decode(text)?)
}

fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}
