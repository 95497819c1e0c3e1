use thiserror::Error;

/// Errors produced by the xmpp-webhook protocol layer.
#[derive(Debug, Error)]
pub enum XwhError {
    #[error("invalid address: {0}")]
    Address(String),

    #[error("xml error: {0}")]
    Xml(String),

    #[error("sasl error: {0}")]
    Sasl(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("alert queue closed")]
    QueueClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for XwhError {
    fn from(e: serde_json::Error) -> Self {
        XwhError::Parse(e.to_string())
    }
}

impl From<base64::DecodeError> for XwhError {
    fn from(e: base64::DecodeError) -> Self {
        XwhError::Sasl(format!("invalid base64: {e}"))
    }
}

pub type XwhResult<T> = Result<T, XwhError>;
