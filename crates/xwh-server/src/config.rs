//! Relay configuration: TOML file + environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use xwh_core::{Jid, XwhError, XwhResult};

use crate::session::SessionOptions;

pub const ENV_ID: &str = "XMPP_ID";
pub const ENV_PASS: &str = "XMPP_PASS";
pub const ENV_RECIPIENTS: &str = "XMPP_RECIPIENTS";
pub const ENV_SKIP_VERIFY: &str = "XMPP_SKIP_VERIFY";
pub const ENV_OVER_TLS: &str = "XMPP_OVER_TLS";
pub const ENV_LISTEN_ADDRESS: &str = "XMPP_WEBHOOK_LISTEN_ADDRESS";
pub const ENV_SERVER: &str = "XMPP_SERVER";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub xmpp: XmppSection,
    #[serde(default)]
    pub http: HttpSection,
}

/// `[xmpp]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XmppSection {
    pub id: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub direct_tls: bool,
    pub server: Option<String>,
}

/// `[http]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_listen() -> String {
    ":4321".to_string()
}
fn default_queue_capacity() -> usize {
    1
}

/// Resolved relay configuration.
#[derive(Clone)]
pub struct RelayConfig {
    pub identity: Jid,
    pub password: String,
    pub recipients: Vec<String>,
    pub skip_verify: bool,
    pub direct_tls: bool,
    pub server: Option<String>,
    /// `host:port` for the webhook listener; the host may be a name.
    pub listen: String,
    pub queue_capacity: usize,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("identity", &self.identity)
            .field("password", &"<redacted>")
            .field("recipients", &self.recipients)
            .field("skip_verify", &self.skip_verify)
            .field("direct_tls", &self.direct_tls)
            .field("server", &self.server)
            .field("listen", &self.listen)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl RelayConfig {
    /// Load the config file (if present), then apply the process environment.
    pub fn load(config_path: Option<&Path>) -> XwhResult<Self> {
        let file_config = match config_path {
            Some(path) => read_file(&expand_tilde(path))?,
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, |key| {
            std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
        })
    }

    /// Merge `file` with the variables returned by `env`. Environment values
    /// win; presence flags are set by the variable existing at all.
    pub fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> XwhResult<Self> {
        let ConfigFile { xmpp, http } = file;

        let id = env(ENV_ID)
            .or(xmpp.id)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| missing(ENV_ID, "xmpp.id"))?;
        let password = env(ENV_PASS)
            .or(xmpp.password)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| missing(ENV_PASS, "xmpp.password"))?;
        let recipients = match env(ENV_RECIPIENTS) {
            Some(raw) => split_list(&raw),
            None => xmpp
                .recipients
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        };
        if recipients.is_empty() {
            return Err(missing(ENV_RECIPIENTS, "xmpp.recipients"));
        }

        let identity = Jid::parse(id.trim())?;
        let listen = env(ENV_LISTEN_ADDRESS).unwrap_or(http.listen);
        let listen = normalize_listen_address(&listen)?;
        if http.queue_capacity == 0 {
            return Err(XwhError::Config("http.queue_capacity must be at least 1".into()));
        }

        Ok(Self {
            identity,
            password,
            recipients,
            skip_verify: env(ENV_SKIP_VERIFY).is_some() || xmpp.skip_verify,
            direct_tls: env(ENV_OVER_TLS).is_some() || xmpp.direct_tls,
            server: env(ENV_SERVER).or(xmpp.server).filter(|s| !s.is_empty()),
            listen,
            queue_capacity: http.queue_capacity,
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            skip_verify: self.skip_verify,
            direct_tls: self.direct_tls,
            server: self.server.clone(),
        }
    }
}

fn read_file(path: &Path) -> XwhResult<ConfigFile> {
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %path.display(), "loading config file");
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| XwhError::Config(format!("config parse error: {e}")))
}

fn missing(var: &str, key: &str) -> XwhError {
    XwhError::Config(format!("{var} (or {key} in the config file) is required"))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check a `host:port` listen address. The host may be a name, resolved
/// at bind time. An empty host (`:4321`) means all interfaces, IPv4 and
/// IPv6.
pub fn normalize_listen_address(addr: &str) -> XwhResult<String> {
    let addr = addr.trim();
    let invalid = |why: &str| XwhError::Config(format!("invalid listen address {addr:?}: {why}"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    if host.is_empty() {
        Ok(format!("[::]:{port}"))
    } else {
        Ok(addr.to_string())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
