//! XMPP addresses (JIDs).
//!
//! A JID has the textual form `local@domain/resource`. The local part and
//! resource are optional; the domain is not. Local part and domain are
//! case-folded on parse so that two spellings of the same account compare
//! equal. The resource is kept verbatim.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{XwhError, XwhResult};

/// Maximum length of each JID part, in bytes.
const MAX_PART_LEN: usize = 1023;

/// Characters that may never appear in a local part.
const LOCAL_FORBIDDEN: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

/// A validated XMPP address.
///
/// Equality and hashing ignore the resource, so `a@b.com/phone` and
/// `a@b.com/desk` are the same key. Compare `to_string()` when the full
/// address matters.
#[derive(Debug, Clone)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse and validate a JID from its textual form.
    pub fn parse(s: &str) -> XwhResult<Self> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match rest.rsplit_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, rest),
        };

        let domain = domain.strip_suffix('.').unwrap_or(domain);
        if domain.is_empty() {
            return Err(XwhError::Address(format!("{s:?}: empty domain")));
        }
        if domain.len() > MAX_PART_LEN {
            return Err(XwhError::Address(format!("{s:?}: domain too long")));
        }
        if domain.chars().any(|c| c.is_whitespace() || c == '@' || c == '/') {
            return Err(XwhError::Address(format!("{s:?}: invalid character in domain")));
        }

        if let Some(local) = local {
            if local.is_empty() {
                return Err(XwhError::Address(format!("{s:?}: empty local part")));
            }
            if local.len() > MAX_PART_LEN {
                return Err(XwhError::Address(format!("{s:?}: local part too long")));
            }
            if local
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || LOCAL_FORBIDDEN.contains(&c))
            {
                return Err(XwhError::Address(format!(
                    "{s:?}: invalid character in local part"
                )));
            }
        }

        if let Some(resource) = resource {
            if resource.is_empty() {
                return Err(XwhError::Address(format!("{s:?}: empty resource")));
            }
            if resource.len() > MAX_PART_LEN {
                return Err(XwhError::Address(format!("{s:?}: resource too long")));
            }
        }

        Ok(Self {
            local: local.map(str::to_lowercase),
            domain: domain.to_lowercase(),
            resource: resource.map(str::to_string),
        })
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// This address with the resource removed.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// Compare two addresses ignoring their resources.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        self.local == other.local && self.domain == other.domain
    }

    /// Replace the resource.
    pub fn with_resource(&self, resource: &str) -> XwhResult<Jid> {
        let mut s = self.bare().to_string();
        s.push('/');
        s.push_str(resource);
        Jid::parse(&s)
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        self.bare_eq(other)
    }
}

impl Eq for Jid {}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.local.hash(state);
        self.domain.hash(state);
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{local}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = XwhError;

    fn from_str(s: &str) -> XwhResult<Self> {
        Jid::parse(s)
    }
}
