//! Connection URI parsing.
//!
//! Common URIs:
//! - `qemu:///system` - System-wide QEMU/KVM
//! - `qemu:///session` - User session QEMU
//! - `qemu+ssh://user@host/system` - Remote via SSH
//! - `qemu+unix:///system?socket=/var/run/libvirt/libvirt-sock` - Explicit socket
//! - `test:///default` - In-process mock host

use std::fmt;
use std::str::FromStr;

use crate::error::{ConnectError, Result};

/// A parsed hypervisor connection URI.
///
/// The original string is kept verbatim so `Connection::uri` can echo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectUri {
    raw: String,
    driver: String,
    transport: Option<String>,
    user: Option<String>,
    host: Option<String>,
    path: String,
    query: Option<String>,
}

impl ConnectUri {
    /// Parse a URI of the form `driver[+transport]://[user@][host]/path[?query]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            ConnectError::ConnectionFailed(format!("invalid connection URI '{}': {}", uri, reason))
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing '://'"))?;

        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }
        if !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid("scheme contains invalid characters"));
        }

        let (driver, transport) = match scheme.split_once('+') {
            Some((driver, transport)) if !driver.is_empty() && !transport.is_empty() => {
                (driver.to_lowercase(), Some(transport.to_lowercase()))
            }
            Some(_) => return Err(invalid("malformed driver+transport")),
            None => (scheme.to_lowercase(), None),
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query.to_string())),
            None => (rest, None),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (user, host) = match authority.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, authority),
        };
        let host = (!host.is_empty()).then(|| host.to_string());

        if host.is_none() && path.is_empty() {
            return Err(invalid("missing host and path"));
        }

        Ok(Self {
            raw: uri.to_string(),
            driver,
            transport,
            user,
            host,
            path,
            query,
        })
    }

    /// The URI exactly as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Hypervisor driver name (`qemu`, `test`, `xen`...).
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Transport after the `+`, if any (`ssh`, `tcp`, `unix`, `tls`).
    pub fn transport(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Remote host, `None` for local connections.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// True when the transport encrypts traffic (TLS or SSH).
    pub fn is_encrypted_transport(&self) -> bool {
        matches!(self.transport(), Some("tls") | Some("ssh"))
    }

    /// True when traffic never leaves the host or is encrypted.
    pub fn is_secure_transport(&self) -> bool {
        match self.transport() {
            None | Some("unix") => self.host.is_none() || self.is_encrypted_transport(),
            _ => self.is_encrypted_transport(),
        }
    }
}

impl FromStr for ConnectUri {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self> {
        ConnectUri::parse(s)
    }
}

impl fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
