use std::{borrow::Cow, fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::tunneler::tunnel::protocol::Protocol;

/// Normalize a bind/listen address.
///
/// Tunnel specs and config commonly use a bare `"PORT"` or the shorthand `":PORT"` to mean
/// "bind on all interfaces". Tokio bind APIs accept neither, so both become `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_digit()) {
        Cow::Owned(format!("0.0.0.0:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[derive(Debug, Error)]
#[error("invalid tunnel format {0:?} (expected [bind_host:]bind_port:connect_host:connect_port)")]
pub struct TunnelSpecError(String);

/// A `-L`/`-R` argument: where to listen and where to forward to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub protocol: Protocol,
    /// `port` or `host:port`.
    pub bind: String,
    /// `host:port`.
    pub connect: String,
}

fn tunnel_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^((?:[^:]+:)?[^:]+):([^:]+:[^:]+)$").expect("tunnel regex"))
}

impl TunnelSpec {
    pub fn parse(protocol: Protocol, s: &str) -> Result<Self, TunnelSpecError> {
        let s = s.trim();
        let caps = tunnel_regex()
            .captures(s)
            .ok_or_else(|| TunnelSpecError(s.to_string()))?;
        Ok(Self {
            protocol,
            bind: caps[1].to_string(),
            connect: caps[2].to_string(),
        })
    }
}

impl FromStr for TunnelSpec {
    type Err = TunnelSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(Protocol::Tcp, s)
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{} -> {}", self.protocol, self.bind, self.connect)
    }
}
