//! Proxy Links
//!
//! When two hosts cannot replicate directly, traffic is relayed by a
//! drbd-proxy process. The proxy listens on an inside endpoint for the
//! local DRBD and on an outside endpoint for the remote proxy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An IP:port pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.contains(':')
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_address(&self.ip, self.port))
    }
}

/// Render an address the way the DRBD grammar expects it:
/// `10.0.0.1:7788` or `ipv6 [fd00::1]:7788`
pub fn format_address(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("ipv6 [{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

/// Relay configuration for one resource on one DRBD host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyLink {
    /// Host running the relay
    pub proxy_host: String,
    /// Endpoint the local DRBD connects to
    pub inside: Endpoint,
    /// Endpoint the remote proxy connects to
    pub outside: Endpoint,
}

impl ProxyLink {
    pub fn new(proxy_host: impl Into<String>, inside: Endpoint, outside: Endpoint) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            inside,
            outside,
        }
    }
}
