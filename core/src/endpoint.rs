//! Value types passed between the candidate generator, the probe engine, the
//! cache and the locator.

use crate::error::LocatorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use time::OffsetDateTime;
use url::Url;

/// A host/port pair worth probing. Generated fresh for every discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Candidate { host: host.into(), port }
    }

    pub fn base_url(&self) -> String {
        http_base_url(&self.host, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&authority(&self.host, self.port))
    }
}

/// Where the client runs from: the equivalent of the browser's current location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    /// The front-end is served by the backend itself (production deployment).
    #[serde(default)]
    pub same_origin: bool,
}

impl PageContext {
    pub fn new(hostname: impl Into<String>) -> Self {
        PageContext { scheme: "http".into(), hostname: hostname.into(), port: None, same_origin: false }
    }

    /// Parse a page URL such as `http://192.168.1.20:8080/player`.
    pub fn from_url(raw: &str) -> Result<Self, LocatorError> {
        let url = Url::parse(raw).map_err(|e| LocatorError::Config(format!("invalid origin url {}: {}", raw, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| LocatorError::Config(format!("origin url has no host: {}", raw)))?;
        Ok(PageContext {
            scheme: url.scheme().to_string(),
            hostname: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: url.port(),
            same_origin: false,
        })
    }

    pub fn with_same_origin(mut self, same_origin: bool) -> Self {
        self.same_origin = same_origin;
        self
    }

    /// `scheme://hostname[:port]`
    pub fn origin(&self) -> String {
        match self.port {
            Some(p) => format!("{}://{}", self.scheme, authority(&self.hostname, p)),
            None if self.hostname.contains(':') => format!("{}://[{}]", self.scheme, self.hostname),
            None => format!("{}://{}", self.scheme, self.hostname),
        }
    }

    /// Key the cache uses to detect that the page is now opened from elsewhere.
    pub fn origin_key(&self) -> &str {
        &self.hostname
    }

    /// Port the page is served on, falling back to the scheme default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.scheme == "https" { 443 } else { 80 })
    }

    pub fn is_loopback(&self) -> bool {
        is_loopback_host(&self.hostname)
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// `host:port`, bracketing IPv6 literals.
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

pub fn http_base_url(host: &str, port: u16) -> String {
    format!("http://{}", authority(host, port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    SameOrigin,
    Cache,
    Discovered,
}

impl fmt::Display for EndpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSource::SameOrigin => write!(f, "same-origin"),
            EndpointSource::Cache => write!(f, "cache"),
            EndpointSource::Discovered => write!(f, "discovered"),
        }
    }
}

/// A backend address confirmed live by a probe (or by the same-origin shortcut).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub confirmed_at: OffsetDateTime,
    pub source: EndpointSource,
}

impl ResolvedEndpoint {
    pub fn probed(host: impl Into<String>, port: u16, source: EndpointSource) -> Self {
        let host = host.into();
        let base_url = http_base_url(&host, port);
        ResolvedEndpoint { host, port, base_url, confirmed_at: OffsetDateTime::now_utc(), source }
    }

    pub fn same_origin(ctx: &PageContext) -> Self {
        ResolvedEndpoint {
            host: ctx.hostname.clone(),
            port: ctx.effective_port(),
            base_url: ctx.origin(),
            confirmed_at: OffsetDateTime::now_utc(),
            source: EndpointSource::SameOrigin,
        }
    }

    /// Same host and port with the realtime protocol substituted.
    pub fn ws_url(&self, path: &str) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        join_path(&base, path)
    }
}

pub fn join_path(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Body returned by the backend health endpoint. Only used to confirm identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
}

impl HealthResponse {
    pub fn is_recognized(&self) -> bool {
        self.status.as_deref() == Some("healthy") || self.module.is_some()
    }
}
