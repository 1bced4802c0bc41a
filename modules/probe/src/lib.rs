//! Bounded liveness probe against a single backend candidate.
//!
//! Every failure mode (timeout, refused connection, bad status, unparseable or
//! unrecognized body) resolves to a negative outcome; nothing is raised past
//! this crate.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, redirect::Policy, Client};
use serde_json::Value;
use signance_core::endpoint::{authority, join_path};
use signance_core::{HealthResponse, NetworkConfig};
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Liveness predicate used by the locator. Implementations must never panic or block.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> bool;
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub health_path: String,
    pub timeout: Duration,
    pub accept_any_json: bool,
    pub user_agent: String,
}

impl ProbeOptions {
    pub fn from_config(cfg: &NetworkConfig) -> Self {
        ProbeOptions {
            health_path: cfg.health_path.clone(),
            timeout: cfg.probe_timeout(),
            accept_any_json: cfg.accept_any_json,
            user_agent: format!("signance-locator/{}", signance_core::version()),
        }
    }
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions::from_config(&NetworkConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive(HealthResponse),
    Timeout,
    Unreachable(String),
    HttpStatus(u16),
    Malformed(String),
    Unrecognized,
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeOutcome::Alive(_))
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Alive(h) => {
                write!(f, "alive")?;
                if let Some(s) = &h.status { write!(f, " status={}", s)?; }
                if let Some(m) = &h.module { write!(f, " module={}", m)?; }
                Ok(())
            }
            ProbeOutcome::Timeout => write!(f, "timeout"),
            ProbeOutcome::Unreachable(e) => write!(f, "unreachable: {}", e),
            ProbeOutcome::HttpStatus(s) => write!(f, "http status {}", s),
            ProbeOutcome::Malformed(e) => write!(f, "malformed body: {}", e),
            ProbeOutcome::Unrecognized => write!(f, "no health marker in body"),
        }
    }
}

pub fn health_url(host: &str, port: u16, path: &str) -> String {
    join_path(&format!("http://{}", authority(host, port)), path)
}

/// Judge a completed health response.
pub fn evaluate(status: u16, body: &[u8], accept_any_json: bool) -> ProbeOutcome {
    if !(200..300).contains(&status) {
        return ProbeOutcome::HttpStatus(status);
    }
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return ProbeOutcome::Malformed(e.to_string()),
    };
    if !value.is_object() {
        return ProbeOutcome::Malformed("expected a json object".into());
    }
    let recognized = value.get("status").and_then(Value::as_str) == Some("healthy")
        || value.get("module").is_some_and(|m| !m.is_null());
    if recognized || accept_any_json {
        ProbeOutcome::Alive(describe(&value))
    } else {
        ProbeOutcome::Unrecognized
    }
}

/// Marker fields as text, whatever their JSON type.
fn describe(value: &Value) -> HealthResponse {
    let text = |key: &str| match value.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    };
    HealthResponse { status: text("status"), module: text("module") }
}

/// HTTP health probe: one `GET {health_path}` per candidate under a hard deadline.
pub struct HttpProbe {
    client: Client,
    opts: ProbeOptions,
}

impl HttpProbe {
    pub fn new(opts: ProbeOptions) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(opts.timeout)
            .connect_timeout(opts.timeout)
            .user_agent(opts.user_agent.clone())
            .no_proxy()
            .build()?;
        Ok(HttpProbe { client, opts })
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.opts
    }

    /// Probe with diagnostic detail. The deadline drops the in-flight request,
    /// which aborts the underlying connection attempt.
    pub async fn check(&self, host: &str, port: u16) -> ProbeOutcome {
        let url = health_url(host, port, &self.opts.health_path);
        let outcome = match timeout(self.opts.timeout, self.fetch(&url)).await {
            Err(_) => ProbeOutcome::Timeout,
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Timeout,
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Ok(Ok((status, body))) => evaluate(status, &body, self.opts.accept_any_json),
        };
        debug!(host, port, outcome = %outcome, "probe");
        outcome
    }

    async fn fetch(&self, url: &str) -> reqwest::Result<(u16, Vec<u8>)> {
        let mut resp = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .send()
            .await?;
        let status = resp.status().as_u16();
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                // Oversized bodies cannot be a health payload; force a parse failure.
                return Ok((status, Vec::new()));
            }
            body.extend_from_slice(&chunk);
        }
        Ok((status, body))
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, host: &str, port: u16) -> bool {
        self.check(host, port).await.is_alive()
    }
}
