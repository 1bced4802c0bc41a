//! Locator configuration. Every section deserializes with defaults so a config
//! file only needs to name what it changes.

use crate::error::LocatorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Inclusive port range probed in the second discovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, LocatorError> {
        let r = PortRange { start, end };
        r.validate()?;
        Ok(r)
    }

    pub fn validate(&self) -> Result<(), LocatorError> {
        if self.start == 0 || self.start > self.end {
            return Err(LocatorError::Config(format!("invalid port range: {}", self)));
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.start > self.end { 0 } else { (self.end - self.start) as usize + 1 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange { start: 8000, end: 8010 }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parse `"8000-8010"` or a single port such as `"8002"`.
impl FromStr for PortRange {
    type Err = LocatorError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let bad = |_| LocatorError::Config(format!("invalid port range: {}", spec));
        let spec = spec.trim();
        let (start, end) = match spec.split_once('-') {
            Some((s, e)) => (s.trim().parse::<u16>().map_err(bad)?, e.trim().parse::<u16>().map_err(bad)?),
            None => {
                let p = spec.parse::<u16>().map_err(bad)?;
                (p, p)
            }
        };
        PortRange::new(start, end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub preferred_port: u16,
    pub port_range: PortRange,
    pub health_path: String,
    pub timeout_ms: u64,
    pub health_interval_secs: u64,
    /// Upper bound on probes planned for one discovery run.
    pub max_probes: usize,
    /// Accept any 2xx JSON object from the health endpoint, marker or not.
    pub accept_any_json: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            preferred_port: 8002,
            port_range: PortRange::default(),
            health_path: "/health".into(),
            timeout_ms: 3000,
            health_interval_secs: 30,
            max_probes: 1024,
            accept_any_json: false,
        }
    }
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Known server addresses tried right after the page's own hostname.
    pub preferred_hosts: Vec<String>,
    pub include_loopback: bool,
    /// Probe likely server addresses on the page's own /24.
    pub scan_subnet: bool,
    /// Probe likely server addresses on common private networks.
    pub scan_common_networks: bool,
    pub suffixes: Vec<u8>,
    pub common_networks: Vec<String>,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        CandidateConfig {
            preferred_hosts: Vec::new(),
            include_loopback: true,
            scan_subnet: true,
            scan_common_networks: true,
            suffixes: vec![1, 10, 50, 100, 150, 200, 254],
            common_networks: vec![
                "192.168.0.0/24".into(),
                "192.168.1.0/24".into(),
                "10.0.0.0/24".into(),
                "10.0.1.0/24".into(),
                "172.16.0.0/24".into(),
            ],
        }
    }
}

impl CandidateConfig {
    /// Only the page hostname, preferred hosts and loopback: the fixed-address deployment.
    pub fn fixed() -> Self {
        CandidateConfig { scan_subnet: false, scan_common_networks: false, ..CandidateConfig::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub network: NetworkConfig,
    pub candidates: CandidateConfig,
}

impl LocatorConfig {
    pub fn validate(&self) -> Result<(), LocatorError> {
        let n = &self.network;
        n.port_range.validate()?;
        if n.preferred_port == 0 {
            return Err(LocatorError::Config("preferred_port must be > 0".into()));
        }
        if n.timeout_ms == 0 {
            return Err(LocatorError::Config("timeout_ms must be > 0".into()));
        }
        if n.health_interval_secs == 0 {
            return Err(LocatorError::Config("health_interval_secs must be > 0".into()));
        }
        if !n.health_path.starts_with('/') {
            return Err(LocatorError::Config(format!("health_path must start with '/': {}", n.health_path)));
        }
        Ok(())
    }
}
