use anyhow::{Context, Result};
use serde::Deserialize;
use signance_core::{Backoff, CandidateConfig, LocatorConfig, NetworkConfig};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "signance.yaml";
pub const DEFAULT_CACHE_FILE: &str = "signance-cache.sqlite3";

/// Where the client pretends to be served from.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct OriginConfig {
    /// Page URL, e.g. `http://192.168.1.20:5173/player`. Defaults to the machine's LAN address.
    pub url: Option<String>,
    /// The frontend is served by the backend itself.
    pub same_origin: bool,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file, or `:memory:`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RealtimeConfig {
    pub path: String,
    pub backoff: Backoff,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig { path: "/ws".into(), backoff: Backoff::default() }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub candidates: CandidateConfig,
    pub origin: OriginConfig,
    pub cache: CacheConfig,
    pub realtime: RealtimeConfig,
}

impl Config {
    pub fn locator(&self) -> LocatorConfig {
        LocatorConfig { network: self.network.clone(), candidates: self.candidates.clone() }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache.path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FILE))
    }
}

/// Explicit path must exist and parse; otherwise `./signance.yaml` is used when present.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(cfg))
}
