//! Persistent record of the last confirmed backend, scoped to the page origin it
//! was discovered under.
//!
//! The record is spread over several keys that are only ever written or removed
//! together. A partial or self-contradicting record is treated as absent and wiped.

mod open;
mod schema;
mod store;

pub use open::SqliteStore;
pub use store::{KeyValueStore, MemoryStore};

use anyhow::Result;
use signance_core::endpoint::http_base_url;
use signance_core::{EndpointSource, ResolvedEndpoint};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const KEY_HOST: &str = "backend_host";
pub const KEY_PORT: &str = "backend_port";
pub const KEY_URL: &str = "backend_url";
pub const KEY_ORIGIN: &str = "backend_origin";
pub const KEY_CONFIRMED_AT: &str = "backend_confirmed_at";

const RECORD_KEYS: [&str; 5] = [KEY_HOST, KEY_PORT, KEY_URL, KEY_ORIGIN, KEY_CONFIRMED_AT];

#[derive(Clone)]
pub struct DiscoveryCache {
    store: Arc<dyn KeyValueStore>,
    origin: String,
}

impl DiscoveryCache {
    /// `origin` is the page origin key (hostname) the cache is read and written under.
    pub fn new(store: Arc<dyn KeyValueStore>, origin: impl Into<String>) -> Self {
        DiscoveryCache { store, origin: origin.into() }
    }

    pub fn in_memory(origin: impl Into<String>) -> Self {
        DiscoveryCache::new(Arc::new(MemoryStore::new()), origin)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The stored endpoint, if it was recorded under the current origin and is intact.
    pub fn read(&self) -> Option<ResolvedEndpoint> {
        let values = match self.store.get_all(&RECORD_KEYS) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cache read failed; treating as empty");
                return None;
            }
        };
        if values.iter().all(Option::is_none) {
            return None;
        }
        let mut it = values.into_iter();
        let (host, port, url, origin, confirmed) =
            (it.next().flatten(), it.next().flatten(), it.next().flatten(), it.next().flatten(), it.next().flatten());

        if let Some(o) = &origin {
            if o != &self.origin {
                info!(cached = %o, current = %self.origin, "page origin changed; dropping cached backend");
                self.clear();
                return None;
            }
        }
        let (Some(host), Some(port), Some(url), Some(_), Some(confirmed)) = (host, port, url, origin, confirmed) else {
            warn!("partial cache record; dropping it");
            self.clear();
            return None;
        };
        let Some(endpoint) = decode(host, &port, url, &confirmed) else {
            warn!("inconsistent cache record; dropping it");
            self.clear();
            return None;
        };
        debug!(base_url = %endpoint.base_url, "cache hit");
        Some(endpoint)
    }

    /// Store `host:port` as the confirmed backend for the current origin.
    pub fn write(&self, host: &str, port: u16) -> Result<ResolvedEndpoint> {
        let endpoint = ResolvedEndpoint::probed(host, port, EndpointSource::Cache);
        self.store.set_all(&[
            (KEY_HOST, endpoint.host.clone()),
            (KEY_PORT, endpoint.port.to_string()),
            (KEY_URL, endpoint.base_url.clone()),
            (KEY_ORIGIN, self.origin.clone()),
            (KEY_CONFIRMED_AT, endpoint.confirmed_at.unix_timestamp().to_string()),
        ])?;
        debug!(base_url = %endpoint.base_url, origin = %self.origin, "cached backend");
        Ok(endpoint)
    }

    /// Remove every record key. Never fails; storage errors are logged.
    pub fn clear(&self) {
        if let Err(e) = self.store.remove_all(&RECORD_KEYS) {
            warn!(error = %e, "cache clear failed");
        }
    }
}

fn decode(host: String, port: &str, url: String, confirmed: &str) -> Option<ResolvedEndpoint> {
    let port: u16 = port.parse().ok().filter(|p| *p != 0)?;
    if url != http_base_url(&host, port) {
        return None;
    }
    let confirmed_at = OffsetDateTime::from_unix_timestamp(confirmed.parse().ok()?).ok()?;
    Some(ResolvedEndpoint { host, port, base_url: url, confirmed_at, source: EndpointSource::Cache })
}
