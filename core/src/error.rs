use crate::config::PortRange;
use thiserror::Error;

/// Errors surfaced by the locator. Individual probe failures never appear here.
///
/// `Clone` so a single discovery outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error(
        "backend unreachable: no candidate answered on hosts [{}] at preferred port {} or ports {}",
        .hosts.join(", "),
        .preferred_port,
        .port_range
    )]
    DiscoveryExhausted {
        hosts: Vec<String>,
        preferred_port: u16,
        port_range: PortRange,
        probes: usize,
    },
    #[error("discovery aborted: {planned} planned probes exceeds the limit of {limit}")]
    TooManyProbes { planned: usize, limit: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
}
