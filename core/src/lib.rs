//! Core types shared by the backend locator crates: page context, endpoints,
//! configuration, errors and the reconnect backoff schedule.

pub mod backoff;
pub mod config;
pub mod endpoint;
pub mod error;

pub use backoff::{Backoff, BackoffKind};
pub use config::{CandidateConfig, LocatorConfig, NetworkConfig, PortRange};
pub use endpoint::{Candidate, EndpointSource, HealthResponse, PageContext, ResolvedEndpoint};
pub use error::LocatorError;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
