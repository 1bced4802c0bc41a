//! Backend consumers that obtain their base URL from the locator instead of a constant.

pub mod api;
pub mod error;
pub mod player;
#[cfg(feature = "realtime")]
pub mod realtime;

#[cfg(test)]
mod testing;

pub use api::ApiClient;
pub use error::ApiError;
pub use player::{MediaRef, PlayerClient};
#[cfg(feature = "realtime")]
pub use realtime::{Envelope, RealtimeClient, RealtimeEvent, RealtimeOptions};
