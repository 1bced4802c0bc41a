//! Public playlist endpoints used by the display player. No credentials involved.

use crate::api::ApiClient;
use crate::error::ApiError;
use locator::Locator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use signance_core::endpoint::join_path;
use std::time::Duration;

pub const PLAYER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PlaylistSummary {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The subset of a media record needed to locate its file on the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MediaRef {
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default)]
    pub served_filename: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl MediaRef {
    /// Path of the file relative to the backend root, if the record names one.
    pub fn path(&self) -> Option<String> {
        if let Some(u) = self.file_url.as_deref().filter(|u| !u.is_empty()) {
            return Some(u.to_string());
        }
        let name = [&self.filepath, &self.served_filename, &self.filename]
            .into_iter()
            .find_map(|f| f.as_deref().filter(|s| !s.is_empty()))?;
        if name.starts_with("/uploads/") {
            Some(name.to_string())
        } else {
            Some(format!("/uploads/{}", name.trim_start_matches('/')))
        }
    }
}

pub fn media_url_on(base: &str, media: &MediaRef) -> Option<String> {
    media.path().map(|p| join_path(base, &p))
}

#[derive(Clone)]
pub struct PlayerClient {
    api: ApiClient,
}

impl PlayerClient {
    pub fn new(locator: Locator) -> Result<Self, ApiError> {
        Ok(PlayerClient { api: ApiClient::with_timeout(locator, PLAYER_TIMEOUT)? })
    }

    pub async fn list_playlists(&self, skip: u32, limit: u32) -> Result<Vec<PlaylistSummary>, ApiError> {
        self.api.get(&format!("/playlists/public?skip={}&limit={}", skip, limit)).await
    }

    /// Playlist with its media and schedules, as the player consumes it.
    pub async fn playlist(&self, id: i64) -> Result<Value, ApiError> {
        self.api.get(&format!("/playlists/{}/player", id)).await
    }

    pub async fn playlist_info(&self, id: i64) -> Result<PlaylistSummary, ApiError> {
        self.api.get(&format!("/playlists/{}", id)).await
    }

    /// Absolute URL of a media file on the resolved backend.
    pub async fn media_url(&self, media: &MediaRef) -> Result<String, ApiError> {
        let base = self.api.locator().base_url().await?;
        media_url_on(&base, media).ok_or_else(|| ApiError::NotFound("media record names no file".into()))
    }
}
