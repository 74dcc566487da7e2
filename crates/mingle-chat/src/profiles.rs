//! External profile directory collaborator.
//!
//! The messaging core never stores user profiles; it resolves display
//! identities through this seam. A missing or unreachable profile always
//! degrades to the `UNKNOWN_USER` sentinel instead of failing the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use mingle_types::error::{ChatError, ChatResult};
use mingle_types::models::{Profile, UNKNOWN_USER};

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// `Ok(None)` when the id is unknown; `Err(Store)` when the directory
    /// itself is unreachable.
    async fn get_profile(&self, id: Uuid) -> ChatResult<Option<Profile>>;

    async fn list_profiles(&self, excluding: Option<Uuid>) -> ChatResult<Vec<Profile>>;
}

/// Resolve a display name, swallowing directory failures into the
/// sentinel. Aggregations must keep going when one profile is missing.
pub async fn display_name(directory: &dyn ProfileDirectory, id: Uuid) -> String {
    match directory.get_profile(id).await {
        Ok(Some(profile)) => profile.username,
        Ok(None) => UNKNOWN_USER.to_string(),
        Err(e) => {
            warn!("Profile lookup for {} failed: {}", id, e);
            UNKNOWN_USER.to_string()
        }
    }
}

/// HTTP-backed directory talking to the profile service.
pub struct HttpProfileDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProfileDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProfileDirectory for HttpProfileDirectory {
    async fn get_profile(&self, id: Uuid) -> ChatResult<Option<Profile>> {
        let url = format!("{}/profiles/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChatError::Store(format!("profile directory unreachable: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| ChatError::Store(format!("profile directory error: {e}")))?;

        let profile = response
            .json::<Profile>()
            .await
            .map_err(|e| ChatError::Store(format!("malformed profile payload: {e}")))?;
        Ok(Some(profile))
    }

    async fn list_profiles(&self, excluding: Option<Uuid>) -> ChatResult<Vec<Profile>> {
        let mut request = self.client.get(format!("{}/profiles", self.base_url));
        if let Some(id) = excluding {
            request = request.query(&[("excluding", id.to_string())]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Store(format!("profile directory unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| ChatError::Store(format!("profile directory error: {e}")))?;

        response
            .json::<Vec<Profile>>()
            .await
            .map_err(|e| ChatError::Store(format!("malformed profile payload: {e}")))
    }
}

/// Fixed in-memory directory for tests and single-process dev setups.
#[derive(Default)]
pub struct StaticProfileDirectory {
    profiles: HashMap<Uuid, Profile>,
}

impl StaticProfileDirectory {
    pub fn new(profiles: impl IntoIterator<Item = Profile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id, p)).collect(),
        }
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfileDirectory {
    async fn get_profile(&self, id: Uuid) -> ChatResult<Option<Profile>> {
        Ok(self.profiles.get(&id).cloned())
    }

    async fn list_profiles(&self, excluding: Option<Uuid>) -> ChatResult<Vec<Profile>> {
        let mut all: Vec<Profile> = self
            .profiles
            .values()
            .filter(|p| Some(p.id) != excluding)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(all)
    }
}
