use std::collections::HashMap;

use shared::domain::UserId;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::{
    repository::ChatRepository,
    types::{SenderProfile, SyncEvent},
};

/// Sender display metadata cache. Misses are fetched from the store; a
/// failed fetch yields the `Unknown` sentinel and is not cached.
pub struct SenderDirectory {
    repo: ChatRepository,
    profiles: Mutex<HashMap<UserId, SenderProfile>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SenderDirectory {
    pub fn new(repo: ChatRepository, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            repo,
            profiles: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn cached(&self, user_id: UserId) -> Option<SenderProfile> {
        self.profiles.lock().await.get(&user_id).cloned()
    }

    pub async fn resolve(&self, user_id: UserId) -> SenderProfile {
        if let Some(profile) = self.cached(user_id).await {
            return profile;
        }

        match self.repo.profile(user_id).await {
            Ok(Some(row)) => {
                let profile = SenderProfile::from(row);
                self.record(user_id, profile.clone()).await;
                profile
            }
            Ok(None) => {
                warn!(user_id = %user_id, "profiles: sender has no user row");
                SenderProfile::unknown()
            }
            Err(err) => {
                warn!(user_id = %user_id, "profiles: sender lookup failed: {err}");
                SenderProfile::unknown()
            }
        }
    }

    pub async fn record(&self, user_id: UserId, profile: SenderProfile) {
        let changed = {
            let mut profiles = self.profiles.lock().await;
            if profiles.get(&user_id) != Some(&profile) {
                profiles.insert(user_id, profile.clone());
                true
            } else {
                false
            }
        };

        if changed {
            let _ = self
                .events
                .send(SyncEvent::SenderProfileUpdated { user_id, profile });
        }
    }

    pub async fn clear(&self) {
        self.profiles.lock().await.clear();
    }
}
