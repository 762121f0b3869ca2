use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{domain::UserId, error::SyncError, protocol::UserRow};
use tracing::{info, warn};

use crate::{
    backend::{AuthService, Credentials, Session},
    profiles::SenderDirectory,
    repository::ChatRepository,
    types::SenderProfile,
};

const FALLBACK_USERNAME: &str = "User";

/// Avatar assigned to accounts that never picked one.
pub fn default_avatar_url(user_id: UserId) -> String {
    format!("https://i.pravatar.cc/150?u={user_id}")
}

/// Profile row mirrored into `users` for a signed-in account: the username
/// hint if there is one, otherwise the local part of the email.
pub fn profile_row_for(session: &Session, now: DateTime<Utc>) -> UserRow {
    let username = session
        .username
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .or_else(|| {
            session
                .email
                .as_deref()
                .and_then(|email| email.split('@').next())
                .filter(|local| !local.is_empty())
        })
        .unwrap_or(FALLBACK_USERNAME)
        .to_string();

    UserRow {
        id: session.user_id,
        username,
        avatar_url: Some(default_avatar_url(session.user_id)),
        email: session.email.clone(),
        phone_number: None,
        updated_at: Some(now),
    }
}

/// Sign-in flows plus mirroring of the account into the `users` table.
#[derive(Clone)]
pub struct SessionManager {
    auth: Arc<dyn AuthService>,
    repo: ChatRepository,
    directory: Arc<SenderDirectory>,
}

impl SessionManager {
    pub fn new(
        auth: Arc<dyn AuthService>,
        repo: ChatRepository,
        directory: Arc<SenderDirectory>,
    ) -> Self {
        Self {
            auth,
            repo,
            directory,
        }
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.auth.current_session().await
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.current_session().await.map(|session| session.user_id)
    }

    pub async fn require_session(&self) -> Result<Session, SyncError> {
        self.current_session()
            .await
            .ok_or_else(|| SyncError::unauthorized("no active session"))
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let session = self.auth.sign_in(credentials).await?;
        info!(user_id = %session.user_id, "session: signed in");
        self.sync_profile(&session).await;
        Ok(session)
    }

    pub async fn sign_up(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let session = self.auth.sign_up(credentials).await?;
        info!(user_id = %session.user_id, "session: account created");
        self.sync_profile(&session).await;
        Ok(session)
    }

    pub async fn sign_out(&self) -> Result<(), SyncError> {
        let user_id = self.current_user().await;
        self.auth.sign_out().await?;
        self.directory.clear().await;
        if let Some(user_id) = user_id {
            info!(user_id = %user_id, "session: signed out");
        }
        Ok(())
    }

    /// Upserts the account's profile row. Failures are logged only; the
    /// session stays usable without a mirrored profile.
    pub async fn sync_profile(&self, session: &Session) -> Option<UserRow> {
        let row = profile_row_for(session, Utc::now());
        match self.repo.upsert_profile(&row).await {
            Ok(stored) => {
                self.directory
                    .record(
                        stored.id,
                        SenderProfile {
                            display_name: stored.username.clone(),
                            avatar_url: stored.avatar_url.clone(),
                        },
                    )
                    .await;
                Some(stored)
            }
            Err(err) => {
                warn!(user_id = %session.user_id, "session: profile sync failed: {err}");
                None
            }
        }
    }
}
