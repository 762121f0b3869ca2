use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use shared::{domain::UserId, error::SyncError};
use tracing::{info, warn};

use super::{authorize, check, transport_error, RemoteConfig, SessionCell};
use crate::backend::{AuthService, Credentials, Session};

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: UserId,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<AuthUser>,
}

impl TokenResponse {
    fn into_session(self) -> Result<Session, SyncError> {
        match (self.access_token, self.user) {
            (Some(access_token), Some(user)) => Ok(Session {
                user_id: user.id,
                email: user.email,
                access_token,
                username: user.user_metadata.username,
            }),
            _ => Err(SyncError::unauthorized(
                "no session issued; the account may need email confirmation",
            )),
        }
    }
}

/// Password auth against `/auth/v1`.
pub struct RestAuth {
    http: Client,
    config: Arc<RemoteConfig>,
    session: SessionCell,
}

impl RestAuth {
    pub(crate) fn new(http: Client, config: Arc<RemoteConfig>, session: SessionCell) -> Self {
        Self {
            http,
            config,
            session,
        }
    }

    async fn request_session(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Session, SyncError> {
        let url = self.config.endpoint(path)?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::unauthorized(format!("credentials rejected: {body}")));
        }
        let token: TokenResponse = check(response)
            .await?
            .json()
            .await
            .map_err(|err| SyncError::unavailable(format!("malformed auth response: {err}")))?;
        let session = token.into_session()?;
        self.session.set(Some(session.clone())).await;
        Ok(session)
    }
}

#[async_trait]
impl AuthService for RestAuth {
    async fn current_session(&self) -> Option<Session> {
        self.session.get().await
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let session = self
            .request_session(
                "auth/v1/token?grant_type=password",
                json!({ "email": credentials.email, "password": credentials.password }),
            )
            .await?;
        info!(user_id = %session.user_id, "auth: password sign-in succeeded");
        Ok(session)
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let session = self
            .request_session(
                "auth/v1/signup",
                json!({
                    "email": credentials.email,
                    "password": credentials.password,
                    "data": { "username": credentials.username },
                }),
            )
            .await?;
        info!(user_id = %session.user_id, "auth: account registered");
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), SyncError> {
        if self.session.get().await.is_none() {
            return Ok(());
        }
        let url = self.config.endpoint("auth/v1/logout")?;
        let request = authorize(self.http.post(url), &self.config, &self.session).await;
        let result = match request.send().await {
            Ok(response) => check(response).await.map(|_| ()),
            Err(err) => Err(transport_error(err)),
        };
        // The local session is dropped even if the server could not be told.
        self.session.set(None).await;
        if let Err(err) = &result {
            warn!("auth: remote logout failed: {err}");
        }
        result
    }
}
