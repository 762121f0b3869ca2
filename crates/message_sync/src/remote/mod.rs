//! Adapters for the hosted backend: PostgREST-style tables, GoTrue-style
//! auth and the Phoenix-channel realtime socket.

mod auth;
mod realtime;
mod rest;

use std::{sync::Arc, time::Duration};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use shared::error::SyncError;
use tokio::sync::RwLock;
use url::Url;

pub use auth::RestAuth;
pub use realtime::RealtimeFeed;
pub use rest::RestStore;

use crate::backend::{Backend, Session};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: Url,
    pub anon_key: String,
    pub heartbeat_interval: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, SyncError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| SyncError::unavailable(format!("invalid backend url {base_url}: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            anon_key: anon_key.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        })
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|err| SyncError::unavailable(format!("invalid endpoint {path}: {err}")))
    }
}

/// Session shared by the three adapters so table and socket requests carry
/// the signed-in user's token.
#[derive(Clone, Default)]
pub(crate) struct SessionCell(Arc<RwLock<Option<Session>>>);

impl SessionCell {
    pub(crate) async fn get(&self) -> Option<Session> {
        self.0.read().await.clone()
    }

    pub(crate) async fn set(&self, session: Option<Session>) {
        *self.0.write().await = session;
    }

    async fn bearer(&self, config: &RemoteConfig) -> String {
        self.get()
            .await
            .map(|session| session.access_token)
            .unwrap_or_else(|| config.anon_key.clone())
    }
}

/// Builds the three collaborators over one HTTP client and session.
pub fn connect(config: RemoteConfig) -> Backend {
    let config = Arc::new(config);
    let http = Client::new();
    let session = SessionCell::default();
    Backend {
        auth: Arc::new(RestAuth::new(http.clone(), Arc::clone(&config), session.clone())),
        store: Arc::new(RestStore::new(http, Arc::clone(&config), session.clone())),
        feed: Arc::new(RealtimeFeed::new(config, session)),
    }
}

async fn authorize(
    builder: RequestBuilder,
    config: &RemoteConfig,
    session: &SessionCell,
) -> RequestBuilder {
    builder
        .header("apikey", &config.anon_key)
        .bearer_auth(session.bearer(config).await)
}

fn status_error(status: StatusCode, body: &str) -> SyncError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::NOT_FOUND => SyncError::not_found(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::unauthorized(detail),
        _ => SyncError::unavailable(detail),
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    SyncError::unavailable(format!("request failed: {err}"))
}

async fn check(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

#[cfg(test)]
#[path = "../tests/remote_tests.rs"]
mod tests;
