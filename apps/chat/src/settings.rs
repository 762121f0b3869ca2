use std::{path::Path, time::Duration};

use anyhow::Context;
use config::{Config, Environment, File};
use message_sync::{remote::RemoteConfig, SyncSettings};
use serde::Deserialize;

/// Client settings: defaults, then `chat.toml` (or `--config`), then
/// `APP__*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend_url: String,
    pub anon_key: String,
    pub heartbeat_interval_secs: u64,
    pub echo_window_secs: u64,
    pub resync_on_attach: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".into(),
            anon_key: String::new(),
            heartbeat_interval_secs: 25,
            echo_window_secs: 60,
            resync_on_attach: true,
        }
    }
}

impl Settings {
    pub fn remote(&self) -> anyhow::Result<RemoteConfig> {
        let config = RemoteConfig::new(&self.backend_url, self.anon_key.clone())?
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs.max(1)));
        Ok(config)
    }

    pub fn sync(&self) -> SyncSettings {
        SyncSettings {
            echo_match_window: Duration::from_secs(self.echo_window_secs),
            resync_on_attach: self.resync_on_attach,
        }
    }
}

pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name("chat").required(false),
    };
    Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to read chat settings")?
        .try_deserialize()
        .context("invalid chat settings")
}
