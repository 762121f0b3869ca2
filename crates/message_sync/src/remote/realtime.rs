//! Realtime change feed over the Phoenix channel protocol. Each subscription
//! runs its own socket: join, heartbeat, forward `postgres_changes`, leave.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::error::SyncError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use super::{RemoteConfig, SessionCell};
use crate::backend::{
    ChangeEvent, ChangeFeed, ChangeKind, FeedStatus, Filter, Subscription, SubscriptionHandle,
};

const JOIN_REF: &str = "1";
const SCHEMA: &str = "public";

#[derive(Debug, Deserialize)]
pub(crate) struct Frame {
    pub(crate) topic: String,
    pub(crate) event: String,
    #[serde(default)]
    pub(crate) payload: Value,
    #[serde(default, rename = "ref")]
    pub(crate) reference: Option<String>,
}

pub(crate) fn topic_for(table: &str, filter: Option<&Filter>) -> String {
    match filter {
        Some(filter) => format!(
            "realtime:{SCHEMA}:{table}:{}={}",
            filter.column(),
            filter.operator_expression()
        ),
        None => format!("realtime:{SCHEMA}:{table}"),
    }
}

pub(crate) fn join_frame(
    topic: &str,
    table: &str,
    filter: Option<&Filter>,
    access_token: &str,
) -> Value {
    let mut change = json!({ "event": "*", "schema": SCHEMA, "table": table });
    if let Some(filter) = filter {
        change["filter"] = json!(format!("{}={}", filter.column(), filter.operator_expression()));
    }
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

fn heartbeat_frame(reference: u64) -> Value {
    json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": reference.to_string() })
}

fn leave_frame(topic: &str, reference: u64) -> Value {
    json!({ "topic": topic, "event": "phx_leave", "payload": {}, "ref": reference.to_string() })
}

/// Extracts the row change carried by a `postgres_changes` payload.
pub(crate) fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let (kind, record_field) = match data.get("type")?.as_str()? {
        "INSERT" => (ChangeKind::Insert, "record"),
        "UPDATE" => (ChangeKind::Update, "record"),
        "DELETE" => (ChangeKind::Delete, "old_record"),
        _ => return None,
    };
    let table = data.get("table")?.as_str()?.to_string();
    let Value::Object(row) = data.get(record_field)?.clone() else {
        return None;
    };
    Some(ChangeEvent { kind, table, row })
}

fn reply_status(payload: &Value) -> Result<(), String> {
    match payload.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        _ => Err(payload
            .get("response")
            .map(Value::to_string)
            .unwrap_or_else(|| "join rejected".to_string())),
    }
}

pub(crate) fn socket_url(config: &RemoteConfig) -> Result<Url> {
    let mut url = config
        .base_url
        .join("realtime/v1/websocket")
        .context("invalid realtime endpoint")?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("unsupported backend scheme {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("could not switch {url} to {scheme}"))?;
    url.query_pairs_mut()
        .append_pair("apikey", &config.anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

struct Channel {
    table: String,
    filter: Option<Filter>,
    topic: String,
    access_token: String,
    status: watch::Sender<FeedStatus>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    leave: oneshot::Receiver<()>,
}

pub struct RealtimeFeed {
    config: Arc<RemoteConfig>,
    session: SessionCell,
    handles: AtomicU64,
    channels: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl RealtimeFeed {
    pub(crate) fn new(config: Arc<RemoteConfig>, session: SessionCell) -> Self {
        Self {
            config,
            session,
            handles: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<Subscription, SyncError> {
        let url = socket_url(&self.config).map_err(|err| SyncError::unavailable(format!("{err:#}")))?;
        let handle = SubscriptionHandle(self.handles.fetch_add(1, Ordering::SeqCst) + 1);
        let access_token = self
            .session
            .get()
            .await
            .map(|session| session.access_token)
            .unwrap_or_else(|| self.config.anon_key.clone());

        let (status_tx, status_rx) = watch::channel(FeedStatus::Attaching);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (leave_tx, leave_rx) = oneshot::channel();
        self.channels.lock().await.insert(handle.0, leave_tx);

        let channel = Channel {
            topic: topic_for(table, filter.as_ref()),
            table: table.to_string(),
            filter,
            access_token,
            status: status_tx,
            events: events_tx,
            leave: leave_rx,
        };
        let heartbeat = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let status = channel.status.clone();
            let topic = channel.topic.clone();
            match run_channel(url, channel, heartbeat).await {
                Ok(()) => {
                    status.send_replace(FeedStatus::Closed);
                }
                Err(err) => {
                    warn!(topic = %topic, "realtime: channel failed: {err:#}");
                    status.send_replace(FeedStatus::Failed(format!("{err:#}")));
                }
            }
        });

        Ok(Subscription {
            handle,
            status: status_rx,
            events: events_rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(leave) = self.channels.lock().await.remove(&handle.0) {
            let _ = leave.send(());
            debug!(handle = handle.0, "realtime: leave requested");
        }
    }
}

async fn run_channel(url: Url, mut channel: Channel, heartbeat: std::time::Duration) -> Result<()> {
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect realtime socket for {}", channel.topic))?;
    let (mut writer, mut reader) = socket.split();

    let join = join_frame(
        &channel.topic,
        &channel.table,
        channel.filter.as_ref(),
        &channel.access_token,
    );
    writer
        .send(WsMessage::Text(join.to_string()))
        .await
        .context("failed to send phx_join")?;

    let mut references = 1u64;
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut channel.leave => {
                references += 1;
                let _ = writer
                    .send(WsMessage::Text(leave_frame(&channel.topic, references).to_string()))
                    .await;
                let _ = writer.close().await;
                debug!(topic = %channel.topic, "realtime: left channel");
                return Ok(());
            }
            _ = ticker.tick() => {
                references += 1;
                writer
                    .send(WsMessage::Text(heartbeat_frame(references).to_string()))
                    .await
                    .context("failed to send heartbeat")?;
            }
            incoming = reader.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(anyhow!("realtime receive failed: {err}")),
                };
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(topic = %channel.topic, "realtime: invalid frame: {err}");
                        continue;
                    }
                };
                if frame.topic != channel.topic {
                    continue;
                }
                match frame.event.as_str() {
                    "phx_reply" if frame.reference.as_deref() == Some(JOIN_REF) => {
                        match reply_status(&frame.payload) {
                            Ok(()) => {
                                info!(topic = %channel.topic, "realtime: channel joined");
                                channel.status.send_replace(FeedStatus::Attached);
                            }
                            Err(reason) => return Err(anyhow!("join rejected: {reason}")),
                        }
                    }
                    "postgres_changes" => match decode_change(&frame.payload) {
                        Some(event) => {
                            let _ = channel.events.send(event);
                        }
                        None => debug!(topic = %channel.topic, "realtime: unrecognised change payload"),
                    },
                    "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
                        return Err(anyhow!("channel error: {}", frame.payload));
                    }
                    "phx_error" => return Err(anyhow!("channel crashed: {}", frame.payload)),
                    "phx_close" => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}
