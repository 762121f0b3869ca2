//! Live subscriber: attaches the per-conversation change feed and merges
//! insert notifications into the active log.

use std::sync::Arc;

use shared::protocol::{MessageRow, MESSAGES_TABLE};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChangeEvent, ChangeKind, FeedStatus, Filter, Subscription},
    repository::decode_row,
    sync::{ActivationToken, IncomingOutcome, MessageSync, SyncState},
    types::{LiveStatus, Message, SyncEvent},
};

impl MessageSync {
    /// Issues the subscription for `token` and spawns the task consuming it.
    /// Attach failures degrade live status and never touch the loaded log.
    pub(crate) async fn attach_live(self: &Arc<Self>, token: ActivationToken) {
        self.set_live_status(token, LiveStatus::Attaching).await;

        let filter = Filter::eq("chat_id", token.conversation_id);
        let subscription = match self.feed.subscribe(MESSAGES_TABLE, Some(filter)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(
                    conversation_id = %token.conversation_id,
                    "live: subscription request failed: {err}"
                );
                self.set_live_status(token, LiveStatus::Unavailable(err.to_string()))
                    .await;
                return;
            }
        };

        let handle = subscription.handle;
        let task = tokio::spawn(Arc::clone(self).run_live(token, subscription));

        let mut state = self.state.lock().await;
        match &mut *state {
            SyncState::Active(active) if active.token == token => {
                active.subscription = Some(handle);
                active.live_task = Some(task);
            }
            _ => {
                drop(state);
                debug!(
                    conversation_id = %token.conversation_id,
                    "live: activation superseded while attaching; releasing subscription"
                );
                task.abort();
                self.feed.unsubscribe(handle).await;
            }
        }
    }

    async fn run_live(self: Arc<Self>, token: ActivationToken, subscription: Subscription) {
        let Subscription {
            handle,
            mut status,
            mut events,
        } = subscription;

        let initial = status.borrow_and_update().clone();
        self.on_feed_status(token, initial).await;

        let mut status_open = true;
        loop {
            tokio::select! {
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let current = status.borrow_and_update().clone();
                    self.on_feed_status(token, current).await;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.on_change_event(token, event).await;
                }
            }
        }

        debug!(
            conversation_id = %token.conversation_id,
            handle = handle.0,
            "live: event stream ended"
        );
        self.update_live(token, |live| {
            if !matches!(live, LiveStatus::Unavailable(_)) {
                *live = LiveStatus::Detached;
            }
        })
        .await;
    }

    async fn on_feed_status(&self, token: ActivationToken, status: FeedStatus) {
        match status {
            FeedStatus::Attaching => self.set_live_status(token, LiveStatus::Attaching).await,
            FeedStatus::Attached => {
                info!(
                    conversation_id = %token.conversation_id,
                    "live: subscription attached"
                );
                self.set_live_status(token, LiveStatus::Attached).await;
                if self.settings.resync_on_attach {
                    self.catch_up(token).await;
                }
            }
            FeedStatus::Closed => self.set_live_status(token, LiveStatus::Detached).await,
            FeedStatus::Failed(reason) => {
                warn!(
                    conversation_id = %token.conversation_id,
                    "live: subscription failed: {reason}"
                );
                self.set_live_status(token, LiveStatus::Unavailable(reason))
                    .await;
            }
        }
    }

    /// Merges a fresh read of the conversation so inserts committed between
    /// the initial snapshot and attachment are not lost.
    async fn catch_up(&self, token: ActivationToken) {
        if !self.is_current(token).await {
            return;
        }
        let messages = match self.loader.load(token.conversation_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(
                    conversation_id = %token.conversation_id,
                    "live: catch-up fetch failed: {err}"
                );
                return;
            }
        };

        let me = self.current_user().await;
        let window = self.echo_window();
        let merged = self
            .with_active(token, |active| {
                let merged = active.absorb_snapshot(messages, me, window);
                (merged, active.log.len())
            })
            .await;

        if let Some((merged, len)) = merged {
            if merged > 0 {
                debug!(
                    conversation_id = %token.conversation_id,
                    merged,
                    "live: catch-up filled messages missed before attach"
                );
                self.emit_log_changed(token.conversation_id, len);
            }
        }
    }

    async fn on_change_event(&self, token: ActivationToken, event: ChangeEvent) {
        if event.kind != ChangeKind::Insert {
            debug!(table = %event.table, kind = ?event.kind, "live: ignoring non-insert change");
            return;
        }

        let row: MessageRow = match decode_row(event.row) {
            Ok(row) => row,
            Err(err) => {
                warn!(conversation_id = %token.conversation_id, "live: undecodable insert: {err}");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("undecodable message insert: {err}")));
                return;
            }
        };

        if row.chat_id != token.conversation_id {
            debug!(
                conversation_id = %token.conversation_id,
                event_conversation_id = %row.chat_id,
                message_id = %row.id,
                "live: dropping insert for another conversation"
            );
            return;
        }
        if !self.is_current(token).await {
            debug!(
                conversation_id = %token.conversation_id,
                epoch = token.epoch,
                message_id = %row.id,
                "live: dropping insert for stale activation"
            );
            return;
        }

        let mut message = Message::from_row(row);
        let profile = match message.sender.take() {
            Some(profile) => {
                self.directory
                    .record(message.sender_id, profile.clone())
                    .await;
                profile
            }
            None => self.directory.resolve(message.sender_id).await,
        };
        message.sender = Some(profile);

        let message_id = message.confirmed_id();
        let me = self.current_user().await;
        let window = self.echo_window();
        let outcome = self
            .with_active(token, |active| {
                (active.apply_incoming(message, me, window), active.log.len())
            })
            .await;

        match outcome {
            None => debug!(
                conversation_id = %token.conversation_id,
                "live: activation ended during sender lookup; insert dropped"
            ),
            Some((IncomingOutcome::Duplicate, _)) => debug!(
                conversation_id = %token.conversation_id,
                message_id = ?message_id,
                "live: duplicate insert discarded"
            ),
            Some((IncomingOutcome::Reconciled(local_id), len)) => {
                debug!(
                    conversation_id = %token.conversation_id,
                    %local_id,
                    message_id = ?message_id,
                    "live: echo confirmed pending send"
                );
                self.emit_log_changed(token.conversation_id, len);
            }
            Some((IncomingOutcome::Merged, len)) => {
                self.emit_log_changed(token.conversation_id, len);
            }
        }
    }

    async fn set_live_status(&self, token: ActivationToken, status: LiveStatus) {
        self.update_live(token, move |live| *live = status).await;
    }

    async fn update_live(&self, token: ActivationToken, update: impl FnOnce(&mut LiveStatus)) {
        let changed = self
            .with_active(token, |active| {
                let before = active.live.clone();
                update(&mut active.live);
                (before != active.live).then(|| active.live.clone())
            })
            .await
            .flatten();

        if let Some(status) = changed {
            let _ = self.events.send(SyncEvent::LiveStatusChanged {
                conversation_id: token.conversation_id,
                status,
            });
        }
    }
}
