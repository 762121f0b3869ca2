//! Optimistic sender: appends the user's message at once, dispatches the
//! write and reconciles the confirmed row with the pending entry.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{LocalId, MessageId},
    error::{ErrorReport, RejectReason, SyncError},
    protocol::{MessageRow, NewMessageRow},
};
use tracing::{debug, info, warn};

use crate::{
    backend::Session,
    log::{ConfirmOutcome, MergeOutcome},
    sync::{ActivationToken, MessageSync, SyncState},
    types::{Message, MessageKey, SendOutcome, SenderProfile, SyncEvent},
};

enum Rollback {
    /// The pending entry was removed and the body parked for the composer.
    Removed,
    /// The echo of this very write was already received; the message exists.
    AlreadyConfirmed(Option<Message>),
}

impl MessageSync {
    /// Sends `body` into the active conversation. Never panics or raises:
    /// every outcome, including precondition failures, is returned as a value.
    pub async fn send(self: &Arc<Self>, body: &str) -> SendOutcome {
        let text = body.trim();
        if text.is_empty() {
            return reject(RejectReason::EmptyBody);
        }
        let Some(session) = self.auth.current_session().await else {
            return reject(RejectReason::NoSender);
        };

        let own_profile = self.own_profile(&session).await;
        let created_at = Utc::now();
        let message_id = MessageId::new_v4();

        let staged = {
            let mut state = self.state.lock().await;
            let staged = match &mut *state {
                SyncState::Active(active) => {
                    let local_id =
                        active
                            .pending
                            .allocate(message_id, session.user_id, text, created_at);
                    active.log.append_pending(Message {
                        key: MessageKey::Pending(local_id),
                        conversation_id: active.token.conversation_id,
                        sender_id: session.user_id,
                        body: text.to_string(),
                        created_at,
                        sender: own_profile.clone(),
                    });
                    active.compose_restore = None;
                    Some((active.token, local_id, active.log.len()))
                }
                SyncState::Inactive => None,
            };
            if staged.is_some() {
                self.publish(&state);
            }
            staged
        };
        let Some((token, local_id, len)) = staged else {
            return reject(RejectReason::NoActiveConversation);
        };
        self.emit_log_changed(token.conversation_id, len);
        debug!(
            conversation_id = %token.conversation_id,
            %local_id,
            "sender: optimistic entry appended"
        );

        let write = NewMessageRow {
            id: message_id,
            chat_id: token.conversation_id,
            sender_id: session.user_id,
            content: text.to_string(),
            read: false,
            created_at,
        };
        match self.repo.insert_message(&write).await {
            Ok(row) => self.complete_send(token, local_id, row, own_profile).await,
            Err(err) => self.rollback_send(token, local_id, body, err).await,
        }
    }

    async fn own_profile(&self, session: &Session) -> Option<SenderProfile> {
        if let Some(profile) = self.directory.cached(session.user_id).await {
            return Some(profile);
        }
        session.username.clone().map(|display_name| SenderProfile {
            display_name,
            avatar_url: None,
        })
    }

    async fn complete_send(
        &self,
        token: ActivationToken,
        local_id: LocalId,
        row: MessageRow,
        own_profile: Option<SenderProfile>,
    ) -> SendOutcome {
        let mut message = Message::from_row(row.clone());
        if message.sender.is_none() {
            message.sender = own_profile;
        }
        let confirmed_id = row.id;

        let reconciled = self
            .with_active(token, |active| {
                let echoed_as = active.pending.confirmed_id(local_id);
                active.pending.complete(local_id);
                let outcome = match echoed_as {
                    Some(id) if id == confirmed_id => None,
                    Some(_) => Some(ConfirmOutcome::Merged(active.log.merge(message.clone()))),
                    None => Some(active.log.confirm_pending(local_id, message.clone())),
                };
                (outcome, active.log.len())
            })
            .await;

        match reconciled {
            Some((outcome, len)) => {
                debug!(
                    conversation_id = %token.conversation_id,
                    %local_id,
                    message_id = %confirmed_id,
                    outcome = ?outcome,
                    "sender: write confirmed"
                );
                if !matches!(outcome, Some(ConfirmOutcome::Merged(MergeOutcome::Duplicate))) {
                    self.emit_log_changed(token.conversation_id, len);
                }
            }
            None => debug!(
                conversation_id = %token.conversation_id,
                message_id = %confirmed_id,
                "sender: write confirmed after the conversation was switched"
            ),
        }

        if let Err(err) = self
            .repo
            .touch_conversation(token.conversation_id, row.created_at)
            .await
        {
            warn!(
                conversation_id = %token.conversation_id,
                "sender: could not bump conversation timestamp: {err}"
            );
        }
        self.chat_list().record_message(&row).await;

        info!(
            conversation_id = %token.conversation_id,
            message_id = %confirmed_id,
            "sender: message sent"
        );
        SendOutcome::Sent(message)
    }

    async fn rollback_send(
        &self,
        token: ActivationToken,
        local_id: LocalId,
        body: &str,
        err: SyncError,
    ) -> SendOutcome {
        let rollback = self
            .with_active(token, |active| {
                let own_echo = active
                    .pending
                    .echoed_own_write(local_id)
                    .then(|| active.pending.confirmed_id(local_id))
                    .flatten();
                active.pending.complete(local_id);
                match own_echo {
                    Some(id) => {
                        let existing = active
                            .log
                            .position(MessageKey::Confirmed(id))
                            .map(|index| active.log.messages()[index].clone());
                        (Rollback::AlreadyConfirmed(existing), active.log.len())
                    }
                    // A lookalike row bound by content stays in the log as
                    // the message it is; only our own entry goes.
                    None => {
                        active.log.remove_pending(local_id);
                        active.compose_restore = Some(body.to_string());
                        (Rollback::Removed, active.log.len())
                    }
                }
            })
            .await;

        if let Some((Rollback::AlreadyConfirmed(Some(message)), _)) = rollback {
            warn!(
                conversation_id = %token.conversation_id,
                %local_id,
                "sender: write reported failure but its echo was already received: {err}"
            );
            return SendOutcome::Sent(message);
        }

        warn!(
            conversation_id = %token.conversation_id,
            %local_id,
            "sender: write failed, optimistic entry rolled back: {err}"
        );
        if let Some((_, len)) = rollback {
            self.emit_log_changed(token.conversation_id, len);
        }

        let error = err.report();
        let _ = self.events.send(SyncEvent::SendFailed {
            conversation_id: token.conversation_id,
            error: error.clone(),
            restored_body: body.to_string(),
        });
        SendOutcome::Failed {
            error,
            restored_body: body.to_string(),
        }
    }
}

fn reject(reason: RejectReason) -> SendOutcome {
    debug!(%reason, "sender: send rejected");
    SendOutcome::Rejected(ErrorReport::from(SyncError::InvalidRequest(reason)))
}
