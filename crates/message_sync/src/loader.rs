use std::{collections::HashSet, sync::Arc};

use shared::{domain::ConversationId, error::SyncError};
use tracing::{debug, info};

use crate::{profiles::SenderDirectory, repository::ChatRepository, types::Message};

/// Read-only fetch of a conversation's ordered history. Either the whole log
/// is returned or an error; callers never see a partial result.
pub struct InitialLoader {
    repo: ChatRepository,
    directory: Arc<SenderDirectory>,
}

impl InitialLoader {
    pub fn new(repo: ChatRepository, directory: Arc<SenderDirectory>) -> Self {
        Self { repo, directory }
    }

    pub async fn load(&self, conversation_id: ConversationId) -> Result<Vec<Message>, SyncError> {
        if self.repo.conversation(conversation_id).await?.is_none() {
            return Err(SyncError::not_found(format!(
                "conversation {conversation_id} does not exist"
            )));
        }

        let rows = self.repo.messages_for(conversation_id).await?;
        info!(
            conversation_id = %conversation_id,
            count = rows.len(),
            "loader: fetched message history"
        );

        let mut messages: Vec<Message> = Vec::with_capacity(rows.len());
        let mut unresolved = HashSet::new();
        for row in rows {
            let message = Message::from_row(row);
            match &message.sender {
                Some(profile) => {
                    self.directory
                        .record(message.sender_id, profile.clone())
                        .await
                }
                None => {
                    unresolved.insert(message.sender_id);
                }
            }
            messages.push(message);
        }

        for sender_id in unresolved {
            debug!(sender_id = %sender_id, "loader: history row without embedded sender");
            let profile = self.directory.resolve(sender_id).await;
            for message in messages
                .iter_mut()
                .filter(|message| message.sender_id == sender_id && message.sender.is_none())
            {
                message.sender = Some(profile.clone());
            }
        }

        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(messages)
    }
}
