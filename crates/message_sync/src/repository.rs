use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{ConversationId, UserId},
    error::SyncError,
    protocol::{
        ChatParticipantRow, ChatRow, MessageRow, NewMessageRow, ProfileRow, UserRow,
        CHATS_TABLE, CHAT_PARTICIPANTS_TABLE, MESSAGES_TABLE, MESSAGE_WITH_SENDER_SELECT,
        USERS_TABLE,
    },
};

use crate::backend::{Filter, Order, Query, RelationalStore, Row};

/// Typed chat operations over the generic relational store.
#[derive(Clone)]
pub struct ChatRepository {
    store: Arc<dyn RelationalStore>,
}

impl ChatRepository {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    pub async fn conversation(&self, id: ConversationId) -> Result<Option<ChatRow>, SyncError> {
        let rows = self
            .store
            .query(
                &Query::table(CHATS_TABLE)
                    .select("id,title,type,updated_at")
                    .filter(Filter::eq("id", id))
                    .limit(1),
            )
            .await?;
        rows.into_iter().next().map(decode_row).transpose()
    }

    pub async fn conversations(&self) -> Result<Vec<ChatRow>, SyncError> {
        let rows = self
            .store
            .query(
                &Query::table(CHATS_TABLE)
                    .select("id,title,type,updated_at")
                    .order(Order::desc("updated_at")),
            )
            .await?;
        decode_rows(rows)
    }

    /// Conversations the user takes part in, most recently active first.
    pub async fn conversations_for(&self, user_id: UserId) -> Result<Vec<ChatRow>, SyncError> {
        #[derive(Deserialize)]
        struct Membership {
            chat_id: ConversationId,
        }

        let rows = self
            .store
            .query(
                &Query::table(CHAT_PARTICIPANTS_TABLE)
                    .select("chat_id")
                    .filter(Filter::eq("user_id", user_id)),
            )
            .await?;
        let ids: Vec<ConversationId> = decode_rows::<Membership>(rows)?
            .into_iter()
            .map(|membership| membership.chat_id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .store
            .query(
                &Query::table(CHATS_TABLE)
                    .select("id,title,type,updated_at")
                    .filter(Filter::one_of("id", ids))
                    .order(Order::desc("updated_at")),
            )
            .await?;
        decode_rows(rows)
    }

    pub async fn participants(
        &self,
        id: ConversationId,
    ) -> Result<Vec<ChatParticipantRow>, SyncError> {
        let rows = self
            .store
            .query(&Query::table(CHAT_PARTICIPANTS_TABLE).filter(Filter::eq("chat_id", id)))
            .await?;
        decode_rows(rows)
    }

    /// Full history of a conversation, oldest first, with the author embedded.
    pub async fn messages_for(&self, id: ConversationId) -> Result<Vec<MessageRow>, SyncError> {
        let rows = self
            .store
            .query(
                &Query::table(MESSAGES_TABLE)
                    .select(MESSAGE_WITH_SENDER_SELECT)
                    .filter(Filter::eq("chat_id", id))
                    .order(Order::asc("created_at"))
                    .order(Order::asc("id")),
            )
            .await?;
        decode_rows(rows)
    }

    /// Newest message of each listed conversation.
    pub async fn last_messages(
        &self,
        ids: &[ConversationId],
    ) -> Result<HashMap<ConversationId, MessageRow>, SyncError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .store
            .query(
                &Query::table(MESSAGES_TABLE)
                    .select("id,chat_id,sender_id,content,created_at")
                    .filter(Filter::one_of("chat_id", ids.iter().copied()))
                    .order(Order::desc("created_at")),
            )
            .await?;

        let mut latest = HashMap::new();
        for row in decode_rows::<MessageRow>(rows)? {
            latest.entry(row.chat_id).or_insert(row);
        }
        Ok(latest)
    }

    pub async fn profile(&self, user_id: UserId) -> Result<Option<ProfileRow>, SyncError> {
        let rows = self
            .store
            .query(
                &Query::table(USERS_TABLE)
                    .select("username,avatar_url")
                    .filter(Filter::eq("id", user_id))
                    .limit(1),
            )
            .await?;
        rows.into_iter().next().map(decode_row).transpose()
    }

    pub async fn insert_message(&self, message: &NewMessageRow) -> Result<MessageRow, SyncError> {
        let row = self.store.insert(MESSAGES_TABLE, encode_row(message)?).await?;
        decode_row(row)
    }

    pub async fn touch_conversation(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut patch = Row::new();
        patch.insert("updated_at".into(), serde_json::to_value(at)?);
        self.store
            .update(CHATS_TABLE, &[Filter::eq("id", id)], patch)
            .await
    }

    pub async fn upsert_profile(&self, user: &UserRow) -> Result<UserRow, SyncError> {
        let row = self.store.upsert(USERS_TABLE, encode_row(user)?, "id").await?;
        decode_row(row)
    }

    pub async fn upsert_conversation(&self, chat: &ChatRow) -> Result<ChatRow, SyncError> {
        let row = self.store.upsert(CHATS_TABLE, encode_row(chat)?, "id").await?;
        decode_row(row)
    }

    pub async fn add_participant(
        &self,
        participant: &ChatParticipantRow,
    ) -> Result<ChatParticipantRow, SyncError> {
        let row = self
            .store
            .upsert(
                CHAT_PARTICIPANTS_TABLE,
                encode_row(participant)?,
                "chat_id,user_id",
            )
            .await?;
        decode_row(row)
    }
}

pub(crate) fn decode_row<T: DeserializeOwned>(row: Row) -> Result<T, SyncError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, SyncError> {
    rows.into_iter().map(decode_row).collect()
}

pub(crate) fn encode_row<T: Serialize>(value: &T) -> Result<Row, SyncError> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(SyncError::unavailable(format!(
            "expected a row object, got {other}"
        ))),
    }
}
