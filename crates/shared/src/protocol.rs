use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, ConversationKind, MessageId, ParticipantRole, UserId};

pub const MESSAGES_TABLE: &str = "messages";
pub const USERS_TABLE: &str = "users";
pub const CHATS_TABLE: &str = "chats";
pub const CHAT_PARTICIPANTS_TABLE: &str = "chat_participants";

/// Projection used when reading messages together with the embedded author.
pub const MESSAGE_WITH_SENDER_SELECT: &str =
    "id,chat_id,sender_id,content,created_at,users(username,avatar_url)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub chat_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<ProfileRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageRow {
    /// Generated by the client so the write and its echo share one identity.
    pub id: MessageId,
    pub chat_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: ConversationId,
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatParticipantRow {
    pub chat_id: ConversationId,
    pub user_id: UserId,
    #[serde(default)]
    pub role: ParticipantRole,
}
