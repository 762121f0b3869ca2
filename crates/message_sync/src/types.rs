use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, LocalId, MessageId, UserId},
    error::ErrorReport,
    protocol::{MessageRow, ProfileRow},
};

/// Identity of a log entry: server-assigned once confirmed, a local sequence
/// number while the send is in flight. Confirmed keys sort before pending
/// keys that share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKey {
    Confirmed(MessageId),
    Pending(LocalId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderProfile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl SenderProfile {
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    /// Sentinel used when the author's metadata could not be fetched.
    pub fn unknown() -> Self {
        Self {
            display_name: Self::UNKNOWN_NAME.to_string(),
            avatar_url: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.display_name == Self::UNKNOWN_NAME && self.avatar_url.is_none()
    }
}

impl From<ProfileRow> for SenderProfile {
    fn from(value: ProfileRow) -> Self {
        Self {
            display_name: value.username,
            avatar_url: value.avatar_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub sender: Option<SenderProfile>,
}

impl Message {
    pub fn from_row(row: MessageRow) -> Self {
        Self {
            key: MessageKey::Confirmed(row.id),
            conversation_id: row.chat_id,
            sender_id: row.sender_id,
            body: row.content,
            created_at: row.created_at,
            sender: row.users.map(SenderProfile::from),
        }
    }

    pub fn confirmed_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Pending(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self.key {
            MessageKey::Pending(id) => Some(id),
            MessageKey::Confirmed(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.key, MessageKey::Pending(_))
    }

    pub(crate) fn sort_key(&self) -> (DateTime<Utc>, MessageKey) {
        (self.created_at, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LiveStatus {
    #[default]
    Detached,
    Attaching,
    Attached,
    /// Live updates are unavailable; the loaded log stays usable.
    Unavailable(String),
}

/// What the presentation layer renders for the active conversation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncView {
    pub conversation_id: Option<ConversationId>,
    pub load: LoadStatus,
    pub live: LiveStatus,
    pub messages: Vec<Message>,
    pub pending_sends: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(Message),
    /// Precondition failure; nothing was appended.
    Rejected(ErrorReport),
    /// Dispatch failed; the optimistic entry was rolled back.
    Failed {
        error: ErrorReport,
        restored_body: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    LogChanged {
        conversation_id: ConversationId,
        len: usize,
    },
    LiveStatusChanged {
        conversation_id: ConversationId,
        status: LiveStatus,
    },
    SendFailed {
        conversation_id: ConversationId,
        error: ErrorReport,
        restored_body: String,
    },
    SenderProfileUpdated {
        user_id: UserId,
        profile: SenderProfile,
    },
    ChatListChanged,
    Error(String),
}
