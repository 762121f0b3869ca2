//! Demo data: two accounts sharing one direct chat that opens with a welcome
//! message. Seeding is idempotent.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, ParticipantRole, UserId},
    error::SyncError,
    protocol::{ChatParticipantRow, ChatRow, NewMessageRow, UserRow},
};
use tracing::info;
use uuid::Uuid;

use crate::{repository::ChatRepository, session::default_avatar_url};

pub const DEMO_ALICE: UserId = UserId(Uuid::from_u128(1));
pub const DEMO_BOB: UserId = UserId(Uuid::from_u128(2));
pub const DEMO_CHAT: ConversationId = ConversationId(Uuid::from_u128(0x10));
pub const DEMO_CHAT_TITLE: &str = "Alice & Bob";
pub const DEMO_WELCOME: &str = "Hey Bob, welcome to our chat!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSeed {
    pub alice: UserId,
    pub bob: UserId,
    pub chat: ConversationId,
}

impl Default for DemoSeed {
    fn default() -> Self {
        Self {
            alice: DEMO_ALICE,
            bob: DEMO_BOB,
            chat: DEMO_CHAT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub chat: ConversationId,
    /// False when the chat already had history and no welcome was written.
    pub wrote_welcome: bool,
}

pub async fn seed_demo(
    repo: &ChatRepository,
    seed: &DemoSeed,
    now: DateTime<Utc>,
) -> Result<SeedReport, SyncError> {
    for (id, username) in [(seed.alice, "alice"), (seed.bob, "bob")] {
        repo.upsert_profile(&UserRow {
            id,
            username: username.to_string(),
            avatar_url: Some(default_avatar_url(id)),
            email: None,
            phone_number: None,
            updated_at: Some(now),
        })
        .await?;
    }

    repo.upsert_conversation(&ChatRow {
        id: seed.chat,
        title: DEMO_CHAT_TITLE.to_string(),
        kind: ConversationKind::Direct,
        updated_at: Some(now),
    })
    .await?;
    for (user_id, role) in [
        (seed.alice, ParticipantRole::Admin),
        (seed.bob, ParticipantRole::Member),
    ] {
        repo.add_participant(&ChatParticipantRow {
            chat_id: seed.chat,
            user_id,
            role,
        })
        .await?;
    }

    let wrote_welcome = repo.messages_for(seed.chat).await?.is_empty();
    if wrote_welcome {
        repo.insert_message(&NewMessageRow {
            id: MessageId::new_v4(),
            chat_id: seed.chat,
            sender_id: seed.alice,
            content: DEMO_WELCOME.to_string(),
            read: false,
            created_at: now,
        })
        .await?;
    }
    info!(conversation_id = %seed.chat, wrote_welcome, "seed: demo chat ready");

    Ok(SeedReport {
        chat: seed.chat,
        wrote_welcome,
    })
}
