#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use message_sync::{
    backend::Row, MemoryBackend, MessageSync, Session, SyncSettings, SyncView,
};
use serde_json::{json, Value};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{CHATS_TABLE, CHAT_PARTICIPANTS_TABLE, MESSAGES_TABLE, USERS_TABLE},
};
use uuid::Uuid;

pub struct Fixture {
    pub memory: Arc<MemoryBackend>,
    pub sync: Arc<MessageSync>,
    pub me: UserId,
    pub bob: UserId,
    pub chat: ConversationId,
    pub other_chat: ConversationId,
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub fn message_id(n: u128) -> MessageId {
    MessageId(Uuid::from_u128(n))
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

pub fn message_row(
    id: u128,
    chat: ConversationId,
    sender: UserId,
    content: &str,
    seconds: i64,
) -> Row {
    row(json!({
        "id": message_id(id),
        "chat_id": chat,
        "sender_id": sender,
        "content": content,
        "created_at": at(seconds),
        "read": false,
    }))
}

/// Two users, two chats; the first chat holds m1..m3 from bob. Signed in as
/// alice.
pub async fn fixture() -> Fixture {
    fixture_with(SyncSettings::default()).await
}

pub async fn fixture_with(settings: SyncSettings) -> Fixture {
    let memory = MemoryBackend::new();
    let me = UserId(Uuid::from_u128(1));
    let bob = UserId(Uuid::from_u128(2));
    let chat = ConversationId(Uuid::from_u128(10));
    let other_chat = ConversationId(Uuid::from_u128(11));

    for (id, name) in [(me, "alice"), (bob, "bob")] {
        memory
            .seed(
                USERS_TABLE,
                row(json!({
                    "id": id,
                    "username": name,
                    "avatar_url": format!("https://i.pravatar.cc/150?u={name}"),
                })),
            )
            .await;
    }
    for (id, title, updated) in [(chat, "Alice & Bob", 3), (other_chat, "Book club", 0)] {
        memory
            .seed(
                CHATS_TABLE,
                row(json!({ "id": id, "title": title, "type": "direct", "updated_at": at(updated) })),
            )
            .await;
        for user in [me, bob] {
            memory
                .seed(
                    CHAT_PARTICIPANTS_TABLE,
                    row(json!({ "chat_id": id, "user_id": user, "role": "member" })),
                )
                .await;
        }
    }
    for (id, body) in [(1, "m1"), (2, "m2"), (3, "m3")] {
        memory
            .seed(MESSAGES_TABLE, message_row(id, chat, bob, body, id as i64))
            .await;
    }

    memory
        .set_session(Some(Session {
            user_id: me,
            email: Some("alice@example.com".into()),
            access_token: "memory-token".into(),
            username: Some("alice".into()),
        }))
        .await;

    let sync = MessageSync::new(memory.backend(), settings);
    Fixture {
        memory,
        sync,
        me,
        bob,
        chat,
        other_chat,
    }
}

/// Waits until the published view satisfies `condition`.
pub async fn wait_for(sync: &MessageSync, condition: impl Fn(&SyncView) -> bool) -> SyncView {
    let mut views = sync.watch();
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let matched = {
                let view = views.borrow_and_update();
                condition(&view).then(|| view.clone())
            };
            if let Some(view) = matched {
                return view;
            }
            if views.changed().await.is_err() {
                return sync.snapshot();
            }
        }
    })
    .await;
    match waited {
        Ok(view) => view,
        Err(_) => panic!("view never reached the expected state: {:?}", sync.snapshot()),
    }
}

/// Lets spawned subscriber tasks drain whatever has been delivered.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn bodies(view: &SyncView) -> Vec<&str> {
    view.messages.iter().map(|message| message.body.as_str()).collect()
}
