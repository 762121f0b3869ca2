use chrono::{TimeZone, Utc};
use shared::domain::UserId;
use uuid::Uuid;

use super::*;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

fn chat_id(n: u128) -> ConversationId {
    ConversationId(Uuid::from_u128(n))
}

fn chat(n: u128, title: &str, updated: Option<i64>) -> ChatRow {
    ChatRow {
        id: chat_id(n),
        title: title.to_string(),
        kind: ConversationKind::Direct,
        updated_at: updated.map(at),
    }
}

fn row(id: u128, chat: u128, sender: u128, content: &str, seconds: i64) -> MessageRow {
    MessageRow {
        id: MessageId(Uuid::from_u128(id)),
        chat_id: chat_id(chat),
        sender_id: UserId(Uuid::from_u128(sender)),
        content: content.to_string(),
        created_at: at(seconds),
        read: Some(false),
        users: None,
    }
}

fn titles(list: &ChatList) -> Vec<&str> {
    list.summaries().iter().map(|chat| chat.title.as_str()).collect()
}

#[test]
fn list_is_ordered_by_recent_activity_with_placeholder_previews() {
    let mut latest = HashMap::new();
    latest.insert(chat_id(2), row(100, 2, 1, "see you", 50));
    let list = ChatList::from_rows(
        vec![
            chat(1, "Alice & Bob", Some(10)),
            chat(2, "Team", Some(50)),
            chat(3, "Never used", None),
        ],
        latest,
    );

    assert_eq!(titles(&list), ["Team", "Alice & Bob", "Never used"]);
    assert_eq!(list.get(chat_id(2)).map(ChatSummary::preview), Some("see you"));
    assert_eq!(
        list.get(chat_id(1)).map(ChatSummary::preview),
        Some(NO_MESSAGES_PREVIEW)
    );
}

#[test]
fn equal_activity_falls_back_to_id_order() {
    let list = ChatList::from_rows(
        vec![chat(9, "nine", Some(5)), chat(4, "four", Some(5))],
        HashMap::new(),
    );
    assert_eq!(titles(&list), ["four", "nine"]);
}

#[test]
fn new_message_moves_its_chat_to_the_top_and_counts_unread() {
    let mut list = ChatList::from_rows(
        vec![chat(1, "first", Some(20)), chat(2, "second", Some(10))],
        HashMap::new(),
    );

    assert_eq!(
        list.apply_message(&row(7, 2, 5, "ping", 30), true),
        ChatListUpdate::Applied
    );
    assert_eq!(titles(&list), ["second", "first"]);
    let second = list.get(chat_id(2)).expect("listed");
    assert_eq!(second.preview(), "ping");
    assert_eq!(second.unread_count, 1);
}

#[test]
fn redelivered_message_is_counted_once() {
    let mut list = ChatList::from_rows(vec![chat(1, "first", Some(0))], HashMap::new());
    let message = row(7, 1, 5, "ping", 30);

    assert_eq!(list.apply_message(&message, true), ChatListUpdate::Applied);
    assert_eq!(list.apply_message(&message, true), ChatListUpdate::Duplicate);
    assert_eq!(list.get(chat_id(1)).map(|chat| chat.unread_count), Some(1));
}

#[test]
fn older_message_does_not_replace_a_newer_preview() {
    let mut latest = HashMap::new();
    latest.insert(chat_id(1), row(1, 1, 5, "newest", 40));
    let mut list = ChatList::from_rows(vec![chat(1, "first", Some(40))], latest);

    list.apply_message(&row(2, 1, 5, "late arrival", 10), false);
    let first = list.get(chat_id(1)).expect("listed");
    assert_eq!(first.preview(), "newest");
    assert_eq!(first.updated_at, Some(at(40)));
}

#[test]
fn message_for_an_unlisted_chat_is_reported() {
    let mut list = ChatList::from_rows(vec![chat(1, "first", Some(0))], HashMap::new());
    assert_eq!(
        list.apply_message(&row(7, 99, 5, "hello", 1), true),
        ChatListUpdate::UnknownConversation
    );
    assert_eq!(list.summaries().len(), 1);
}

#[test]
fn mark_read_clears_the_counter_once() {
    let mut list = ChatList::from_rows(vec![chat(1, "first", Some(0))], HashMap::new());
    list.apply_message(&row(7, 1, 5, "a", 1), true);
    list.apply_message(&row(8, 1, 5, "b", 2), true);

    assert!(list.mark_read(chat_id(1)));
    assert!(!list.mark_read(chat_id(1)));
    assert_eq!(list.get(chat_id(1)).map(|chat| chat.unread_count), Some(0));
}

#[test]
fn reload_keeps_unread_counters() {
    let mut previous = ChatList::from_rows(vec![chat(1, "first", Some(0))], HashMap::new());
    previous.apply_message(&row(7, 1, 5, "a", 1), true);

    let mut latest = HashMap::new();
    latest.insert(chat_id(1), row(7, 1, 5, "a", 1));
    let mut reloaded = ChatList::from_rows(vec![chat(1, "first", Some(1))], latest);
    reloaded.carry_unread(&previous);

    assert_eq!(reloaded.get(chat_id(1)).map(|chat| chat.unread_count), Some(1));
    assert_eq!(
        reloaded.apply_message(&row(7, 1, 5, "a", 1), true),
        ChatListUpdate::Duplicate
    );
}

#[test]
fn renamed_chat_keeps_its_counters_and_moves_with_activity() {
    let mut list = ChatList::from_rows(
        vec![chat(1, "first", Some(10)), chat(2, "second", Some(5))],
        HashMap::new(),
    );
    list.apply_message(&row(7, 2, 5, "a", 6), true);

    assert!(list.apply_chat(&chat(2, "renamed", Some(20))));
    assert_eq!(titles(&list), ["renamed", "first"]);
    assert_eq!(list.get(chat_id(2)).map(|chat| chat.unread_count), Some(1));

    // An older timestamp never rewinds activity.
    assert!(list.apply_chat(&chat(2, "renamed", Some(1))));
    assert_eq!(titles(&list), ["renamed", "first"]);

    assert!(!list.apply_chat(&chat(3, "stranger", Some(30))));
    assert_eq!(list.summaries().len(), 2);
}
