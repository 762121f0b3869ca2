//! In-flight optimistic sends and their temporary-id → confirmed-id mapping.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use shared::domain::{LocalId, MessageId, UserId};

use crate::types::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub local_id: LocalId,
    /// Identity the write was issued with.
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PendingSends {
    next_local: u64,
    inflight: Vec<PendingSend>,
    confirmed: HashMap<LocalId, MessageId>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn allocate(
        &mut self,
        message_id: MessageId,
        sender_id: UserId,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> LocalId {
        self.next_local += 1;
        let local_id = LocalId(self.next_local);
        self.inflight.push(PendingSend {
            local_id,
            message_id,
            sender_id,
            body: body.into(),
            created_at,
        });
        local_id
    }

    pub fn confirmed_id(&self, local_id: LocalId) -> Option<MessageId> {
        self.confirmed.get(&local_id).copied()
    }

    pub fn message_id(&self, local_id: LocalId) -> Option<MessageId> {
        self.inflight
            .iter()
            .find(|send| send.local_id == local_id)
            .map(|send| send.message_id)
    }

    /// True once the echo carrying the send's own identity was received.
    pub fn echoed_own_write(&self, local_id: LocalId) -> bool {
        matches!(
            (self.confirmed_id(local_id), self.message_id(local_id)),
            (Some(echoed), Some(issued)) if echoed == issued
        )
    }

    /// Binds an incoming confirmed message to a send. The send issued with
    /// the message's id wins, even over an earlier content match. Otherwise
    /// the oldest unbound send with the same author and body whose timestamp
    /// lies within `window` is taken.
    pub fn match_echo(&mut self, message: &Message, window: Duration) -> Option<LocalId> {
        let confirmed_id = message.confirmed_id()?;
        if self.confirmed.values().any(|id| *id == confirmed_id) {
            return None;
        }

        if let Some(send) = self
            .inflight
            .iter()
            .find(|send| send.message_id == confirmed_id)
        {
            self.confirmed.insert(send.local_id, confirmed_id);
            return Some(send.local_id);
        }

        let local_id = self
            .inflight
            .iter()
            .filter(|send| !self.confirmed.contains_key(&send.local_id))
            .find(|send| {
                send.sender_id == message.sender_id
                    && send.body == message.body
                    && (message.created_at - send.created_at).abs() <= window
            })
            .map(|send| send.local_id)?;

        self.confirmed.insert(local_id, confirmed_id);
        Some(local_id)
    }

    /// Retires a send once its write has resolved either way.
    pub fn complete(&mut self, local_id: LocalId) -> Option<PendingSend> {
        self.confirmed.remove(&local_id);
        let index = self
            .inflight
            .iter()
            .position(|send| send.local_id == local_id)?;
        Some(self.inflight.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use shared::domain::ConversationId;
    use uuid::Uuid;

    use super::*;
    use crate::types::MessageKey;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    fn issued(n: u128) -> MessageId {
        MessageId(Uuid::from_u128(n))
    }

    fn echo(n: u128, sender: UserId, body: &str, seconds: i64) -> Message {
        Message {
            key: MessageKey::Confirmed(MessageId(Uuid::from_u128(n))),
            conversation_id: ConversationId(Uuid::from_u128(10)),
            sender_id: sender,
            body: body.to_string(),
            created_at: at(seconds),
            sender: None,
        }
    }

    #[test]
    fn echo_binds_to_the_oldest_matching_send() {
        let me = UserId(Uuid::from_u128(1));
        let mut pending = PendingSends::new();
        let first = pending.allocate(issued(90), me, "hello", at(0));
        let second = pending.allocate(issued(91), me, "hello", at(1));

        let window = Duration::seconds(30);
        assert_eq!(pending.match_echo(&echo(100, me, "hello", 1), window), Some(first));
        assert_eq!(pending.match_echo(&echo(101, me, "hello", 2), window), Some(second));
        assert_eq!(pending.confirmed_id(first), Some(MessageId(Uuid::from_u128(100))));
    }

    #[test]
    fn echo_from_someone_else_or_outside_the_window_is_not_bound() {
        let me = UserId(Uuid::from_u128(1));
        let other = UserId(Uuid::from_u128(2));
        let mut pending = PendingSends::new();
        pending.allocate(issued(90), me, "hello", at(0));

        let window = Duration::seconds(30);
        assert_eq!(pending.match_echo(&echo(100, other, "hello", 0), window), None);
        assert_eq!(pending.match_echo(&echo(101, me, "hello", 120), window), None);
        assert_eq!(pending.match_echo(&echo(102, me, "hullo", 0), window), None);
    }

    #[test]
    fn the_same_confirmed_id_binds_only_once() {
        let me = UserId(Uuid::from_u128(1));
        let mut pending = PendingSends::new();
        pending.allocate(issued(90), me, "hello", at(0));
        pending.allocate(issued(91), me, "hello", at(0));

        let window = Duration::seconds(30);
        assert!(pending.match_echo(&echo(100, me, "hello", 0), window).is_some());
        assert!(pending.match_echo(&echo(100, me, "hello", 0), window).is_none());
    }

    #[test]
    fn echo_carrying_the_issued_id_takes_the_send_back_from_a_lookalike() {
        let me = UserId(Uuid::from_u128(1));
        let mut pending = PendingSends::new();
        let local = pending.allocate(issued(90), me, "ok", at(0));

        let window = Duration::seconds(30);
        // Another device wrote the same text first.
        assert_eq!(pending.match_echo(&echo(100, me, "ok", 0), window), Some(local));
        assert!(!pending.echoed_own_write(local));

        assert_eq!(pending.match_echo(&echo(90, me, "ok", 0), window), Some(local));
        assert_eq!(pending.confirmed_id(local), Some(issued(90)));
        assert!(pending.echoed_own_write(local));
    }

    #[test]
    fn issued_id_matches_even_when_the_body_differs() {
        let me = UserId(Uuid::from_u128(1));
        let mut pending = PendingSends::new();
        let local = pending.allocate(issued(90), me, "hello", at(0));

        let trimmed_by_the_server = echo(90, me, "hell", 300);
        assert_eq!(
            pending.match_echo(&trimmed_by_the_server, Duration::seconds(30)),
            Some(local)
        );
    }

    #[test]
    fn completing_a_send_forgets_its_mapping() {
        let me = UserId(Uuid::from_u128(1));
        let mut pending = PendingSends::new();
        let local = pending.allocate(issued(90), me, "hello", at(0));
        pending.match_echo(&echo(100, me, "hello", 0), Duration::seconds(5));

        let retired = pending.complete(local).expect("in flight");
        assert_eq!(retired.body, "hello");
        assert!(pending.is_empty());
        assert_eq!(pending.confirmed_id(local), None);
    }
}
