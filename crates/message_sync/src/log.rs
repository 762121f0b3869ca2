//! Per-conversation ordered message log and the merge rule shared by the
//! live subscriber and the optimistic sender.

use std::collections::HashSet;

use shared::domain::{LocalId, MessageId};

use crate::types::{Message, MessageKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Confirmed entry took the pending entry's slot.
    Replaced { index: usize },
    /// Server timestamp moved the entry; it was re-inserted in sorted position.
    Reinserted { index: usize },
    /// The confirmed id was already in the log; the pending entry was dropped.
    AlreadyPresent,
    /// No pending entry with that id; the confirmed message was merged as is.
    Merged(MergeOutcome),
}

/// Ordered by `(created_at, key)` ascending. Confirmed ids are unique.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    confirmed: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.confirmed.contains(&id)
    }

    pub fn position(&self, key: MessageKey) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    /// Merges a candidate unless an entry with the same identity exists.
    /// Existing entries are never updated in place.
    pub fn merge(&mut self, candidate: Message) -> MergeOutcome {
        match candidate.key {
            MessageKey::Confirmed(id) if self.confirmed.contains(&id) => {
                return MergeOutcome::Duplicate
            }
            MessageKey::Pending(_) if self.position(candidate.key).is_some() => {
                return MergeOutcome::Duplicate
            }
            _ => {}
        }

        let index = self.sorted_index(&candidate);
        if let Some(id) = candidate.confirmed_id() {
            self.confirmed.insert(id);
        }
        self.entries.insert(index, candidate);
        MergeOutcome::Inserted { index }
    }

    /// Appends an optimistic entry at the tail. Its timestamp is clamped to
    /// the tail's so a skewed local clock cannot break the ordering.
    pub fn append_pending(&mut self, mut message: Message) -> usize {
        if let Some(tail) = self.entries.last() {
            if tail.created_at > message.created_at {
                message.created_at = tail.created_at;
            }
        }
        self.entries.push(message);
        self.entries.len() - 1
    }

    pub fn confirm_pending(&mut self, local_id: LocalId, confirmed: Message) -> ConfirmOutcome {
        let pending_index = self.position(MessageKey::Pending(local_id));
        let Some(confirmed_id) = confirmed.confirmed_id() else {
            return ConfirmOutcome::Merged(MergeOutcome::Duplicate);
        };

        if self.confirmed.contains(&confirmed_id) {
            if let Some(index) = pending_index {
                self.entries.remove(index);
            }
            return ConfirmOutcome::AlreadyPresent;
        }

        let Some(index) = pending_index else {
            return ConfirmOutcome::Merged(self.merge(confirmed));
        };

        let key = confirmed.sort_key();
        let fits_after = index == 0 || self.entries[index - 1].sort_key() <= key;
        let fits_before = index + 1 >= self.entries.len() || key <= self.entries[index + 1].sort_key();
        self.confirmed.insert(confirmed_id);
        if fits_after && fits_before {
            self.entries[index] = confirmed;
            return ConfirmOutcome::Replaced { index };
        }

        self.entries.remove(index);
        let index = self.sorted_index(&confirmed);
        self.entries.insert(index, confirmed);
        ConfirmOutcome::Reinserted { index }
    }

    pub fn remove_pending(&mut self, local_id: LocalId) -> Option<Message> {
        let index = self.position(MessageKey::Pending(local_id))?;
        Some(self.entries.remove(index))
    }

    fn sorted_index(&self, candidate: &Message) -> usize {
        let key = candidate.sort_key();
        self.entries.partition_point(|entry| entry.sort_key() <= key)
    }
}

#[cfg(test)]
#[path = "tests/log_tests.rs"]
mod tests;
