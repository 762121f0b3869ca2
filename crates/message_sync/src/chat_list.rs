//! Conversation list with last-message previews and unread counters, kept
//! current by global subscriptions to messages, chats and memberships.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId},
    error::SyncError,
    protocol::{
        ChatParticipantRow, ChatRow, MessageRow, CHATS_TABLE, CHAT_PARTICIPANTS_TABLE,
        MESSAGES_TABLE,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{
        AuthService, ChangeEvent, ChangeFeed, ChangeKind, FeedStatus, Subscription,
        SubscriptionHandle,
    },
    repository::{decode_row, ChatRepository},
    types::SyncEvent,
};

pub const NO_MESSAGES_PREVIEW: &str = "No messages yet";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSummary {
    pub id: ConversationId,
    pub title: String,
    pub kind: ConversationKind,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: usize,
}

impl ChatSummary {
    pub fn preview(&self) -> &str {
        self.last_message.as_deref().unwrap_or(NO_MESSAGES_PREVIEW)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatListUpdate {
    Applied,
    Duplicate,
    UnknownConversation,
}

/// Summaries ordered by `updated_at` descending, ties by id.
#[derive(Debug, Clone, Default)]
pub struct ChatList {
    chats: Vec<ChatSummary>,
    seen: HashSet<MessageId>,
}

impl ChatList {
    pub fn from_rows(chats: Vec<ChatRow>, mut latest: HashMap<ConversationId, MessageRow>) -> Self {
        let mut seen = HashSet::new();
        let chats = chats
            .into_iter()
            .map(|chat| {
                let last = latest.remove(&chat.id);
                if let Some(row) = &last {
                    seen.insert(row.id);
                }
                ChatSummary {
                    id: chat.id,
                    title: chat.title,
                    kind: chat.kind,
                    updated_at: chat.updated_at,
                    last_message_at: last.as_ref().map(|row| row.created_at),
                    last_message: last.map(|row| row.content),
                    unread_count: 0,
                }
            })
            .collect();

        let mut list = Self { chats, seen };
        list.sort();
        list
    }

    pub fn summaries(&self) -> &[ChatSummary] {
        &self.chats
    }

    pub fn get(&self, id: ConversationId) -> Option<&ChatSummary> {
        self.chats.iter().find(|chat| chat.id == id)
    }

    pub fn apply_message(&mut self, row: &MessageRow, count_unread: bool) -> ChatListUpdate {
        if self.seen.contains(&row.id) {
            return ChatListUpdate::Duplicate;
        }
        let Some(chat) = self.chats.iter_mut().find(|chat| chat.id == row.chat_id) else {
            return ChatListUpdate::UnknownConversation;
        };

        self.seen.insert(row.id);
        if chat.last_message_at.map_or(true, |at| at <= row.created_at) {
            chat.last_message = Some(row.content.clone());
            chat.last_message_at = Some(row.created_at);
        }
        if chat.updated_at.map_or(true, |at| at < row.created_at) {
            chat.updated_at = Some(row.created_at);
        }
        if count_unread {
            chat.unread_count += 1;
        }
        self.sort();
        ChatListUpdate::Applied
    }

    /// Takes title, kind and activity from a changed chat row. False when
    /// the chat is not listed.
    pub fn apply_chat(&mut self, row: &ChatRow) -> bool {
        let Some(chat) = self.chats.iter_mut().find(|chat| chat.id == row.id) else {
            return false;
        };
        chat.title = row.title.clone();
        chat.kind = row.kind;
        if row.updated_at > chat.updated_at {
            chat.updated_at = row.updated_at;
        }
        self.sort();
        true
    }

    pub fn mark_read(&mut self, id: ConversationId) -> bool {
        match self.chats.iter_mut().find(|chat| chat.id == id) {
            Some(chat) if chat.unread_count > 0 => {
                chat.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    fn carry_unread(&mut self, previous: &ChatList) {
        for chat in &mut self.chats {
            if let Some(old) = previous.get(chat.id) {
                chat.unread_count = old.unread_count;
            }
        }
        self.seen.extend(previous.seen.iter().copied());
    }

    fn sort(&mut self) {
        self.chats
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    }
}

struct ChatListState {
    list: ChatList,
    active: Option<ConversationId>,
    loaded: bool,
    /// Chats a reload did not list. Their traffic is ignored until one of
    /// our memberships changes.
    unlisted: HashSet<ConversationId>,
}

struct ListFeeds {
    messages: Subscription,
    chats: Subscription,
    members: Subscription,
}

struct LiveList {
    generation: u64,
    handles: [SubscriptionHandle; 3],
    task: JoinHandle<()>,
}

pub struct ChatListSync {
    repo: ChatRepository,
    feed: Arc<dyn ChangeFeed>,
    auth: Arc<dyn AuthService>,
    state: Mutex<ChatListState>,
    live: Mutex<Option<LiveList>>,
    generations: AtomicU64,
    view: watch::Sender<Vec<ChatSummary>>,
    events: broadcast::Sender<SyncEvent>,
}

impl ChatListSync {
    pub fn new(
        repo: ChatRepository,
        feed: Arc<dyn ChangeFeed>,
        auth: Arc<dyn AuthService>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Arc<Self> {
        let (view, _) = watch::channel(Vec::new());
        Arc::new(Self {
            repo,
            feed,
            auth,
            state: Mutex::new(ChatListState {
                list: ChatList::default(),
                active: None,
                loaded: false,
                unlisted: HashSet::new(),
            }),
            live: Mutex::new(None),
            generations: AtomicU64::new(0),
            view,
            events,
        })
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ChatSummary>> {
        self.view.subscribe()
    }

    /// Re-reads the list from the store. Unread counters survive the reload.
    pub async fn reload(&self) -> Result<(), SyncError> {
        let chats = match self.auth.current_session().await {
            Some(session) => self.repo.conversations_for(session.user_id).await?,
            None => self.repo.conversations().await?,
        };
        let ids: Vec<ConversationId> = chats.iter().map(|chat| chat.id).collect();
        let latest = self.repo.last_messages(&ids).await?;
        let mut list = ChatList::from_rows(chats, latest);

        let mut state = self.state.lock().await;
        list.carry_unread(&state.list);
        if let Some(active) = state.active {
            list.mark_read(active);
        }
        state.list = list;
        state.loaded = true;
        info!(count = state.list.summaries().len(), "chat_list: loaded conversations");
        self.publish(&state);
        Ok(())
    }

    /// Loads the list and keeps it current from the global feeds.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.stop().await;
        self.state.lock().await.unlisted.clear();
        self.reload().await?;

        let feeds = self.open_feeds().await?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let handles = [feeds.messages.handle, feeds.chats.handle, feeds.members.handle];
        let task = tokio::spawn(Arc::clone(self).run_live(generation, feeds));

        let previous = self.live.lock().await.replace(LiveList {
            generation,
            handles,
            task,
        });
        if let Some(previous) = previous {
            self.release(previous).await;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.generations.fetch_add(1, Ordering::SeqCst);
        let previous = self.live.lock().await.take();
        if let Some(previous) = previous {
            self.release(previous).await;
        }
    }

    async fn open_feeds(&self) -> Result<ListFeeds, SyncError> {
        let messages = self.feed.subscribe(MESSAGES_TABLE, None).await?;
        let chats = match self.feed.subscribe(CHATS_TABLE, None).await {
            Ok(chats) => chats,
            Err(err) => {
                self.feed.unsubscribe(messages.handle).await;
                return Err(err);
            }
        };
        let members = match self.feed.subscribe(CHAT_PARTICIPANTS_TABLE, None).await {
            Ok(members) => members,
            Err(err) => {
                self.feed.unsubscribe(messages.handle).await;
                self.feed.unsubscribe(chats.handle).await;
                return Err(err);
            }
        };
        Ok(ListFeeds {
            messages,
            chats,
            members,
        })
    }

    async fn release(&self, live: LiveList) {
        live.task.abort();
        for handle in live.handles {
            self.feed.unsubscribe(handle).await;
        }
        debug!(generation = live.generation, "chat_list: released subscriptions");
    }

    pub async fn set_active(&self, active: Option<ConversationId>) {
        let mut state = self.state.lock().await;
        state.active = active;
        if let Some(id) = active {
            state.list.mark_read(id);
        }
        self.publish(&state);
    }

    /// Folds a confirmed message into the list. A conversation that is
    /// neither listed nor known to be someone else's triggers a reload;
    /// before the first load this is a no-op.
    pub async fn record_message(&self, row: &MessageRow) {
        let me = self
            .auth
            .current_session()
            .await
            .map(|session| session.user_id);

        let update = {
            let mut state = self.state.lock().await;
            if !state.loaded {
                return;
            }
            let count_unread = state.active != Some(row.chat_id) && me != Some(row.sender_id);
            let update = state.list.apply_message(row, count_unread);
            if update == ChatListUpdate::Applied {
                self.publish(&state);
            }
            if update == ChatListUpdate::UnknownConversation
                && state.unlisted.contains(&row.chat_id)
            {
                return;
            }
            update
        };

        match update {
            ChatListUpdate::Applied | ChatListUpdate::Duplicate => {}
            ChatListUpdate::UnknownConversation => {
                debug!(conversation_id = %row.chat_id, "chat_list: message for unlisted conversation");
                self.reload_for(row.chat_id).await;
            }
        }
    }

    /// Reloads because of `id`. If the reload still does not list it, the
    /// chat is not ours and later traffic for it stops causing reloads.
    async fn reload_for(&self, id: ConversationId) {
        if let Err(err) = self.reload().await {
            warn!("chat_list: reload failed: {err}");
            return;
        }
        let mut state = self.state.lock().await;
        if state.list.get(id).is_none() && state.unlisted.insert(id) {
            debug!(conversation_id = %id, "chat_list: conversation is not ours, ignoring it");
        }
    }

    async fn on_chat_change(&self, event: ChangeEvent) {
        if event.kind == ChangeKind::Delete {
            if let Err(err) = self.reload().await {
                warn!("chat_list: reload failed: {err}");
            }
            return;
        }
        let chat = match decode_row::<ChatRow>(event.row) {
            Ok(chat) => chat,
            Err(err) => {
                warn!("chat_list: undecodable chat change: {err}");
                return;
            }
        };

        let unknown = {
            let mut state = self.state.lock().await;
            if !state.loaded {
                return;
            }
            if state.list.apply_chat(&chat) {
                self.publish(&state);
                false
            } else {
                !state.unlisted.contains(&chat.id)
            }
        };
        if unknown {
            debug!(conversation_id = %chat.id, "chat_list: change for unlisted conversation");
            self.reload_for(chat.id).await;
        }
    }

    /// Our own memberships decide which chats are listed; anyone else's are
    /// irrelevant to this list.
    async fn on_membership_change(&self, event: ChangeEvent) {
        let me = self
            .auth
            .current_session()
            .await
            .map(|session| session.user_id);
        match decode_row::<ChatParticipantRow>(event.row) {
            Ok(member) if me.is_some_and(|me| me != member.user_id) => return,
            Ok(member) => {
                self.state.lock().await.unlisted.remove(&member.chat_id);
            }
            // Deletes may carry only the key columns.
            Err(_) => self.state.lock().await.unlisted.clear(),
        }
        if let Err(err) = self.reload().await {
            warn!("chat_list: reload failed: {err}");
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generations.load(Ordering::SeqCst) != generation
    }

    async fn run_live(self: Arc<Self>, generation: u64, feeds: ListFeeds) {
        let ListFeeds {
            messages,
            chats,
            members,
        } = feeds;
        let Subscription {
            mut status,
            mut events,
            ..
        } = messages;
        let mut chat_events = chats.events;
        let mut member_events = members.events;

        let mut status_open = true;
        loop {
            tokio::select! {
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let current = status.borrow_and_update().clone();
                    match current {
                        FeedStatus::Attached => info!("chat_list: live updates attached"),
                        FeedStatus::Failed(reason) => {
                            warn!("chat_list: live updates unavailable: {reason}")
                        }
                        FeedStatus::Attaching | FeedStatus::Closed => {}
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if event.kind != ChangeKind::Insert {
                        continue;
                    }
                    if self.is_stale(generation) {
                        debug!(generation, "chat_list: dropping insert for stale subscription");
                        continue;
                    }
                    match decode_row::<MessageRow>(event.row) {
                        Ok(row) => self.record_message(&row).await,
                        Err(err) => warn!("chat_list: undecodable insert: {err}"),
                    }
                }
                Some(event) = chat_events.recv() => {
                    if !self.is_stale(generation) {
                        self.on_chat_change(event).await;
                    }
                }
                Some(event) = member_events.recv() => {
                    if !self.is_stale(generation) {
                        self.on_membership_change(event).await;
                    }
                }
            }
        }
        debug!(generation, "chat_list: event stream ended");
    }

    fn publish(&self, state: &ChatListState) {
        self.view.send_replace(state.list.summaries().to_vec());
        let _ = self.events.send(SyncEvent::ChatListChanged);
    }
}

#[cfg(test)]
#[path = "tests/chat_list_tests.rs"]
mod tests;
