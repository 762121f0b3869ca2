use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{ConversationId, LocalId, UserId},
    error::ErrorReport,
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{AuthService, Backend, ChangeFeed, SubscriptionHandle},
    chat_list::ChatListSync,
    loader::InitialLoader,
    log::{MergeOutcome, MessageLog},
    pending::PendingSends,
    profiles::SenderDirectory,
    repository::ChatRepository,
    session::SessionManager,
    types::{LiveStatus, LoadStatus, Message, SyncEvent, SyncView},
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How far apart a subscription echo and a pending send may be stamped
    /// and still be treated as the same message.
    pub echo_match_window: Duration,
    /// Run one catch-up fetch once the live subscription is attached.
    pub resync_on_attach: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            echo_match_window: Duration::from_secs(60),
            resync_on_attach: true,
        }
    }
}

/// Issued per activation. Every task spawned for that activation carries it
/// and must match it against the current state before mutating anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationToken {
    pub conversation_id: ConversationId,
    pub epoch: u64,
}

pub(crate) enum SyncState {
    Inactive,
    Active(ActiveConversation),
}

pub(crate) struct ActiveConversation {
    pub(crate) token: ActivationToken,
    pub(crate) load: LoadStatus,
    pub(crate) live: LiveStatus,
    pub(crate) log: MessageLog,
    pub(crate) pending: PendingSends,
    pub(crate) compose_restore: Option<String>,
    pub(crate) subscription: Option<SubscriptionHandle>,
    pub(crate) live_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncomingOutcome {
    Merged,
    Reconciled(LocalId),
    Duplicate,
}

impl ActiveConversation {
    fn new(token: ActivationToken) -> Self {
        Self {
            token,
            load: LoadStatus::Loading,
            live: LiveStatus::Detached,
            log: MessageLog::new(),
            pending: PendingSends::new(),
            compose_restore: None,
            subscription: None,
            live_task: None,
        }
    }

    /// Merge path for confirmed messages arriving from the store: echoes of
    /// our own in-flight sends take over the pending entry, everything else
    /// goes through the log's dedup rule.
    pub(crate) fn apply_incoming(
        &mut self,
        message: Message,
        current_user: Option<UserId>,
        echo_window: chrono::Duration,
    ) -> IncomingOutcome {
        if let Some(id) = message.confirmed_id() {
            if self.log.contains(id) {
                return IncomingOutcome::Duplicate;
            }
        }

        if current_user == Some(message.sender_id) {
            if let Some(local_id) = self.pending.match_echo(&message, echo_window) {
                self.log.confirm_pending(local_id, message);
                return IncomingOutcome::Reconciled(local_id);
            }
        }

        match self.log.merge(message) {
            MergeOutcome::Inserted { .. } => IncomingOutcome::Merged,
            MergeOutcome::Duplicate => IncomingOutcome::Duplicate,
        }
    }

    /// Applies a fetched history on top of whatever arrived live or was sent
    /// meanwhile. Returns how many rows were new to the log.
    pub(crate) fn absorb_snapshot(
        &mut self,
        snapshot: Vec<Message>,
        current_user: Option<UserId>,
        echo_window: chrono::Duration,
    ) -> usize {
        snapshot
            .into_iter()
            .map(|message| self.apply_incoming(message, current_user, echo_window))
            .filter(|outcome| *outcome != IncomingOutcome::Duplicate)
            .count()
    }
}

impl SyncState {
    fn view(&self) -> SyncView {
        match self {
            Self::Inactive => SyncView::default(),
            Self::Active(active) => SyncView {
                conversation_id: Some(active.token.conversation_id),
                load: active.load.clone(),
                live: active.live.clone(),
                messages: active.log.messages().to_vec(),
                pending_sends: active.pending.len(),
            },
        }
    }
}

/// Keeps the active conversation's message log consistent with the store:
/// initial load, live inserts and optimistic sends all merge into one log.
pub struct MessageSync {
    pub(crate) auth: Arc<dyn AuthService>,
    pub(crate) feed: Arc<dyn ChangeFeed>,
    pub(crate) repo: ChatRepository,
    pub(crate) directory: Arc<SenderDirectory>,
    pub(crate) loader: InitialLoader,
    pub(crate) settings: SyncSettings,
    chat_list: Arc<ChatListSync>,
    epochs: AtomicU64,
    pub(crate) state: Mutex<SyncState>,
    view: watch::Sender<SyncView>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
}

impl MessageSync {
    pub fn new(backend: Backend, settings: SyncSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (view, _) = watch::channel(SyncView::default());
        let repo = ChatRepository::new(Arc::clone(&backend.store));
        let directory = Arc::new(SenderDirectory::new(repo.clone(), events.clone()));
        let chat_list = ChatListSync::new(
            repo.clone(),
            Arc::clone(&backend.feed),
            Arc::clone(&backend.auth),
            events.clone(),
        );

        Arc::new(Self {
            auth: backend.auth,
            feed: backend.feed,
            loader: InitialLoader::new(repo.clone(), Arc::clone(&directory)),
            repo,
            directory,
            settings,
            chat_list,
            epochs: AtomicU64::new(0),
            state: Mutex::new(SyncState::Inactive),
            view,
            events,
        })
    }

    pub fn chat_list(&self) -> &Arc<ChatListSync> {
        &self.chat_list
    }

    pub fn directory(&self) -> &Arc<SenderDirectory> {
        &self.directory
    }

    pub fn repository(&self) -> &ChatRepository {
        &self.repo
    }

    /// Sign-in flows sharing this instance's auth service and sender cache.
    pub fn sessions(&self) -> SessionManager {
        SessionManager::new(
            Arc::clone(&self.auth),
            self.repo.clone(),
            Arc::clone(&self.directory),
        )
    }

    pub fn snapshot(&self) -> SyncView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.view.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        match &*self.state.lock().await {
            SyncState::Active(active) => Some(active.token.conversation_id),
            SyncState::Inactive => None,
        }
    }

    /// Compose text handed back by the last failed send, if the user has not
    /// picked it up yet.
    pub async fn take_compose_restore(&self) -> Option<String> {
        match &mut *self.state.lock().await {
            SyncState::Active(active) => active.compose_restore.take(),
            SyncState::Inactive => None,
        }
    }

    /// Tears down whatever was active, then loads `conversation_id` and
    /// attaches its live subscription. Resolves once the initial load has
    /// finished; a load superseded by a later activation resolves `Ok` without
    /// touching state.
    pub async fn activate(self: &Arc<Self>, conversation_id: ConversationId) -> Result<(), ErrorReport> {
        let token = ActivationToken {
            conversation_id,
            epoch: self.epochs.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let previous = {
            let mut state = self.state.lock().await;
            let previous = std::mem::replace(
                &mut *state,
                SyncState::Active(ActiveConversation::new(token)),
            );
            self.publish(&state);
            previous
        };
        self.release(previous).await;

        info!(
            conversation_id = %conversation_id,
            epoch = token.epoch,
            "sync: activating conversation"
        );
        self.chat_list.set_active(Some(conversation_id)).await;
        self.attach_live(token).await;

        match self.loader.load(conversation_id).await {
            Ok(messages) => {
                let me = self.current_user().await;
                let window = self.echo_window();
                let applied = self
                    .with_active(token, |active| {
                        active.absorb_snapshot(messages, me, window);
                        active.load = LoadStatus::Ready;
                        active.log.len()
                    })
                    .await;
                match applied {
                    Some(len) => self.emit_log_changed(conversation_id, len),
                    None => debug!(
                        conversation_id = %conversation_id,
                        epoch = token.epoch,
                        "sync: discarding superseded initial load"
                    ),
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    "sync: initial load failed: {err}"
                );
                let report = err.report();
                let failed = report.clone();
                let applied = self
                    .with_active(token, move |active| active.load = LoadStatus::Failed(failed))
                    .await;
                match applied {
                    Some(()) => Err(report),
                    None => Ok(()),
                }
            }
        }
    }

    pub async fn deactivate(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            let previous = std::mem::replace(&mut *state, SyncState::Inactive);
            self.publish(&state);
            previous
        };
        if let SyncState::Active(active) = &previous {
            info!(
                conversation_id = %active.token.conversation_id,
                epoch = active.token.epoch,
                "sync: deactivating conversation"
            );
        }
        self.release(previous).await;
        self.chat_list.set_active(None).await;
    }

    async fn release(&self, previous: SyncState) {
        let SyncState::Active(mut active) = previous else {
            return;
        };
        if let Some(task) = active.live_task.take() {
            task.abort();
        }
        if let Some(handle) = active.subscription.take() {
            self.feed.unsubscribe(handle).await;
        }
        debug!(
            conversation_id = %active.token.conversation_id,
            epoch = active.token.epoch,
            dropped_pending = active.pending.len(),
            "sync: released conversation"
        );
    }

    pub(crate) async fn is_current(&self, token: ActivationToken) -> bool {
        matches!(&*self.state.lock().await, SyncState::Active(active) if active.token == token)
    }

    /// Applies `apply` to the active conversation if `token` still owns it and
    /// publishes the resulting view. Returns `None` for stale tokens.
    pub(crate) async fn with_active<R>(
        &self,
        token: ActivationToken,
        apply: impl FnOnce(&mut ActiveConversation) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock().await;
        let SyncState::Active(active) = &mut *state else {
            return None;
        };
        if active.token != token {
            return None;
        }
        let result = apply(active);
        self.publish(&state);
        Some(result)
    }

    pub(crate) fn publish(&self, state: &SyncState) {
        self.view.send_replace(state.view());
    }

    pub(crate) async fn current_user(&self) -> Option<UserId> {
        self.auth
            .current_session()
            .await
            .map(|session| session.user_id)
    }

    pub(crate) fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.echo_match_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    pub(crate) fn emit_log_changed(&self, conversation_id: ConversationId, len: usize) {
        let _ = self.events.send(SyncEvent::LogChanged {
            conversation_id,
            len,
        });
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
