//! In-process backend implementing all three collaborator contracts. Used by
//! the terminal client's offline mode and throughout the tests, which drive
//! delivery order and failures through its hooks.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use shared::{domain::UserId, error::SyncError, protocol::USERS_TABLE};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    compare_values, AuthService, Backend, ChangeEvent, ChangeFeed, ChangeKind, Credentials,
    FeedStatus, Filter, Query, RelationalStore, Row, Session, Subscription, SubscriptionHandle,
};

struct Account {
    user_id: UserId,
    password: String,
    username: Option<String>,
}

struct Subscriber {
    table: String,
    filter: Option<Filter>,
    status: watch::Sender<FeedStatus>,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, table: &str, row: &Row) -> bool {
        self.table == table && self.filter.as_ref().map_or(true, |filter| filter.matches(row))
    }

    fn is_attached(&self) -> bool {
        *self.status.borrow() == FeedStatus::Attached
    }
}

#[derive(Default)]
struct Hooks {
    failing_inserts: usize,
    fail_profile_lookups: bool,
    hold_attachments: bool,
    fail_attach: Option<String>,
    redeliver: bool,
    insert_gate: Option<Arc<Notify>>,
    failing_gate: Option<Arc<Notify>>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    subscribers: HashMap<u64, Subscriber>,
    hooks: Hooks,
}

impl Inner {
    fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Pushes a change to every attached subscriber whose filter matches.
    fn notify(&self, kind: ChangeKind, table: &str, row: &Row) {
        let copies = if self.hooks.redeliver { 2 } else { 1 };
        for subscriber in self.subscribers.values() {
            if !subscriber.is_attached() || !subscriber.wants(table, row) {
                continue;
            }
            for _ in 0..copies {
                let _ = subscriber.events.send(ChangeEvent {
                    kind,
                    table: table.to_string(),
                    row: row.clone(),
                });
            }
        }
    }

    fn project(&self, row: &Row, select: Option<&str>) -> Row {
        let Some(select) = select else {
            return row.clone();
        };
        let mut projected = Row::new();
        for item in split_top_level(select) {
            if item == "*" {
                projected.extend(row.clone());
            } else if let Some((name, columns)) = item
                .strip_suffix(')')
                .and_then(|item| item.split_once('('))
            {
                let name = name.trim();
                projected.insert(name.to_string(), self.embed(name, columns, row));
            } else if let Some(value) = row.get(item) {
                projected.insert(item.to_string(), value.clone());
            }
        }
        projected
    }

    /// Resolves `table(columns)` through the row's foreign key, the way the
    /// hosted store embeds to-one relations.
    fn embed(&self, table: &str, columns: &str, row: &Row) -> Value {
        let Some(key) = foreign_key(table, row) else {
            return Value::Null;
        };
        let target = Filter::eq("id", key);
        self.rows(table)
            .iter()
            .find(|candidate| target.matches(candidate))
            .map(|found| Value::Object(self.project(found, Some(columns))))
            .unwrap_or(Value::Null)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    handles: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend {
            auth: Arc::clone(self) as Arc<dyn AuthService>,
            store: Arc::clone(self) as Arc<dyn RelationalStore>,
            feed: Arc::clone(self) as Arc<dyn ChangeFeed>,
        }
    }

    /// Stores a row as pre-existing data: no id assignment, no notifications.
    pub async fn seed(&self, table: &str, row: Row) {
        self.inner
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.inner.lock().await.rows(table).to_vec()
    }

    pub async fn register_account(
        &self,
        email: &str,
        password: &str,
        username: Option<&str>,
    ) -> UserId {
        let user_id = UserId::new_v4();
        self.inner.lock().await.accounts.insert(
            email.to_ascii_lowercase(),
            Account {
                user_id,
                password: password.to_string(),
                username: username.map(str::to_string),
            },
        );
        user_id
    }

    pub async fn set_session(&self, session: Option<Session>) {
        self.inner.lock().await.session = session;
    }

    pub async fn fail_next_inserts(&self, count: usize) {
        self.inner.lock().await.hooks.failing_inserts = count;
    }

    pub async fn fail_profile_lookups(&self, fail: bool) {
        self.inner.lock().await.hooks.fail_profile_lookups = fail;
    }

    /// New subscriptions stay in `Attaching` until [`Self::release_attachments`].
    pub async fn hold_attachments(&self) {
        self.inner.lock().await.hooks.hold_attachments = true;
    }

    pub async fn release_attachments(&self) {
        let mut inner = self.inner.lock().await;
        inner.hooks.hold_attachments = false;
        for subscriber in inner.subscribers.values() {
            if *subscriber.status.borrow() == FeedStatus::Attaching {
                subscriber.status.send_replace(FeedStatus::Attached);
            }
        }
    }

    /// New subscriptions report `Failed(reason)` instead of attaching.
    pub async fn fail_attach(&self, reason: Option<&str>) {
        self.inner.lock().await.hooks.fail_attach = reason.map(str::to_string);
    }

    /// Deliver every change twice, as an at-least-once transport may.
    pub async fn redeliver(&self, enabled: bool) {
        self.inner.lock().await.hooks.redeliver = enabled;
    }

    /// The next insert is stored and announced immediately, but its response
    /// is withheld until the returned gate is notified.
    pub async fn hold_insert_responses(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner.lock().await.hooks.insert_gate = Some(Arc::clone(&gate));
        gate
    }

    /// The next insert stores nothing and fails once the returned gate is
    /// notified, like a write that times out on its way to the server.
    pub async fn hold_failing_insert(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner.lock().await.hooks.failing_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Delivers an insert event for `row` without storing it.
    pub async fn deliver_raw(&self, table: &str, row: Row) {
        self.inner.lock().await.notify(ChangeKind::Insert, table, &row);
    }

    /// Delivers an insert to every attached subscriber of `table`, ignoring
    /// their filters, like a transport that leaks events across channels.
    pub async fn broadcast_unfiltered(&self, table: &str, row: Row) {
        let inner = self.inner.lock().await;
        for subscriber in inner.subscribers.values() {
            if subscriber.table == table && subscriber.is_attached() {
                let _ = subscriber.events.send(ChangeEvent {
                    kind: ChangeKind::Insert,
                    table: table.to_string(),
                    row: row.clone(),
                });
            }
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

#[async_trait]
impl AuthService for MemoryBackend {
    async fn current_session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let mut inner = self.inner.lock().await;
        let email = credentials.email.to_ascii_lowercase();
        let session = match inner.accounts.get(&email) {
            Some(account) if account.password == credentials.password => Session {
                user_id: account.user_id,
                email: Some(email),
                access_token: format!("memory-{}", Uuid::new_v4()),
                username: account.username.clone(),
            },
            _ => return Err(SyncError::unauthorized("invalid login credentials")),
        };
        inner.session = Some(session.clone());
        Ok(session)
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        let mut inner = self.inner.lock().await;
        let email = credentials.email.to_ascii_lowercase();
        if inner.accounts.contains_key(&email) {
            return Err(SyncError::unavailable("user already registered"));
        }
        let user_id = UserId::new_v4();
        inner.accounts.insert(
            email.clone(),
            Account {
                user_id,
                password: credentials.password.clone(),
                username: credentials.username.clone(),
            },
        );
        let session = Session {
            user_id,
            email: Some(email),
            access_token: format!("memory-{}", Uuid::new_v4()),
            username: credentials.username.clone(),
        };
        inner.session = Some(session.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), SyncError> {
        self.inner.lock().await.session = None;
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for MemoryBackend {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, SyncError> {
        let inner = self.inner.lock().await;
        if query.table == USERS_TABLE && inner.hooks.fail_profile_lookups {
            return Err(SyncError::unavailable("profile lookup failed"));
        }

        let mut rows: Vec<&Row> = inner
            .rows(&query.table)
            .iter()
            .filter(|row| query.filters.iter().all(|filter| filter.matches(row)))
            .collect();
        rows.sort_by(|a, b| {
            query
                .order
                .iter()
                .map(|order| {
                    let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                    if order.ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows
            .into_iter()
            .map(|row| inner.project(row, query.select.as_deref()))
            .collect())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, SyncError> {
        let failing = self.inner.lock().await.hooks.failing_gate.take();
        if let Some(gate) = failing {
            debug!(table, "memory: holding a failing insert");
            gate.notified().await;
            return Err(SyncError::unavailable(format!("insert into {table} timed out")));
        }

        let gate = {
            let mut inner = self.inner.lock().await;
            if inner.hooks.failing_inserts > 0 {
                inner.hooks.failing_inserts -= 1;
                return Err(SyncError::unavailable(format!("insert into {table} failed")));
            }

            if !row.get("id").is_some_and(|id| !id.is_null()) {
                row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            if !row.get("created_at").is_some_and(|at| !at.is_null()) {
                row.insert(
                    "created_at".into(),
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
                );
            }

            let exists = row
                .get("id")
                .map(|id| Filter::eq("id", id))
                .is_some_and(|same_id| inner.rows(table).iter().any(|r| same_id.matches(r)));
            if exists {
                return Err(SyncError::unavailable(format!(
                    "duplicate key value violates unique constraint on {table}.id"
                )));
            }

            inner
                .tables
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            inner.notify(ChangeKind::Insert, table, &row);
            inner.hooks.insert_gate.take()
        };

        if let Some(gate) = gate {
            debug!(table, "memory: holding insert response");
            gate.notified().await;
        }
        Ok(row)
    }

    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<Row, SyncError> {
        let existing = {
            let mut inner = self.inner.lock().await;
            // `on_conflict` may name several columns, comma separated.
            let conflict: Option<Vec<Filter>> = conflict_key
                .split(',')
                .map(str::trim)
                .map(|column| row.get(column).map(|key| Filter::eq(column, key)))
                .collect();
            let updated = conflict.and_then(|conflict| {
                let stored = inner
                    .tables
                    .get_mut(table)?
                    .iter_mut()
                    .find(|stored| conflict.iter().all(|filter| filter.matches(stored)))?;
                stored.extend(row.clone());
                Some(stored.clone())
            });
            if let Some(updated) = &updated {
                inner.notify(ChangeKind::Update, table, updated);
            }
            updated
        };

        match existing {
            Some(updated) => Ok(updated),
            None => self.insert(table, row).await,
        }
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let mut changed = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            for row in rows
                .iter_mut()
                .filter(|row| filters.iter().all(|filter| filter.matches(row)))
            {
                row.extend(patch.clone());
                changed.push(row.clone());
            }
        }
        for row in &changed {
            inner.notify(ChangeKind::Update, table, row);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<Subscription, SyncError> {
        let handle = SubscriptionHandle(self.handles.fetch_add(1, AtomicOrdering::SeqCst) + 1);
        let mut inner = self.inner.lock().await;

        let initial = match (&inner.hooks.fail_attach, inner.hooks.hold_attachments) {
            (Some(reason), _) => FeedStatus::Failed(reason.clone()),
            (None, true) => FeedStatus::Attaching,
            (None, false) => FeedStatus::Attached,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        inner.subscribers.insert(
            handle.0,
            Subscriber {
                table: table.to_string(),
                filter,
                status: status_tx,
                events: events_tx,
            },
        );
        debug!(table, handle = handle.0, "memory: subscription registered");

        Ok(Subscription {
            handle,
            status: status_rx,
            events: events_rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(subscriber) = self.inner.lock().await.subscribers.remove(&handle.0) {
            subscriber.status.send_replace(FeedStatus::Closed);
            debug!(table = %subscriber.table, handle = handle.0, "memory: subscription removed");
        }
    }
}

fn split_top_level(select: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, ch) in select.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(select[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(select[start..].trim());
    parts.retain(|part| !part.is_empty());
    parts
}

fn foreign_key<'a>(table: &str, row: &'a Row) -> Option<&'a Value> {
    let candidates: Vec<String> = if table == USERS_TABLE {
        vec!["sender_id".into(), "user_id".into()]
    } else {
        vec![format!("{}_id", table.trim_end_matches('s'))]
    };
    candidates
        .iter()
        .filter_map(|column| row.get(column))
        .find(|value| !value.is_null())
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
