//! Contracts of the collaborators MessageSync consumes: the auth service, the
//! relational store and the change feed. Concrete implementations live in
//! [`crate::memory`] and [`crate::remote`].

use std::{cmp::Ordering, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use shared::{domain::UserId, error::SyncError};
use tokio::sync::{mpsc, watch};

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub email: Option<String>,
    pub access_token: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub username: Option<String>,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn current_session(&self) -> Option<Session>;
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SyncError>;
    async fn sign_up(&self, credentials: &Credentials) -> Result<Session, SyncError>;
    async fn sign_out(&self) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Serialize) -> Self {
        Self::Eq {
            column: column.into(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    pub fn one_of<T: Serialize>(column: impl Into<String>, values: impl IntoIterator<Item = T>) -> Self {
        Self::In {
            column: column.into(),
            values: values
                .into_iter()
                .map(|value| serde_json::to_value(value).unwrap_or(Value::Null))
                .collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. } | Self::In { column, .. } => column,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(self.column()) else {
            return false;
        };
        match self {
            Self::Eq { value, .. } => values_equal(actual, value),
            Self::In { values, .. } => values.iter().any(|value| values_equal(actual, value)),
        }
    }

    /// Operator expression understood by PostgREST and the realtime filter
    /// syntax, e.g. `eq.42` or `in.(1,2)`.
    pub fn operator_expression(&self) -> String {
        match self {
            Self::Eq { value, .. } => format!("eq.{}", plain_text(value)),
            Self::In { values, .. } => {
                let joined = values.iter().map(plain_text).collect::<Vec<_>>().join(",");
                format!("in.({joined})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub select: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: None,
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn select(mut self, projection: impl Into<String>) -> Self {
        self.select = Some(projection.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, SyncError>;
    async fn insert(&self, table: &str, row: Row) -> Result<Row, SyncError>;
    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<Row, SyncError>;
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Attaching,
    Attached,
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub row: Row,
}

pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub status: watch::Receiver<FeedStatus>,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Issues the subscription request. The returned subscription starts in
    /// [`FeedStatus::Attaching`]; the transport moves it to `Attached`.
    async fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<Subscription, SyncError>;
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// The three collaborators bundled for [`crate::MessageSync::new`].
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthService>,
    pub store: Arc<dyn RelationalStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(l), Value::String(r)) => l.eq_ignore_ascii_case(r),
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

/// Total order over JSON cells: nulls first, timestamps chronologically,
/// numbers numerically, other strings lexicographically.
pub fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(l)), Some(Value::Number(r))) => l
            .as_f64()
            .partial_cmp(&r.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(l)), Some(Value::String(r))) => {
            match (l.parse::<DateTime<Utc>>(), r.parse::<DateTime<Utc>>()) {
                (Ok(l), Ok(r)) => l.cmp(&r),
                _ => l.cmp(r),
            }
        }
        (Some(l), Some(r)) => l.to_string().cmp(&r.to_string()),
    }
}
