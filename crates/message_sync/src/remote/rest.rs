use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shared::error::SyncError;
use tracing::debug;

use super::{authorize, check, transport_error, RemoteConfig, SessionCell};
use crate::backend::{Filter, Query, RelationalStore, Row};

const REPRESENTATION: &str = "return=representation";

/// Table access through `/rest/v1/<table>`.
pub struct RestStore {
    http: Client,
    config: Arc<RemoteConfig>,
    session: SessionCell,
}

impl RestStore {
    pub(crate) fn new(http: Client, config: Arc<RemoteConfig>, session: SessionCell) -> Self {
        Self {
            http,
            config,
            session,
        }
    }

    fn table_url(&self, table: &str) -> Result<url::Url, SyncError> {
        self.config.endpoint(&format!("rest/v1/{table}"))
    }
}

/// Query-string pairs for a read: projection, filters, ordering and limit.
pub(crate) fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    pairs.push((
        "select".to_string(),
        query.select.clone().unwrap_or_else(|| "*".to_string()),
    ));
    pairs.extend(filter_pairs(&query.filters));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|order| {
                let direction = if order.ascending { "asc" } else { "desc" };
                format!("{}.{direction}", order.column)
            })
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    pairs
}

fn filter_pairs(filters: &[Filter]) -> impl Iterator<Item = (String, String)> + '_ {
    filters
        .iter()
        .map(|filter| (filter.column().to_string(), filter.operator_expression()))
}

async fn read_rows(response: reqwest::Response) -> Result<Vec<Row>, SyncError> {
    check(response)
        .await?
        .json::<Vec<Row>>()
        .await
        .map_err(|err| SyncError::unavailable(format!("malformed response: {err}")))
}

fn first_row(rows: Vec<Row>, table: &str) -> Result<Row, SyncError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| SyncError::unavailable(format!("write to {table} returned no row")))
}

#[async_trait]
impl RelationalStore for RestStore {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, SyncError> {
        let url = self.table_url(&query.table)?;
        debug!(table = %query.table, "rest: select");
        let request = authorize(
            self.http.get(url).query(&query_pairs(query)),
            &self.config,
            &self.session,
        )
        .await;
        read_rows(request.send().await.map_err(transport_error)?).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, SyncError> {
        let url = self.table_url(table)?;
        debug!(table, "rest: insert");
        let request = authorize(
            self.http
                .post(url)
                .header("Prefer", REPRESENTATION)
                .json(&Value::Object(row)),
            &self.config,
            &self.session,
        )
        .await;
        let rows = read_rows(request.send().await.map_err(transport_error)?).await?;
        first_row(rows, table)
    }

    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<Row, SyncError> {
        let url = self.table_url(table)?;
        debug!(table, conflict_key, "rest: upsert");
        let request = authorize(
            self.http
                .post(url)
                .query(&[("on_conflict", conflict_key)])
                .header("Prefer", format!("resolution=merge-duplicates,{REPRESENTATION}"))
                .json(&Value::Object(row)),
            &self.config,
            &self.session,
        )
        .await;
        let rows = read_rows(request.send().await.map_err(transport_error)?).await?;
        first_row(rows, table)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<(), SyncError> {
        let url = self.table_url(table)?;
        debug!(table, "rest: update");
        let pairs: Vec<(String, String)> = filter_pairs(filters).collect();
        let request = authorize(
            self.http
                .patch(url)
                .query(&pairs)
                .header("Prefer", "return=minimal")
                .json(&Value::Object(patch)),
            &self.config,
            &self.session,
        )
        .await;
        check(request.send().await.map_err(transport_error)?).await?;
        Ok(())
    }
}
