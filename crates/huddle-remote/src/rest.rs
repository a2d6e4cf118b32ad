//! [`RowStore`] over a PostgREST endpoint (`/rest/v1`).

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use huddle_shared::ConnectionHealth;

use crate::error::{RemoteError, Result};
use crate::query::{Direction, Filter, Query, Row, Table};
use crate::store::RowStore;

const PREFER_RETURN: &str = "return=representation";
const PREFER_MERGE: &str = "resolution=merge-duplicates,return=representation";

/// `invalid input syntax` (e.g. a non-UUID compared to a uuid column).
const PG_INVALID_TEXT_REPRESENTATION: &str = "22P02";
const PG_UNIQUE_VIOLATION: &str = "23505";
/// PostgREST: single-object request matched no rows.
const PGRST_NO_ROWS: &str = "PGRST116";

pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    /// Send requests as the signed-in user instead of the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn request(&self, method: Method, table: Table) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.http
            .request(method, format!("{}/{}", self.base_url, table.name()))
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn rows(response: Response) -> Result<Vec<Row>> {
        let response = check(response).await?;
        let body: Value = response.json().await?;
        match body {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row),
                    other => Err(RemoteError::UnexpectedResponse(format!(
                        "expected row object, got {other}"
                    ))),
                })
                .collect(),
            Value::Object(row) => Ok(vec![row]),
            other => Err(RemoteError::UnexpectedResponse(format!(
                "expected row array, got {other}"
            ))),
        }
    }

    async fn single(response: Response) -> Result<Row> {
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::UnexpectedResponse("empty representation".to_string()))
    }
}

/// Render query filters, ordering and range as PostgREST parameters.
pub fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = filter_pairs(&query.filters);
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    Direction::Asc => "asc",
                    Direction::Desc => "desc",
                };
                format!("{}.{dir}", o.column)
            })
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("order".to_string(), order));
    }
    if let Some(offset) = query.offset {
        pairs.push(("offset".to_string(), offset.to_string()));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    pairs
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| {
            let op = if f.value.is_null() { "is" } else { f.op.keyword() };
            (f.column.clone(), format!("{op}.{}", f.value_text()))
        })
        .collect()
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(map_error(status, &text))
}

/// Translate a PostgREST error body into the store's error kinds.
pub fn map_error(status: StatusCode, body: &str) -> RemoteError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|b| b.code.clone());
    let message = parsed
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.to_string());

    match code.as_deref() {
        Some(PG_INVALID_TEXT_REPRESENTATION) => RemoteError::MalformedIdentifier(message),
        Some(PG_UNIQUE_VIOLATION) => RemoteError::UniqueViolation(message),
        Some(PGRST_NO_ROWS) => RemoteError::NotFound,
        _ if status == StatusCode::NOT_FOUND && code.is_none() => RemoteError::NotFound,
        _ => RemoteError::Http {
            status: status.as_u16(),
            code,
            message,
        },
    }
}

#[async_trait]
impl RowStore for RestStore {
    #[instrument(skip_all, fields(table = %query.table))]
    async fn select(&self, query: &Query) -> Result<Vec<Row>> {
        let response = self
            .request(Method::GET, query.table)
            .query(&[("select", "*")])
            .query(&query_pairs(query))
            .send()
            .await?;
        let rows = Self::rows(response).await?;
        debug!(count = rows.len(), "select");
        Ok(rows)
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn insert(&self, table: Table, row: Row) -> Result<Row> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", PREFER_RETURN)
            .json(&row)
            .send()
            .await?;
        Self::single(response).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn upsert(&self, table: Table, row: Row, on_conflict: &[&str]) -> Result<Row> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", PREFER_MERGE)
            .query(&[("on_conflict", on_conflict.join(","))])
            .json(&row)
            .send()
            .await?;
        Self::single(response).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        let response = self
            .request(Method::PATCH, table)
            .header("Prefer", PREFER_RETURN)
            .query(&filter_pairs(filters))
            .json(&patch)
            .send()
            .await?;
        Self::rows(response).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>> {
        let response = self
            .request(Method::DELETE, table)
            .header("Prefer", PREFER_RETURN)
            .query(&filter_pairs(filters))
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn health(&self) -> ConnectionHealth {
        let response = self
            .http
            .get(format!("{}/", self.base_url))
            .header("apikey", &self.api_key)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_server_error() => {
                warn!(status = %resp.status(), "rest endpoint unhealthy");
                ConnectionHealth::Disconnected
            }
            Ok(_) => ConnectionHealth::Connected,
            Err(e) => {
                warn!(error = %e, "rest endpoint unreachable");
                ConnectionHealth::Disconnected
            }
        }
    }
}
