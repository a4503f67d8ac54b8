//! PostgREST / Supabase-style HTTP backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;

use super::error::{RemoteResult, SyncError};
use super::remote::{RemoteBackend, RemotePosition, RemoteRow};
use crate::models::Payload;
use crate::util::{compact_text, format_micros_rfc3339, is_http_url, normalize_text_option};

/// Remote backend speaking the PostgREST REST dialect under `/rest/v1`.
#[derive(Clone)]
pub struct PostgrestBackend {
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for PostgrestBackend {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PostgrestBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl PostgrestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let api_key = normalize_text_option(Some(api_key.into())).ok_or_else(|| {
            SyncError::Validation("remote API key must not be empty".to_string())
        })?;

        Ok(Self {
            base_url,
            api_key,
            access_token: normalize_text_option(access_token),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .header("Accept", "application/json")
    }

    async fn send_rows(&self, request: RequestBuilder) -> RemoteResult<Vec<RemoteRow>> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let rows = response.json::<Vec<Payload>>().await?;
        rows.into_iter().map(RemoteRow::from_payload).collect()
    }
}

#[async_trait]
impl RemoteBackend for PostgrestBackend {
    async fn fetch_since(
        &self,
        table: &str,
        after: Option<&RemotePosition>,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", "updated_at.asc,id.asc".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(after) = after {
            query.push(("or", keyset_filter(after)));
        }

        let request = self
            .request(Method::GET, &self.table_url(table))
            .query(&query);
        self.send_rows(request).await
    }

    async fn fetch_one(&self, table: &str, id: &str) -> RemoteResult<Option<RemoteRow>> {
        let request = self
            .request(Method::GET, &self.table_url(table))
            .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))]);
        Ok(self.send_rows(request).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, payload: &Payload) -> RemoteResult<RemoteRow> {
        let request = self
            .request(Method::POST, &self.table_url(table))
            .header("Prefer", "return=representation")
            .json(payload);
        self.send_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Validation(format!("insert into {table} returned no row")))
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        payload: &Payload,
        expected_version: Option<i64>,
    ) -> RemoteResult<RemoteRow> {
        let request = self
            .request(Method::PATCH, &self.table_url(table))
            .query(&row_filter(id, expected_version))
            .header("Prefer", "return=representation")
            .json(payload);

        // An empty representation means the id or the version filter missed.
        self.send_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SyncError::Conflict(format!("{table}/{id} is missing or changed remotely"))
            })
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> RemoteResult<()> {
        let request = self
            .request(Method::DELETE, &self.table_url(table))
            .query(&row_filter(id, expected_version))
            .header("Prefer", "return=representation");
        let deleted = self.send_rows(request).await?;

        if deleted.is_empty() && expected_version.is_some() && self.fetch_one(table, id).await?.is_some() {
            return Err(SyncError::Conflict(format!(
                "{table}/{id} changed remotely"
            )));
        }
        Ok(())
    }

    async fn ping(&self) -> RemoteResult<()> {
        let response = self
            .request(Method::GET, &format!("{}/rest/v1/", self.base_url))
            .send()
            .await?;
        if response.status().is_server_error() {
            return Err(SyncError::Network(format!(
                "backend answered HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Filter selecting one row, optionally pinned to a version.
fn row_filter(id: &str, expected_version: Option<i64>) -> Vec<(&'static str, String)> {
    let mut filter = vec![("id", format!("eq.{id}"))];
    if let Some(expected) = expected_version {
        filter.push(("updated_at", format!("eq.{}", format_micros_rfc3339(expected))));
    }
    filter
}

/// `or` filter for rows strictly after `after` in (`updated_at`, `id`) order.
fn keyset_filter(after: &RemotePosition) -> String {
    let version = quote_filter_value(&format_micros_rfc3339(after.updated_at));
    format!(
        "(updated_at.gt.{version},and(updated_at.eq.{version},id.gt.{}))",
        quote_filter_value(&after.id)
    )
}

/// Quote a value for a PostgREST logic tree, where `,.:()` are reserved.
fn quote_filter_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Postgres `foreign_key_violation`
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Map a non-success response onto the sync error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let message = parse_api_error(status, body);
    let code = serde_json::from_str::<PostgrestErrorBody>(body)
        .ok()
        .and_then(|payload| payload.code);
    if code.as_deref() == Some(FOREIGN_KEY_VIOLATION) {
        return SyncError::MissingReference(message);
    }
    match status.as_u16() {
        409 => SyncError::Conflict(message),
        400 | 403 | 404 | 405 | 406 | 413 | 422 => SyncError::Validation(message),
        _ => SyncError::Network(message),
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
    hint: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PostgrestErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return match payload.hint {
                Some(hint) if !hint.trim().is_empty() => {
                    format!("{} ({}; hint: {})", message.trim(), status.as_u16(), hint.trim())
                }
                _ => format!("{} ({})", message.trim(), status.as_u16()),
            };
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let url = normalize_text_option(Some(raw)).ok_or_else(|| {
        SyncError::Validation("remote URL must not be empty".to_string())
    })?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(SyncError::Validation(
            "remote URL must include http:// or https://".to_string(),
        ))
    }
}
