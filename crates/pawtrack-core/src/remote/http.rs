//! REST adapter for the remote store.
//!
//! Wire layout, relative to the configured base URL:
//! - `POST /v1/{collection}/{id}` with `{fields, serverTimestamps}` creates
//! - `PATCH /v1/{collection}/{id}` with `{set, clear, serverTimestamps}` updates
//! - `DELETE /v1/{collection}/{id}` deletes
//! - `GET /v1/{collection}?limit=N` lists documents
//! - `GET /v1/changes/{collection}?since=T` polls for changes
//!
//! Writes carry the operation id as `Idempotency-Key`, so replaying an
//! operation after a lost acknowledgment is safe.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    Ack, ChangeEvent, ChangeFeed, DocumentChange, RemoteDocument, RemoteStore, SnapshotMetadata,
    WriteRequest,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result, WriteError};
use crate::models::{Fields, OperationKind, Query};
use crate::util::{compact_text, format_timestamp, is_http_url, normalize_text_option};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    fields: Fields,
    server_timestamps: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    set: Fields,
    clear: Vec<String>,
    server_timestamps: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckResponse {
    update_time: DateTime<Utc>,
    #[serde(default)]
    server_timestamps: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    documents: Vec<RemoteDocument>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    changes: Vec<DocumentChange>,
    /// Resume token for the next poll
    cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// `RemoteStore` backed by a JSON-over-HTTP document API
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    client: Client,
    poll_interval: Duration,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                Error::Config("remote base URL must include http:// or https://".to_string())
            })?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            poll_interval,
        })
    }

    /// Build from an engine config; fails when no remote URL is configured
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let base_url = config
            .remote_base_url
            .clone()
            .ok_or_else(|| Error::Config("remote_base_url is not set".to_string()))?;
        Self::new(base_url, config.request_timeout(), config.poll_interval())
    }

    fn document_url(&self, request: &WriteRequest) -> String {
        format!(
            "{}/v1/{}/{}",
            self.base_url,
            request.collection,
            urlencoding::encode(request.entity_id.as_str())
        )
    }

    fn list_url(&self, query: &Query, page_size: usize) -> String {
        let limit = query.limit.map_or(page_size, |limit| limit.min(page_size));
        let mut url = format!("{}/v1/{}?limit={limit}", self.base_url, query.collection);
        append_filters(&mut url, query);
        url
    }

    fn changes_url(&self, query: &Query, since: Option<DateTime<Utc>>) -> String {
        let mut url = format!("{}/v1/changes/{}", self.base_url, query.collection);
        let mut separator = '?';
        if let Some(since) = since {
            url.push_str(&format!(
                "?since={}",
                urlencoding::encode(&format_timestamp(since))
            ));
            separator = '&';
        }
        if !query.filters.is_empty() {
            url.push(separator);
            url.push_str(&filter_params(query));
        }
        url
    }

    fn write_request(&self, request: &WriteRequest) -> std::result::Result<RequestBuilder, WriteError> {
        let url = self.document_url(request);
        let (set, clear, server_timestamps) = request.payload.split();
        let builder = match request.kind {
            OperationKind::Create => {
                if !clear.is_empty() {
                    return Err(WriteError::rejected(
                        "invalid-argument",
                        "a create cannot clear fields",
                    ));
                }
                self.client.post(url).json(&CreateBody {
                    fields: set,
                    server_timestamps,
                })
            }
            OperationKind::Update => self.client.patch(url).json(&UpdateBody {
                set,
                clear,
                server_timestamps,
            }),
            OperationKind::Delete => self.client.delete(url),
        };
        Ok(builder
            .header(IDEMPOTENCY_KEY, request.operation_id.to_string())
            .header("Accept", "application/json"))
    }

    async fn poll_changes(
        &self,
        query: &Query,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<ChangesResponse, WriteError> {
        let response = self
            .client
            .get(self.changes_url(query, since))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json().await.map_err(transport_error)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn change_feed(&self, query: &Query) -> ChangeFeed {
        let state = (self.clone(), query.clone(), None::<DateTime<Utc>>, true);
        futures::stream::unfold(state, |(store, query, mut since, mut first)| async move {
            loop {
                if !first {
                    tokio::time::sleep(store.poll_interval).await;
                }
                first = false;

                match store.poll_changes(&query, since).await {
                    Ok(page) => {
                        let latest = page.changes.iter().filter_map(change_time).max();
                        since = page.cursor.or(latest).or(since);
                        if page.changes.is_empty() {
                            continue;
                        }
                        let event = ChangeEvent {
                            collection: query.collection.clone(),
                            changes: page.changes,
                            metadata: SnapshotMetadata::confirmed(),
                        };
                        return Some((event, (store, query, since, first)));
                    }
                    Err(error) => {
                        tracing::warn!(
                            collection = %query.collection,
                            "Change poll failed: {error}"
                        );
                    }
                }
            }
        })
        .boxed()
    }

    async fn write(&self, request: WriteRequest) -> std::result::Result<Ack, WriteError> {
        let response = self
            .write_request(&request)?
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        if request.kind == OperationKind::Delete && response.status() == StatusCode::NO_CONTENT {
            return Ok(Ack {
                update_time: None,
                server_timestamps: BTreeMap::new(),
            });
        }

        let ack: AckResponse = response.json().await.map_err(transport_error)?;
        Ok(Ack {
            update_time: Some(ack.update_time),
            server_timestamps: ack.server_timestamps,
        })
    }

    async fn fetch(
        &self,
        query: &Query,
        page_size: usize,
    ) -> std::result::Result<Vec<RemoteDocument>, WriteError> {
        let response = self
            .client
            .get(self.list_url(query, page_size))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let list: ListResponse = response.json().await.map_err(transport_error)?;
        Ok(list.documents)
    }
}

fn change_time(change: &DocumentChange) -> Option<DateTime<Utc>> {
    match change {
        DocumentChange::Upsert(document) => document.update_time,
        DocumentChange::Removed { update_time, .. } => *update_time,
    }
}

fn filter_params(query: &Query) -> String {
    query
        .filters
        .iter()
        .map(|filter| {
            format!(
                "where.{}={}",
                urlencoding::encode(&filter.field),
                urlencoding::encode(&filter.equals.to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn append_filters(url: &mut String, query: &Query) {
    if !query.filters.is_empty() {
        url.push('&');
        url.push_str(&filter_params(query));
    }
}

fn transport_error(error: reqwest::Error) -> WriteError {
    WriteError::transient(error.to_string())
}

async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, WriteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(WriteError::from_http_status(
        status.as_u16(),
        parse_api_error(status, &body),
    ))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        compact_text(trimmed)
    }
}
