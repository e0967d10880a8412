//! Airtable datastore access: paginated listing, record creation, and order-id lookups.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use gumsync_core::ORDER_ID_FIELD;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_AIRTABLE_API_URL: &str = "https://api.airtable.com/v0";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Builds the shared outbound client used for both third-party APIs.
pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build()
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("datastore request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from table {table}")]
    HttpStatus { status: u16, table: String },
    #[error("invalid datastore url: {0}")]
    InvalidUrl(String),
    #[error("encoding record fields: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StoredRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

/// One page of a table listing. `offset` is the opaque cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<StoredRecord>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[async_trait]
pub trait RecordTable: Send + Sync {
    async fn list_page(&self, table: &str, offset: Option<&str>) -> Result<RecordPage, StorageError>;

    /// Creates one record and returns its datastore id.
    async fn create_record(
        &self,
        table: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<String, StorageError>;
}

/// Collects every non-empty order id in `table`, following pagination to the end.
pub async fn existing_order_ids<T>(store: &T, table: &str) -> Result<HashSet<String>, StorageError>
where
    T: RecordTable + ?Sized,
{
    let mut ids = HashSet::new();
    let mut offset: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = store.list_page(table, offset.as_deref()).await?;
        pages += 1;
        ids.extend(page.records.iter().filter_map(|r| stored_order_id(&r.fields)));

        match page.offset {
            Some(next) if !next.is_empty() => offset = Some(next),
            _ => break,
        }
    }

    debug!(table, pages, known_ids = ids.len(), "collected existing order ids");
    Ok(ids)
}

/// Order id of a stored row; blank strings, zero and non-scalar values do not count.
pub fn stored_order_id(fields: &Map<String, JsonValue>) -> Option<String> {
    match fields.get(ORDER_ID_FIELD)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) if n.as_f64().is_some_and(|v| v != 0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Serializes `record` into a fields mapping and creates it in `table`.
pub async fn write_record<T, R>(store: &T, table: &str, record: &R) -> Result<String, StorageError>
where
    T: RecordTable + ?Sized,
    R: Serialize,
{
    let fields: Map<String, JsonValue> = serde_json::from_value(serde_json::to_value(record)?)?;
    store.create_record(table, fields).await
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub token: String,
    pub base_id: String,
    pub api_url: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    fields: &'a Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    #[serde(default)]
    id: String,
}

pub struct AirtableClient {
    client: reqwest::Client,
    token: String,
    base_id: String,
    api_url: Url,
}

impl AirtableClient {
    pub fn new(config: AirtableConfig, http: &HttpClientConfig) -> Result<Self, StorageError> {
        let client = build_http_client(http)?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: AirtableConfig, client: reqwest::Client) -> Result<Self, StorageError> {
        let api_url = Url::parse(&config.api_url)
            .map_err(|e| StorageError::InvalidUrl(format!("{}: {e}", config.api_url)))?;
        if api_url.cannot_be_a_base() {
            return Err(StorageError::InvalidUrl(config.api_url));
        }
        Ok(Self {
            client,
            token: config.token,
            base_id: config.base_id,
            api_url,
        })
    }

    pub fn table_url(&self, table: &str) -> Result<Url, StorageError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidUrl(self.api_url.to_string()))?
            .pop_if_empty()
            .push(&self.base_id)
            .push(table);
        Ok(url)
    }

    fn check_status(status: StatusCode, table: &str) -> Result<(), StorageError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(StorageError::HttpStatus {
                status: status.as_u16(),
                table: table.to_string(),
            })
        }
    }
}

#[async_trait]
impl RecordTable for AirtableClient {
    async fn list_page(&self, table: &str, offset: Option<&str>) -> Result<RecordPage, StorageError> {
        let url = self.table_url(table)?;
        let span = info_span!("airtable_list", table, has_offset = offset.is_some());

        async move {
            let mut request = self.client.get(url).bearer_auth(&self.token);
            if let Some(offset) = offset {
                request = request.query(&[("offset", offset)]);
            }
            let resp = request.send().await?;
            Self::check_status(resp.status(), table)?;
            let page = resp.json::<RecordPage>().await?;
            debug!(records = page.records.len(), "listed page");
            Ok::<_, StorageError>(page)
        }
        .instrument(span)
        .await
    }

    async fn create_record(
        &self,
        table: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<String, StorageError> {
        let url = self.table_url(table)?;
        let span = info_span!("airtable_create", table);

        async move {
            let resp = self
                .client
                .post(url)
                .bearer_auth(&self.token)
                .json(&CreateRecordRequest { fields: &fields })
                .send()
                .await?;
            Self::check_status(resp.status(), table)?;
            let created = resp.json::<CreatedRecord>().await?;
            Ok::<_, StorageError>(created.id)
        }
        .instrument(span)
        .await
    }
}
