//! Trigger pipeline: fetch the latest sale, dedup against both tables, write raw and clean rows.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gumsync_adapters::{GumroadClient, GumroadConfig, SaleFetchError, SaleSource, DEFAULT_GUMROAD_API_URL};
use gumsync_core::{CleanRecord, RawRecord, TriggerStatus};
use gumsync_storage::{
    existing_order_ids, write_record, AirtableClient, AirtableConfig, HttpClientConfig, RecordTable,
    StorageError, DEFAULT_AIRTABLE_API_URL,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_RAW_TABLE: &str = "Gumroad_raw_sales";
pub const DEFAULT_CLEAN_TABLE: &str = "Gumroad_clean_sales";
/// Six-field cron (seconds first): every fifteen minutes.
pub const DEFAULT_SYNC_CRON: &str = "0 */15 * * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// Process-wide settings, read once at startup and passed to every component.
#[derive(Clone)]
pub struct SyncConfig {
    pub gumroad_token: String,
    pub airtable_token: String,
    pub airtable_base_id: String,
    pub raw_table: String,
    pub clean_table: String,
    pub gumroad_api_url: String,
    pub airtable_api_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub bind_addr: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| non_empty(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            gumroad_token: required("GUMROAD_TOKEN")?,
            airtable_token: required("AIRTABLE_TOKEN")?,
            airtable_base_id: required("AIRTABLE_BASE_ID")?,
            raw_table: non_empty("GUMSYNC_RAW_TABLE").unwrap_or_else(|| DEFAULT_RAW_TABLE.to_string()),
            clean_table: non_empty("GUMSYNC_CLEAN_TABLE")
                .unwrap_or_else(|| DEFAULT_CLEAN_TABLE.to_string()),
            gumroad_api_url: non_empty("GUMROAD_API_URL")
                .unwrap_or_else(|| DEFAULT_GUMROAD_API_URL.to_string()),
            airtable_api_url: non_empty("AIRTABLE_API_URL")
                .unwrap_or_else(|| DEFAULT_AIRTABLE_API_URL.to_string()),
            user_agent: non_empty("GUMSYNC_USER_AGENT").unwrap_or_else(|| "gumsync/0.1".to_string()),
            http_timeout_secs: non_empty("GUMSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            bind_addr: non_empty("GUMSYNC_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            scheduler_enabled: non_empty("GUMSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: non_empty("GUMSYNC_SYNC_CRON")
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("gumroad_token", &"<redacted>")
            .field("airtable_token", &"<redacted>")
            .field("airtable_base_id", &self.airtable_base_id)
            .field("raw_table", &self.raw_table)
            .field("clean_table", &self.clean_table)
            .field("gumroad_api_url", &self.gumroad_api_url)
            .field("airtable_api_url", &self.airtable_api_url)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("bind_addr", &self.bind_addr)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Fetch(#[from] SaleFetchError),
    #[error("reading existing order ids: {0}")]
    Storage(#[from] StorageError),
}

pub struct SyncPipeline {
    config: SyncConfig,
    sales: Arc<dyn SaleSource>,
    tables: Arc<dyn RecordTable>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, sales: Arc<dyn SaleSource>, tables: Arc<dyn RecordTable>) -> Self {
        Self {
            config,
            sales,
            tables,
        }
    }

    /// Wires the live Gumroad and Airtable clients from `config`.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let http = config.http_client_config();
        let sales = GumroadClient::new(
            GumroadConfig {
                token: config.gumroad_token.clone(),
                api_url: config.gumroad_api_url.clone(),
            },
            &http,
        )
        .context("building Gumroad client")?;
        let tables = AirtableClient::new(
            AirtableConfig {
                token: config.airtable_token.clone(),
                base_id: config.airtable_base_id.clone(),
                api_url: config.airtable_api_url.clone(),
            },
            &http,
        )
        .context("building Airtable client")?;
        Ok(Self::new(config, Arc::new(sales), Arc::new(tables)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs the whole pipeline for exactly one sale.
    pub async fn run_once(&self) -> Result<TriggerStatus, TriggerError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("trigger", %run_id);
        self.run_steps().instrument(span).await
    }

    async fn run_steps(&self) -> Result<TriggerStatus, TriggerError> {
        let sale = self.sales.fetch_latest_sale().await?;
        let order_id = sale.order_id.as_str();
        info!(order_id, "fetched latest sale");

        let raw_table = self.config.raw_table.as_str();
        let clean_table = self.config.clean_table.as_str();
        let raw_ids = existing_order_ids(self.tables.as_ref(), raw_table).await?;
        let clean_ids = existing_order_ids(self.tables.as_ref(), clean_table).await?;

        if raw_ids.contains(order_id) {
            info!(order_id, table = raw_table, "order already stored; skipping");
            return Ok(TriggerStatus::DuplicateSkipped);
        }

        self.write_best_effort(raw_table, order_id, &RawRecord::from(&sale))
            .await;

        let clean = CleanRecord::from(&sale);
        if clean_ids.contains(order_id) {
            info!(order_id, table = clean_table, "clean row already stored; skipping");
            return Ok(TriggerStatus::RawSavedCleanSkipped);
        }

        self.write_best_effort(clean_table, order_id, &clean).await;
        Ok(TriggerStatus::Success)
    }

    // Write failures are logged and do not change the reported status.
    async fn write_best_effort<R: Serialize>(&self, table: &str, order_id: &str, record: &R) {
        match write_record(self.tables.as_ref(), table, record).await {
            Ok(record_id) => info!(order_id, table, %record_id, "record written"),
            Err(err) => warn!(order_id, table, error = %err, "record write failed"),
        }
    }
}

/// Builds a cron job that runs the pipeline, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(status) => info!(status = status.as_str(), "scheduled trigger finished"),
                Err(err) => warn!(error = %err, "scheduled trigger failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_trigger_once_from_env() -> Result<TriggerStatus> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config)?;
    Ok(pipeline.run_once().await?)
}
