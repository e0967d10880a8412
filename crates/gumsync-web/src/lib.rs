//! Axum endpoint that runs the sale pipeline on demand.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gumsync_core::TriggerStatus;
use gumsync_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline, TriggerError};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const FETCH_FAILED_MESSAGE: &str = "Gumroad API failed";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: TriggerStatus,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/trigger", get(trigger_handler).post(trigger_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening for triggers");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let pipeline = Arc::new(SyncPipeline::from_config(config)?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %pipeline.config().sync_cron, "scheduled trigger enabled");
    }

    serve(AppState::new(pipeline), &bind_addr).await
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(status) => {
            info!(status = status.as_str(), "trigger finished");
            Json(StatusBody { status }).into_response()
        }
        Err(TriggerError::Fetch(err)) => {
            warn!(error = %err, "sales fetch failed");
            error_response(FETCH_FAILED_MESSAGE.to_string())
        }
        Err(err) => {
            error!(error = %err, "trigger failed");
            error_response(err.to_string())
        }
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody { error: message }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use gumsync_adapters::{SaleFetchError, SaleSource};
    use gumsync_core::{NormalizedSale, Sale};
    use gumsync_storage::{RecordPage, RecordTable, StorageError, StoredRecord};
    use http_body_util::BodyExt;
    use serde_json::{json, Map, Value as JsonValue};
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct StubSales(Option<JsonValue>);

    #[async_trait]
    impl SaleSource for StubSales {
        async fn fetch_latest_sale(&self) -> Result<NormalizedSale, SaleFetchError> {
            match &self.0 {
                Some(value) => Ok(Sale::from_json(value.clone())?.normalize()?),
                None => Err(SaleFetchError::Unsuccessful { message: None }),
            }
        }
    }

    #[derive(Default)]
    struct StubTables {
        rows: Mutex<Vec<(String, Map<String, JsonValue>)>>,
        broken: bool,
    }

    #[async_trait]
    impl RecordTable for StubTables {
        async fn list_page(&self, table: &str, _offset: Option<&str>) -> Result<RecordPage, StorageError> {
            if self.broken {
                return Err(StorageError::HttpStatus {
                    status: 401,
                    table: table.to_string(),
                });
            }
            let records = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == table)
                .map(|(_, fields)| StoredRecord {
                    id: String::new(),
                    fields: fields.clone(),
                })
                .collect();
            Ok(RecordPage {
                records,
                offset: None,
            })
        }

        async fn create_record(
            &self,
            table: &str,
            fields: Map<String, JsonValue>,
        ) -> Result<String, StorageError> {
            self.rows.lock().unwrap().push((table.to_string(), fields));
            Ok("recNEW".to_string())
        }
    }

    fn test_app(sales: StubSales, tables: Arc<StubTables>) -> Router {
        let config = SyncConfig::from_lookup(|name| match name {
            "GUMROAD_TOKEN" | "AIRTABLE_TOKEN" => Some("token".into()),
            "AIRTABLE_BASE_ID" => Some("appTEST".into()),
            _ => None,
        })
        .unwrap();
        let pipeline = SyncPipeline::new(config, Arc::new(sales), tables);
        app(AppState::new(Arc::new(pipeline)))
    }

    fn sale() -> StubSales {
        StubSales(Some(json!({"order_id": "ord-1", "created_at": "2024-06-01T12:00:00Z"})))
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn get_trigger_reports_success() {
        let tables = Arc::new(StubTables::default());
        let resp = test_app(sale(), tables.clone())
            .oneshot(Request::builder().uri("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        assert_eq!(body_json(resp).await, json!({"status": "success"}));
        assert_eq!(tables.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn post_trigger_ignores_body_and_skips_duplicates() {
        let tables = Arc::new(StubTables::default());
        let app = test_app(sale(), tables.clone());

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/trigger")
                    .body(Body::from("anything at all"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(Request::builder().method("POST").uri("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_json(second).await, json!({"status": "duplicate_skipped"}));
        assert_eq!(tables.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_returns_500_without_writes() {
        let tables = Arc::new(StubTables::default());
        let resp = test_app(StubSales(None), tables.clone())
            .oneshot(Request::builder().uri("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await, json!({"error": "Gumroad API failed"}));
        assert!(tables.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn datastore_read_failure_returns_structured_500() {
        let tables = Arc::new(StubTables {
            broken: true,
            ..Default::default()
        });
        let resp = test_app(sale(), tables)
            .oneshot(Request::builder().uri("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = test_app(sale(), Arc::new(StubTables::default()))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"status": "ok"}));
    }
}
