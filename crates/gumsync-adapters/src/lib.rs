//! Sales API adapter: fetches the newest sale from Gumroad.

use async_trait::async_trait;
use gumsync_core::{NormalizedSale, Sale, SaleError};
use gumsync_storage::{build_http_client, HttpClientConfig};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_GUMROAD_API_URL: &str = "https://api.gumroad.com/v2";

#[derive(Debug, Error)]
pub enum SaleFetchError {
    #[error("sales request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sales response is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("sales API did not report success{}", failure_detail(.message))]
    Unsuccessful { message: Option<String> },
    #[error("sales API returned no sales")]
    NoSales,
    #[error("latest sale is unusable: {0}")]
    InvalidSale(#[from] SaleError),
    #[error("invalid sales API url: {0}")]
    InvalidUrl(String),
}

fn failure_detail(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

#[async_trait]
pub trait SaleSource: Send + Sync {
    /// Returns the single most recent sale with its order id and purchase date resolved.
    async fn fetch_latest_sale(&self) -> Result<NormalizedSale, SaleFetchError>;
}

#[derive(Debug, Deserialize)]
struct SalesResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sales: Vec<JsonValue>,
}

/// Interprets a `/sales` response body, keeping only the first (newest) sale.
pub fn parse_sales_response(body: &str) -> Result<NormalizedSale, SaleFetchError> {
    let response: SalesResponse = serde_json::from_str(body).map_err(SaleFetchError::Decode)?;
    if !response.success {
        return Err(SaleFetchError::Unsuccessful {
            message: response.message,
        });
    }
    let first = response
        .sales
        .into_iter()
        .next()
        .ok_or(SaleFetchError::NoSales)?;
    Ok(Sale::from_json(first)?.normalize()?)
}

#[derive(Debug, Clone)]
pub struct GumroadConfig {
    pub token: String,
    pub api_url: String,
}

pub struct GumroadClient {
    client: reqwest::Client,
    token: String,
    sales_url: Url,
}

impl GumroadClient {
    pub fn new(config: GumroadConfig, http: &HttpClientConfig) -> Result<Self, SaleFetchError> {
        let client = build_http_client(http)?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: GumroadConfig, client: reqwest::Client) -> Result<Self, SaleFetchError> {
        let mut sales_url = Url::parse(&config.api_url)
            .map_err(|e| SaleFetchError::InvalidUrl(format!("{}: {e}", config.api_url)))?;
        sales_url
            .path_segments_mut()
            .map_err(|_| SaleFetchError::InvalidUrl(config.api_url.clone()))?
            .pop_if_empty()
            .push("sales");
        Ok(Self {
            client,
            token: config.token,
            sales_url,
        })
    }

    pub fn sales_url(&self) -> &Url {
        &self.sales_url
    }
}

#[async_trait]
impl SaleSource for GumroadClient {
    async fn fetch_latest_sale(&self) -> Result<NormalizedSale, SaleFetchError> {
        let span = info_span!("gumroad_latest_sale");

        async move {
            let resp = self
                .client
                .get(self.sales_url.clone())
                .query(&[("access_token", self.token.as_str()), ("per_page", "1")])
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "sales response received");
            parse_sales_response(&body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sale_is_taken_from_successful_response() {
        let body = r#"{
            "success": true,
            "next_page_url": "/v2/sales?page_key=abc",
            "sales": [
                {
                    "id": "B28UKN-E2fBPvh3x5kM6lw==",
                    "order_id": 524459935,
                    "email": "buyer@example.com",
                    "product_name": "Pencil Brushes",
                    "price": 1500,
                    "currency_symbol": "$",
                    "country": "United States",
                    "state": "CA",
                    "refunded": false,
                    "created_at": "2024-02-10T16:42:51Z"
                },
                {"order_id": 1, "created_at": "2024-02-09T00:00:00Z"}
            ]
        }"#;

        let sale = parse_sales_response(body).unwrap();

        assert_eq!(sale.order_id, "524459935");
        assert_eq!(sale.purchase_date.as_deref(), Some("2024-02-10T16:42:51"));
        assert_eq!(sale.sale.product_name.as_deref(), Some("Pencil Brushes"));
        assert_eq!(sale.sale.refunded, Some(false));
    }

    #[test]
    fn unsuccessful_response_is_an_error() {
        let err = parse_sales_response(
            r#"{"success": false, "message": "The access token provided is invalid."}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SaleFetchError::Unsuccessful { .. }));
        assert!(err.to_string().contains("access token provided is invalid"));

        let missing_flag = parse_sales_response(r#"{"sales": [{"order_id": 1}]}"#).unwrap_err();
        assert!(matches!(missing_flag, SaleFetchError::Unsuccessful { message: None }));
    }

    #[test]
    fn empty_sales_list_is_an_error() {
        let err = parse_sales_response(r#"{"success": true, "sales": []}"#).unwrap_err();
        assert!(matches!(err, SaleFetchError::NoSales));
    }

    #[test]
    fn non_json_body_is_a_decode_error() {
        let err = parse_sales_response("<html>502 Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, SaleFetchError::Decode(_)));
    }

    #[test]
    fn sale_without_order_id_is_rejected() {
        let err = parse_sales_response(r#"{"success": true, "sales": [{"email": "a@b.c"}]}"#)
            .unwrap_err();
        assert!(matches!(err, SaleFetchError::InvalidSale(SaleError::MissingOrderId)));
    }

    #[test]
    fn mistyped_price_does_not_abort_fetch() {
        let sale = parse_sales_response(
            r#"{"success": true, "sales": [{"order_id": 5, "price": "15.00"}]}"#,
        )
        .unwrap();
        assert_eq!(sale.order_id, "5");
        assert_eq!(sale.sale.price, None);
        assert!(sale.raw_json().contains(r#""price":"15.00""#));
    }

    #[test]
    fn bad_timestamp_does_not_abort_fetch() {
        let sale = parse_sales_response(
            r#"{"success": true, "sales": [{"order_id": "9", "created_at": "garbage"}]}"#,
        )
        .unwrap();
        assert_eq!(sale.purchase_date, None);
    }

    #[test]
    fn sales_url_is_built_from_api_root() {
        let client = GumroadClient::new(
            GumroadConfig {
                token: "tok".into(),
                api_url: DEFAULT_GUMROAD_API_URL.into(),
            },
            &HttpClientConfig::default(),
        )
        .unwrap();
        assert_eq!(client.sales_url().as_str(), "https://api.gumroad.com/v2/sales");

        let trailing = GumroadClient::new(
            GumroadConfig {
                token: "tok".into(),
                api_url: "http://127.0.0.1:9000/v2/".into(),
            },
            &HttpClientConfig::default(),
        )
        .unwrap();
        assert_eq!(trailing.sales_url().as_str(), "http://127.0.0.1:9000/v2/sales");
    }
}
