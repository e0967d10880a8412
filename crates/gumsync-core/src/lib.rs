//! Sale domain model and the raw/clean record shapes written to the datastore.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

/// Column holding the order identifier in both datastore tables.
pub const ORDER_ID_FIELD: &str = "Order ID";

pub const PURCHASE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub const DEFAULT_EMAIL: &str = "unknown@email.com";
pub const DEFAULT_COUNTRY: &str = "Unknown";
pub const DEFAULT_STATE: &str = "Unknown";
pub const DEFAULT_CURRENCY: &str = "Unknown";
pub const DEFAULT_PRODUCT_NAME: &str = "Unknown Product";

#[derive(Debug, Error)]
pub enum SaleError {
    #[error("sale payload is not a JSON object")]
    NotAnObject,
    #[error("sale has no usable order_id")]
    MissingOrderId,
    #[error("sale payload has unexpected field types: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One sale as reported by the payments API. The full object is kept in `raw`.
///
/// Optional fields with an unexpected JSON type read as `None`; the value survives in `raw`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sale {
    #[serde(default)]
    pub order_id: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub product_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub price: Option<Number>,
    #[serde(default, deserialize_with = "lenient")]
    pub currency_symbol: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub refunded: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<String>,
    #[serde(skip)]
    pub raw: Map<String, JsonValue>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

impl Sale {
    pub fn from_json(value: JsonValue) -> Result<Self, SaleError> {
        let JsonValue::Object(raw) = value else {
            return Err(SaleError::NotAnObject);
        };
        let mut sale: Sale = serde_json::from_value(JsonValue::Object(raw.clone()))?;
        sale.raw = raw;
        Ok(sale)
    }

    pub fn order_id_text(&self) -> Option<String> {
        match self.order_id.as_ref()? {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Resolves the order id and purchase date; the sale is rejected only when it has no id.
    pub fn normalize(self) -> Result<NormalizedSale, SaleError> {
        let order_id = self.order_id_text().ok_or(SaleError::MissingOrderId)?;
        let purchase_date = self.created_at.as_deref().and_then(normalize_timestamp);
        Ok(NormalizedSale {
            order_id,
            purchase_date,
            sale: self,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSale {
    pub order_id: String,
    pub purchase_date: Option<String>,
    pub sale: Sale,
}

impl NormalizedSale {
    /// Full sale object with `created_at` replaced by the normalized purchase date.
    pub fn raw_json(&self) -> String {
        let mut raw = self.sale.raw.clone();
        if raw.contains_key("created_at") {
            let created_at = self
                .purchase_date
                .clone()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null);
            raw.insert("created_at".to_string(), created_at);
        }
        JsonValue::Object(raw).to_string()
    }
}

/// Normalizes a sale timestamp to `YYYY-MM-DDTHH:MM:SS`, keeping the wall-clock time of any offset.
pub fn normalize_timestamp(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.naive_local().format(PURCHASE_DATE_FORMAT).to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(input) {
        return Some(dt.naive_local().format(PURCHASE_DATE_FORMAT).to_string());
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, pattern) {
            return Some(dt.format(PURCHASE_DATE_FORMAT).to_string());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(PURCHASE_DATE_FORMAT).to_string())
}

/// Row for the raw table: consumed sale fields as reported, plus the serialized sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "Order ID")]
    pub order_id: String,
    #[serde(rename = "Email")]
    pub email: Option<String>,
    #[serde(rename = "Product Name")]
    pub product_name: Option<String>,
    #[serde(rename = "Price")]
    pub price: Option<Number>,
    #[serde(rename = "Currency")]
    pub currency: Option<String>,
    #[serde(rename = "Country")]
    pub country: Option<String>,
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "Refunded")]
    pub refunded: Option<bool>,
    #[serde(rename = "Purchase Date")]
    pub purchase_date: Option<String>,
    #[serde(rename = "Raw JSON")]
    pub raw_json: String,
}

impl From<&NormalizedSale> for RawRecord {
    fn from(normalized: &NormalizedSale) -> Self {
        let sale = &normalized.sale;
        Self {
            order_id: normalized.order_id.clone(),
            email: sale.email.clone(),
            product_name: sale.product_name.clone(),
            price: sale.price.clone(),
            currency: sale.currency_symbol.clone(),
            country: sale.country.clone(),
            state: sale.state.clone(),
            refunded: sale.refunded,
            purchase_date: normalized.purchase_date.clone(),
            raw_json: normalized.raw_json(),
        }
    }
}

/// Row for the clean table. Missing values are replaced by fixed defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    #[serde(rename = "Order ID")]
    pub order_id: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Product Name")]
    pub product_name: String,
    #[serde(rename = "Price")]
    pub price: Number,
    #[serde(rename = "Currency")]
    pub currency: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Purchase Date")]
    pub purchase_date: Option<String>,
}

impl From<&NormalizedSale> for CleanRecord {
    fn from(normalized: &NormalizedSale) -> Self {
        let sale = &normalized.sale;
        Self {
            order_id: normalized.order_id.clone(),
            email: or_default(&sale.email, DEFAULT_EMAIL),
            product_name: or_default(&sale.product_name, DEFAULT_PRODUCT_NAME),
            price: sale.price.clone().unwrap_or_else(|| Number::from(0)),
            currency: or_default(&sale.currency_symbol, DEFAULT_CURRENCY),
            country: or_default(&sale.country, DEFAULT_COUNTRY),
            state: or_default(&sale.state, DEFAULT_STATE),
            purchase_date: normalized.purchase_date.clone(),
        }
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    value.clone().unwrap_or_else(|| default.to_string())
}

/// Terminal status of one trigger invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Success,
    DuplicateSkipped,
    RawSavedCleanSkipped,
}

impl TriggerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::DuplicateSkipped => "duplicate_skipped",
            Self::RawSavedCleanSkipped => "raw_saved_clean_skipped",
        }
    }
}
