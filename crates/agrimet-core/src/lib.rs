//! Core domain model and shared configuration for agrimet.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "agrimet-core";

/// Name of the forecast table inside the SQLite database.
pub const FORECAST_TABLE: &str = "forecasts";

/// CWA open-data endpoint for the agricultural weather forecast dataset.
pub const CWA_FORECAST_URL: &str =
    "https://opendata.cwa.gov.tw/fileapi/v1/opendataapi/F-A0010-001";

/// Normalized forecast emitted by the feed parser, one per (location, date).
///
/// Either temperature may be absent when the corresponding daily series does
/// not cover the date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub location: String,
    pub data_date: NaiveDate,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
}

/// Persisted row, stamped with the ingestion timestamp of its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredForecast {
    pub location: String,
    pub data_date: NaiveDate,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

/// Shared configuration handed to both the ingestor and the viewer.
///
/// The CWA authorization key is never embedded in source; it only enters
/// through `AGRIMET_CWA_API_KEY`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub fallback_path: PathBuf,
    pub forecast_url: String,
    pub api_key: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("AGRIMET_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sqlitedata.db")),
            fallback_path: std::env::var("AGRIMET_FALLBACK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("F-A0010-001.json")),
            forecast_url: std::env::var("AGRIMET_FORECAST_URL")
                .unwrap_or_else(|_| CWA_FORECAST_URL.to_string()),
            api_key: std::env::var("AGRIMET_CWA_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            http_timeout_secs: std::env::var("AGRIMET_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("AGRIMET_USER_AGENT")
                .unwrap_or_else(|_| "agrimet/0.1".to_string()),
            web_port: std::env::var("AGRIMET_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}
