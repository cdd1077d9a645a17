//! CWA agricultural forecast feed: remote fetch with local fallback, and
//! payload flattening into normalized records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use agrimet_core::{AppConfig, ForecastRecord};
use agrimet_storage::{HttpClientConfig, HttpFetcher};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "agrimet-source";

/// Where a payload came from in a given run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOrigin {
    Api,
    Fallback,
}

impl PayloadOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Fallback => "fallback",
        }
    }
}

/// The one feed this system ingests.
#[derive(Debug)]
pub struct CwaForecastSource {
    fetcher: HttpFetcher,
    url: String,
    api_key: Option<String>,
    fallback_path: PathBuf,
}

impl CwaForecastSource {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            fetcher,
            url: config.forecast_url.clone(),
            api_key: config.api_key.clone(),
            fallback_path: config.fallback_path.clone(),
        })
    }

    /// One remote attempt, then the local snapshot file.
    ///
    /// A missing snapshot is the only fatal case; it propagates to the
    /// caller.
    pub async fn fetch_payload(&self) -> Result<(Value, PayloadOrigin)> {
        match self.fetch_remote().await {
            Ok(payload) => {
                info!("fetched forecast payload from CWA API");
                Ok((payload, PayloadOrigin::Api))
            }
            Err(err) => {
                warn!(error = %err, "remote fetch failed, reading local fallback");
                let payload = self.read_fallback().await?;
                Ok((payload, PayloadOrigin::Fallback))
            }
        }
    }

    async fn fetch_remote(&self) -> Result<Value> {
        let Some(api_key) = self.api_key.as_deref() else {
            anyhow::bail!("no CWA api key configured");
        };
        let bytes = self
            .fetcher
            .fetch_bytes(
                &self.url,
                &[
                    ("Authorization", api_key),
                    ("downloadType", "WEB"),
                    ("format", "JSON"),
                ],
            )
            .await?;
        serde_json::from_slice(&bytes).context("decoding CWA response body")
    }

    async fn read_fallback(&self) -> Result<Value> {
        let bytes = tokio::fs::read(&self.fallback_path)
            .await
            .with_context(|| {
                format!("reading fallback file {}", self.fallback_path.display())
            })?;
        serde_json::from_slice(&bytes).with_context(|| {
            format!("parsing fallback file {}", self.fallback_path.display())
        })
    }
}

/// Flatten the nested CWA payload into (location, date, max, min) records.
///
/// Best-effort: a payload without the expected structure yields an empty
/// Vec, partial daily series are null-filled, and entries with unusable
/// dates are skipped.
pub fn parse_forecasts(payload: &Value) -> Vec<ForecastRecord> {
    let Some(locations) = forecast_locations(payload) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for location in locations {
        let Some(name) = location
            .get("locationName")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
        else {
            continue;
        };

        let elements = location.get("weatherElements");
        let max_map = daily_series(elements, "MaxT");
        let min_map = daily_series(elements, "MinT");

        let dates: BTreeSet<NaiveDate> = max_map.keys().chain(min_map.keys()).copied().collect();
        for date in dates {
            records.push(ForecastRecord {
                location: name.to_string(),
                data_date: date,
                max_temp: max_map.get(&date).copied().flatten(),
                min_temp: min_map.get(&date).copied().flatten(),
            });
        }
    }
    records
}

fn forecast_locations(payload: &Value) -> Option<&Vec<Value>> {
    payload
        .get("cwaopendata")?
        .get("resources")?
        .get("resource")?
        .get("data")?
        .get("agrWeatherForecasts")?
        .get("weatherForecasts")?
        .get("location")?
        .as_array()
}

fn daily_series(elements: Option<&Value>, element: &str) -> BTreeMap<NaiveDate, Option<f64>> {
    let mut map = BTreeMap::new();
    let Some(entries) = elements
        .and_then(|e| e.get(element))
        .and_then(|e| e.get("daily"))
        .and_then(Value::as_array)
    else {
        return map;
    };

    for entry in entries {
        let Some(date) = entry
            .get("dataDate")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        else {
            continue;
        };
        map.insert(date, coerce_temperature(entry.get("temperature")));
    }
    map
}

// The feed reports temperatures as strings; blanks and junk become null,
// never zero.
fn coerce_temperature(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse().ok()
            }
        }
        Some(Value::Number(number)) => number.as_f64(),
        _ => None,
    }
}
