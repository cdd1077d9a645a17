//! SQLite forecast storage + HTTP fetch utilities for agrimet.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use agrimet_core::{ForecastRecord, StoredForecast};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, info_span};

pub const CRATE_NAME: &str = "agrimet-storage";

/// File-backed forecast table with a (location, data_date) uniqueness key.
#[derive(Debug, Clone)]
pub struct ForecastStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl ForecastStore {
    /// Open (creating if missing) the database and ensure the table exists.
    pub async fn connect(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forecasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location TEXT NOT NULL,
                data_date TEXT NOT NULL,
                max_temp REAL,
                min_temp REAL,
                fetched_at TEXT NOT NULL,
                UNIQUE(location, data_date)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("creating forecasts table")?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert a batch, last-write-wins on (location, data_date).
    ///
    /// Every row in the batch is stamped with the one shared `fetched_at`.
    /// An empty batch is logged and writes nothing.
    pub async fn upsert_batch(
        &self,
        records: &[ForecastRecord],
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        if records.is_empty() {
            info!("no forecast records to store");
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning forecast upsert transaction")?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO forecasts (location, data_date, max_temp, min_temp, fetched_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(location, data_date) DO UPDATE SET
                    max_temp = excluded.max_temp,
                    min_temp = excluded.min_temp,
                    fetched_at = excluded.fetched_at
                "#,
            )
            .bind(&record.location)
            .bind(record.data_date)
            .bind(record.max_temp)
            .bind(record.min_temp)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "upserting forecast {} {}",
                    record.location, record.data_date
                )
            })?;
        }

        tx.commit()
            .await
            .context("committing forecast upsert transaction")?;
        Ok(records.len() as u64)
    }

    /// All rows ordered by (location, data_date).
    pub async fn load_all(&self) -> anyhow::Result<Vec<StoredForecast>> {
        let rows = sqlx::query(
            r#"
            SELECT location, data_date, max_temp, min_temp, fetched_at
              FROM forecasts
             ORDER BY location, data_date
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading forecast rows")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredForecast {
                location: row.try_get("location")?,
                data_date: row.try_get("data_date")?,
                max_temp: row.try_get("max_temp")?,
                min_temp: row.try_get("min_temp")?,
                fetched_at: row.try_get("fetched_at")?,
            });
        }
        Ok(out)
    }

    pub async fn count(&self) -> anyhow::Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM forecasts")
            .fetch_one(&self.pool)
            .await
            .context("counting forecast rows")?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper with a fixed timeout ceiling.
///
/// One attempt per call; the caller decides what to do on failure.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn record(location: &str, date: &str, max: Option<f64>, min: Option<f64>) -> ForecastRecord {
        ForecastRecord {
            location: location.to_string(),
            data_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date"),
            max_temp: max,
            min_temp: min,
        }
    }

    fn ts(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn reingesting_a_key_overwrites_value_and_timestamp() {
        let dir = tempdir().expect("tempdir");
        let store = ForecastStore::connect(dir.path().join("forecasts.db"))
            .await
            .expect("connect");

        let first = ts("2026-08-01T00:00:00Z");
        let second = ts("2026-08-02T00:00:00Z");

        store
            .upsert_batch(&[record("北部地區", "2026-08-03", Some(20.0), Some(15.0))], first)
            .await
            .expect("first upsert");
        store
            .upsert_batch(&[record("北部地區", "2026-08-03", Some(22.5), None)], second)
            .await
            .expect("second upsert");

        let rows = store.load_all().await.expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].max_temp, Some(22.5));
        assert_eq!(rows[0].min_temp, None);
        assert_eq!(rows[0].fetched_at, second);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = ForecastStore::connect(dir.path().join("forecasts.db"))
            .await
            .expect("connect");

        let written = store
            .upsert_batch(&[], ts("2026-08-01T00:00:00Z"))
            .await
            .expect("upsert");
        assert_eq!(written, 0);
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn load_all_orders_by_location_then_date() {
        let dir = tempdir().expect("tempdir");
        let store = ForecastStore::connect(dir.path().join("forecasts.db"))
            .await
            .expect("connect");

        let batch = vec![
            record("南部地區", "2026-08-04", Some(33.0), Some(26.0)),
            record("北部地區", "2026-08-05", Some(31.0), Some(25.0)),
            record("北部地區", "2026-08-04", Some(30.0), Some(24.0)),
        ];
        store
            .upsert_batch(&batch, ts("2026-08-01T00:00:00Z"))
            .await
            .expect("upsert");

        let rows = store.load_all().await.expect("load");
        let keys: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.location.clone(), r.data_date.to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("北部地區".to_string(), "2026-08-04".to_string()),
                ("北部地區".to_string(), "2026-08-05".to_string()),
                ("南部地區".to_string(), "2026-08-04".to_string()),
            ]
        );
    }
}
