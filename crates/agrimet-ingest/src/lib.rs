//! Ingestion pipeline orchestration: fetch → parse → upsert.

use anyhow::Result;
use agrimet_core::AppConfig;
use agrimet_source::{parse_forecasts, CwaForecastSource};
use agrimet_storage::ForecastStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "agrimet-ingest";

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub origin: String,
    pub parsed_records: usize,
    pub stored_rows: u64,
    pub database_path: String,
}

/// Single-run batch pipeline over one feed and one database file.
pub struct IngestPipeline {
    source: CwaForecastSource,
    store: ForecastStore,
}

impl IngestPipeline {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let source = CwaForecastSource::from_config(config)?;
        let store = ForecastStore::connect(&config.database_path).await?;
        Ok(Self { source, store })
    }

    /// Fetch → parse → upsert, stamping the whole batch with one timestamp.
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let (payload, origin) = self.source.fetch_payload().await?;
        let records = parse_forecasts(&payload);
        info!(
            %run_id,
            origin = origin.as_str(),
            parsed = records.len(),
            "parsed forecast payload"
        );

        let stored_rows = self.store.upsert_batch(&records, Utc::now()).await?;

        let finished_at = Utc::now();
        Ok(IngestRunSummary {
            run_id,
            started_at,
            finished_at,
            origin: origin.as_str().to_string(),
            parsed_records: records.len(),
            stored_rows,
            database_path: self.store.path().display().to_string(),
        })
    }
}

pub async fn run_ingest_from_env() -> Result<IngestRunSummary> {
    let config = AppConfig::from_env();
    let pipeline = IngestPipeline::new(&config).await?;
    pipeline.run_once().await
}
