//! Axum + Askama dashboard over the forecast database.
//!
//! The viewer never writes: rows are read through a process-wide cache
//! keyed by database path, invalidated only by the `/refresh` endpoint.
//! Filter changes re-render the affected panels via htmx partials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agrimet_core::{AppConfig, StoredForecast};
use agrimet_storage::ForecastStore;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub const CRATE_NAME: &str = "agrimet-web";

/// Process-wide forecast row cache, keyed by database path.
///
/// `/refresh` is the only invalidation point; plain reads always go
/// through here.
#[derive(Debug, Default)]
pub struct ForecastCache {
    inner: Mutex<HashMap<PathBuf, Arc<Vec<StoredForecast>>>>,
}

impl ForecastCache {
    pub async fn load(&self, path: &Path) -> anyhow::Result<Arc<Vec<StoredForecast>>> {
        let mut inner = self.inner.lock().await;
        if let Some(rows) = inner.get(path) {
            return Ok(Arc::clone(rows));
        }
        let rows = Arc::new(read_rows(path).await?);
        inner.insert(path.to_path_buf(), Arc::clone(&rows));
        Ok(rows)
    }

    pub async fn invalidate(&self, path: &Path) {
        self.inner.lock().await.remove(path);
    }
}

// The viewer never creates the database file; a missing file is simply an
// empty dataset.
async fn read_rows(path: &Path) -> anyhow::Result<Vec<StoredForecast>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let store = ForecastStore::connect(path).await?;
    store.load_all().await
}

#[derive(Clone)]
pub struct AppState {
    config: AppConfig,
    cache: Arc<ForecastCache>,
    assets_dir: PathBuf,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            cache: Arc::new(ForecastCache::default()),
            assets_dir: PathBuf::from("assets/static"),
        }
    }

    async fn load_rows(&self) -> anyhow::Result<Arc<Vec<StoredForecast>>> {
        self.cache.load(&self.config.database_path).await
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ForecastQuery {
    pub region: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// The dashboard's resolved filter state plus the rows it selects.
#[derive(Debug, Clone)]
pub struct FilteredView {
    pub regions: Vec<String>,
    pub region: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub rows: Vec<StoredForecast>,
}

/// Apply region + date-range filters, defaulting to 北部地區 (when present)
/// over the full span of the data. A single supplied date collapses the
/// range to that day.
pub fn filtered_view(all: &[StoredForecast], query: &ForecastQuery) -> FilteredView {
    let mut regions: Vec<String> = all.iter().map(|row| row.location.clone()).collect();
    regions.sort();
    regions.dedup();

    let region = query
        .region
        .as_deref()
        .filter(|region| !region.is_empty())
        .map(ToString::to_string)
        .or_else(|| default_region(&regions))
        .unwrap_or_default();

    let data_min = all.iter().map(|row| row.data_date).min();
    let data_max = all.iter().map(|row| row.data_date).max();
    let (start, end) = match (parse_date(query.start.as_deref()), parse_date(query.end.as_deref()))
    {
        (Some(start), Some(end)) => (Some(start), Some(end)),
        (Some(start), None) => (Some(start), Some(start)),
        (None, Some(end)) => (Some(end), Some(end)),
        (None, None) => (data_min, data_max),
    };

    let rows = all
        .iter()
        .filter(|row| {
            row.location == region
                && start.map_or(true, |s| row.data_date >= s)
                && end.map_or(true, |e| row.data_date <= e)
        })
        .cloned()
        .collect();

    FilteredView {
        regions,
        region,
        start,
        end,
        rows,
    }
}

fn default_region(regions: &[String]) -> Option<String> {
    if regions.iter().any(|region| region == "北部地區") {
        return Some("北部地區".to_string());
    }
    regions.first().cloned()
}

fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    value
        .filter(|text| !text.trim().is_empty())
        .and_then(|text| NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok())
}

fn fmt_temp(value: Option<f64>) -> String {
    match value {
        Some(temp) => format!("{temp:.1} ℃"),
        None => "—".to_string(),
    }
}

#[derive(Debug, Clone)]
struct RegionOption {
    name: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct TableRowView {
    date: String,
    max_temp: String,
    min_temp: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    has_data: bool,
    regions: Vec<RegionOption>,
    start_value: String,
    end_value: String,
}

#[derive(Template)]
#[template(path = "forecast_table_partial.html")]
struct ForecastTablePartialTemplate {
    has_rows: bool,
    region: String,
    rows: Vec<TableRowView>,
}

#[derive(Template)]
#[template(path = "metrics_partial.html")]
struct MetricsPartialTemplate {
    has_rows: bool,
    latest_max: String,
    latest_min: String,
    latest_date: String,
    last_fetched: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/forecasts/table", get(forecast_table_handler))
        .route("/forecasts/metrics", get(metrics_handler))
        .route("/forecasts/chart", get(chart_handler))
        .route("/refresh", post(refresh_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let state = AppState::new(config);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppConfig::from_env()).await
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForecastQuery>,
) -> Response {
    match state.load_rows().await {
        Ok(rows) => {
            let view = filtered_view(&rows, &query);
            let regions = view
                .regions
                .iter()
                .map(|name| RegionOption {
                    selected: *name == view.region,
                    name: name.clone(),
                })
                .collect();
            render_html(IndexTemplate {
                has_data: !rows.is_empty(),
                regions,
                start_value: view.start.map(|d| d.to_string()).unwrap_or_default(),
                end_value: view.end.map(|d| d.to_string()).unwrap_or_default(),
            })
        }
        Err(err) => server_error(err),
    }
}

async fn forecast_table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForecastQuery>,
) -> Response {
    match state.load_rows().await {
        Ok(rows) => {
            let view = filtered_view(&rows, &query);
            let table_rows = view
                .rows
                .iter()
                .map(|row| TableRowView {
                    date: row.data_date.to_string(),
                    max_temp: fmt_temp(row.max_temp),
                    min_temp: fmt_temp(row.min_temp),
                })
                .collect::<Vec<_>>();
            render_html(ForecastTablePartialTemplate {
                has_rows: !table_rows.is_empty(),
                region: view.region,
                rows: table_rows,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForecastQuery>,
) -> Response {
    match state.load_rows().await {
        Ok(rows) => {
            let view = filtered_view(&rows, &query);
            let latest = view.rows.iter().max_by_key(|row| row.data_date);
            let last_fetched = view
                .rows
                .iter()
                .map(|row| row.fetched_at)
                .max()
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default();
            render_html(MetricsPartialTemplate {
                has_rows: latest.is_some(),
                latest_max: latest.map(|row| fmt_temp(row.max_temp)).unwrap_or_default(),
                latest_min: latest.map(|row| fmt_temp(row.min_temp)).unwrap_or_default(),
                latest_date: latest
                    .map(|row| row.data_date.to_string())
                    .unwrap_or_default(),
                last_fetched,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForecastQuery>,
) -> Response {
    match state.load_rows().await {
        Ok(rows) => {
            let view = filtered_view(&rows, &query);
            let (mut max_x, mut max_y) = (Vec::new(), Vec::new());
            let (mut min_x, mut min_y) = (Vec::new(), Vec::new());
            for row in &view.rows {
                if let Some(temp) = row.max_temp {
                    max_x.push(row.data_date.to_string());
                    max_y.push(temp);
                }
                if let Some(temp) = row.min_temp {
                    min_x.push(row.data_date.to_string());
                    min_y.push(temp);
                }
            }
            Json(serde_json::json!({
                "data": [
                    {
                        "type": "scatter",
                        "mode": "lines+markers",
                        "name": "Max temp",
                        "x": max_x,
                        "y": max_y,
                        "marker": {"color": "#ef4444"}
                    },
                    {
                        "type": "scatter",
                        "mode": "lines+markers",
                        "name": "Min temp",
                        "x": min_x,
                        "y": min_y,
                        "marker": {"color": "#0ea5e9"}
                    }
                ],
                "layout": {
                    "title": format!("{} daily high / low", view.region),
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc",
                    "legend": {"orientation": "h"}
                }
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    state.cache.invalidate(&state.config.database_path).await;
    let mut resp = Html(String::new()).into_response();
    resp.headers_mut().insert(
        header::HeaderName::from_static("hx-trigger"),
        header::HeaderValue::from_static("forecastsRefreshed"),
    );
    resp
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.assets_dir.join("app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Html("/* missing app.css */".to_string()),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agrimet_core::ForecastRecord;
    use axum::body::Body;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config(dir: &Path) -> AppConfig {
        AppConfig {
            database_path: dir.join("forecasts.db"),
            fallback_path: dir.join("fallback.json"),
            forecast_url: "http://127.0.0.1:9/unreachable".to_string(),
            api_key: None,
            http_timeout_secs: 1,
            user_agent: "agrimet-test/0.1".to_string(),
            web_port: 0,
        }
    }

    fn stored(location: &str, date: &str, max: Option<f64>, min: Option<f64>) -> StoredForecast {
        StoredForecast {
            location: location.to_string(),
            data_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date"),
            max_temp: max,
            min_temp: min,
            fetched_at: DateTime::parse_from_rfc3339("2026-08-07T00:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    async fn seed(config: &AppConfig, records: &[ForecastRecord]) {
        let store = ForecastStore::connect(&config.database_path)
            .await
            .expect("connect");
        store
            .upsert_batch(records, Utc::now())
            .await
            .expect("seed");
    }

    fn record(location: &str, date: &str, max: Option<f64>, min: Option<f64>) -> ForecastRecord {
        ForecastRecord {
            location: location.to_string(),
            data_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date"),
            max_temp: max,
            min_temp: min,
        }
    }

    #[test]
    fn filter_excluding_all_rows_yields_empty_view() {
        let rows = vec![
            stored("北部地區", "2026-08-08", Some(33.0), Some(26.0)),
            stored("南部地區", "2026-08-08", Some(34.0), Some(27.0)),
        ];
        let query = ForecastQuery {
            region: Some("北部地區".to_string()),
            start: Some("2030-01-01".to_string()),
            end: Some("2030-01-31".to_string()),
        };
        let view = filtered_view(&rows, &query);
        assert!(view.rows.is_empty());
        assert_eq!(view.regions.len(), 2);
    }

    #[test]
    fn default_region_prefers_northern_district() {
        let rows = vec![
            stored("南部地區", "2026-08-08", Some(34.0), Some(27.0)),
            stored("北部地區", "2026-08-08", Some(33.0), Some(26.0)),
        ];
        let view = filtered_view(&rows, &ForecastQuery::default());
        assert_eq!(view.region, "北部地區");
        assert_eq!(view.rows.len(), 1);
    }

    #[test]
    fn single_supplied_date_collapses_the_range() {
        let rows = vec![
            stored("北部地區", "2026-08-08", Some(33.0), Some(26.0)),
            stored("北部地區", "2026-08-09", Some(32.0), Some(25.0)),
        ];
        let query = ForecastQuery {
            region: None,
            start: Some("2026-08-09".to_string()),
            end: None,
        };
        let view = filtered_view(&rows, &query);
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[0].data_date.to_string(), "2026-08-09");
    }

    #[tokio::test]
    async fn index_warns_when_database_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(AppState::new(test_config(dir.path())));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("No forecast data yet"));
    }

    #[tokio::test]
    async fn table_partial_shows_empty_state_for_excluding_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        seed(
            &config,
            &[record("北部地區", "2026-08-08", Some(33.0), Some(26.0))],
        )
        .await;

        let app = app(AppState::new(config));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/forecasts/table?region=%E5%8C%97%E9%83%A8%E5%9C%B0%E5%8D%80&start=2030-01-01&end=2030-01-31")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("No data for this filter"));
    }

    #[tokio::test]
    async fn chart_returns_plotly_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        seed(
            &config,
            &[record("北部地區", "2026-08-08", Some(33.0), Some(26.0))],
        )
        .await;

        let app = app(AppState::new(config));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/forecasts/chart")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["data"][0]["y"][0], 33.0);
    }

    #[tokio::test]
    async fn refresh_invalidates_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let state = AppState::new(config.clone());

        // Warm the cache while the database is still empty.
        let rows = state.load_rows().await.expect("load");
        assert!(rows.is_empty());

        seed(
            &config,
            &[record("北部地區", "2026-08-08", Some(33.0), Some(26.0))],
        )
        .await;
        let rows = state.load_rows().await.expect("load");
        assert!(rows.is_empty(), "cache must serve the memoized rows");

        state.cache.invalidate(&config.database_path).await;
        let rows = state.load_rows().await.expect("load");
        assert_eq!(rows.len(), 1);
    }
}
