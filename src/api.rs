use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequest, Path, Request, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::ApiError;
use crate::export;
use crate::models::{ApiResponse, CauseEntry, MonitoringQuery, TelemetryEvent};
use crate::monitoring::{self, Paging, DEFAULT_CHARGING_PAGE_LIMIT, DEFAULT_ERROR_PAGE_LIMIT};
use crate::projections::{CauseTable, DanglingPolicy};
use crate::stats::ErrorStatistics;
use crate::store::{EventFilter, EventSource, SqliteEventStore};

/// Monitoring HTTP API.
/// Ingest only appends; every statistic is recomputed from stored telemetry per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteEventStore>,
}

impl AppState {
    pub fn new(store: SqliteEventStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Run a blocking store call off the async runtime.
    async fn with_store<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteEventStore) -> Result<T, crate::error::StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    async fn fetch(&self, filter: EventFilter) -> Result<Vec<TelemetryEvent>, ApiError> {
        self.with_store(move |store| store.fetch_events(&filter)).await
    }

    /// The request's own cause table, else the persisted one.
    async fn cause_table(&self, query: &MonitoringQuery) -> Result<CauseTable, ApiError> {
        match &query.error_codes {
            Some(codes) => Ok(CauseTable::new(codes.clone())),
            None => Ok(CauseTable::new(
                self.with_store(|store| store.list_cause_codes()).await?,
            )),
        }
    }
}

/// JSON request body whose rejections render like every other API error.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/events", post(create_event))
        .route("/monitoring/charging-page", post(charging_page))
        .route("/monitoring/sessions", post(sessions))
        .route("/monitoring/scar", post(scar))
        .route("/monitoring/errors", post(errors))
        .route("/monitoring/error-stats", post(error_stats))
        .route("/export/errors", post(export_error_stats))
        .route("/export/error-list", post(export_error_list))
        .route(
            "/cause-codes",
            get(list_cause_codes)
                .post(add_cause_code)
                .put(replace_cause_codes),
        )
        .route("/cause-codes/:code", delete(delete_cause_code))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    concat!("Charger SCAR API v", env!("CARGO_PKG_VERSION"))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Append one telemetry document
async fn create_event(
    State(state): State<AppState>,
    ApiJson(event): ApiJson<TelemetryEvent>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    let serial_no = event.serial_no.clone();
    let id = state
        .with_store(move |store| store.insert_event(event))
        .await?;
    info!(%id, %serial_no, "event ingested");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            format!("Event stored: {id}"),
            Some(serde_json::json!({ "id": id })),
        )),
    ))
}

async fn charging_page(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<Json<monitoring::ChargingPage>, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let events = state.fetch(filter).await?;
    let paging = Paging::from_query(&query, DEFAULT_CHARGING_PAGE_LIMIT);
    Ok(Json(monitoring::charging_page(&events, paging)))
}

/// Segmented sessions for the filter
async fn sessions(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let causes = state.cause_table(&query).await?;
    let events = state.fetch(filter).await?;

    let report = monitoring::session_report(&events, &causes, monitoring::dangling_policy(&query));
    Ok(Json(serde_json::json!({
        "sessions": report.segmentation.sessions,
        "count": report.segmentation.sessions.len(),
        "unterminated": report.unterminated(),
    })))
}

/// SCAR summary for the filter
async fn scar(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let causes = state.cause_table(&query).await?;
    let events = state.fetch(filter).await?;

    let report = monitoring::session_report(&events, &causes, DanglingPolicy::Drop);
    Ok(Json(serde_json::json!({
        "scar": report.scar,
        "sessionCount": report.segmentation.sessions.len(),
        "unterminated": report.unterminated(),
    })))
}

async fn errors(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<Json<monitoring::ErrorPage>, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let events = state.fetch(filter).await?;
    let paging = Paging::from_query(&query, DEFAULT_ERROR_PAGE_LIMIT);
    Ok(Json(monitoring::error_page(&events, paging)))
}

async fn error_stats(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<Json<ErrorStatistics>, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let events = state.fetch(filter).await?;
    Ok(Json(ErrorStatistics::from_events(&events)))
}

async fn export_error_stats(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let events = state.fetch(filter).await?;
    let stats = ErrorStatistics::from_events(&events);
    let body = export::error_statistics_csv(&stats, query.selected_codes.as_deref())?;
    Ok(csv_attachment("error_statistics.csv", body))
}

async fn export_error_list(
    State(state): State<AppState>,
    ApiJson(query): ApiJson<MonitoringQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = monitoring::filter_from_query(&query)?;
    let events = state.fetch(filter).await?;
    let page = monitoring::error_page(
        &events,
        Paging {
            fetch_all: true,
            ..Paging::from_query(&query, DEFAULT_ERROR_PAGE_LIMIT)
        },
    );
    let body = export::error_list_csv(&page.errors)?;
    Ok(csv_attachment("error_list.csv", body))
}

async fn list_cause_codes(State(state): State<AppState>) -> Result<Json<Vec<CauseEntry>>, ApiError> {
    Ok(Json(
        state.with_store(|store| store.list_cause_codes()).await?,
    ))
}

async fn add_cause_code(
    State(state): State<AppState>,
    ApiJson(entry): ApiJson<CauseEntry>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    let code = entry.code.trim().to_string();
    state
        .with_store(move |store| store.add_cause_code(entry))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(format!("Cause code added: {code}"), None)),
    ))
}

async fn replace_cause_codes(
    State(state): State<AppState>,
    ApiJson(entries): ApiJson<Vec<CauseEntry>>,
) -> Result<Json<ApiResponse>, ApiError> {
    let count = entries.len();
    state
        .with_store(move |store| store.replace_cause_codes(entries))
        .await?;
    Ok(Json(ApiResponse::success(
        format!("Cause table replaced ({count} entries)"),
        None,
    )))
}

async fn delete_cause_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let target = code.clone();
    let removed = state
        .with_store(move |store| store.delete_cause_code(&target))
        .await?;
    if removed == 0 {
        return Err(ApiError::NotFound(format!("cause code {code:?} not found")));
    }
    Ok(Json(ApiResponse::success(
        format!("Cause code removed: {code}"),
        Some(serde_json::json!({ "removed": removed })),
    )))
}

fn csv_attachment(filename: &str, body: Vec<u8>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
}
