//! HTTP entry points: request schema, scrape submission.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use comscan_core::{IngestError, ResourceSet};
use comscan_source::IdentityResolver;
use comscan_storage::{RecordBatch, RecordStore};
use comscan_sync::JobHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "comscan-web";

#[derive(Clone)]
pub struct AppState {
    pub resolver: IdentityResolver,
    pub store: Arc<dyn RecordStore>,
    pub jobs: JobHandle,
}

impl AppState {
    pub fn new(resolver: IdentityResolver, store: Arc<dyn RecordStore>, jobs: JobHandle) -> Self {
        Self { resolver, store, jobs }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub company_link: Option<String>,
    #[serde(default)]
    pub jobs: bool,
    #[serde(default)]
    pub posts: bool,
    #[serde(default)]
    pub employees: bool,
    #[serde(default)]
    pub events: bool,
}

impl ScrapeRequest {
    pub fn resources(&self) -> ResourceSet {
        ResourceSet::from_flags(self.jobs, self.posts, self.employees, self.events)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeResponse {
    pub jobs: bool,
    pub posts: bool,
    pub employees: bool,
    pub events: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_link: Option<String>,
}

impl From<&ScrapeRequest> for ScrapeResponse {
    fn from(req: &ScrapeRequest) -> Self {
        Self {
            jobs: req.jobs,
            posts: req.posts,
            employees: req.employees,
            events: req.events,
            company_name: req.company_name.clone(),
            company_link: req.company_link.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        if err.is_client_error() {
            Self::bad_request(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/schema", get(schema_handler))
        .route("/scrape", post(scrape_handler))
        .with_state(Arc::new(state))
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "comscan web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> &'static str {
    "comscan: company metadata scanner"
}

async fn schema_handler() -> Json<serde_json::Value> {
    Json(json!({
        "company_name": "<str: company universal name>",
        "company_link": "<str: company profile link, used when company_name is absent>",
        "jobs": "<bool: fetch job postings | default: false>",
        "posts": "<bool: fetch company posts | default: false>",
        "employees": "<bool: fetch employees | default: false>",
        "events": "<bool: fetch company events | default: false>",
    }))
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ScrapeRequest>, JsonRejection>,
) -> Result<Json<ScrapeResponse>, ApiError> {
    let Json(req) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    if !has_text(&req.company_name) && !has_text(&req.company_link) {
        return Err(ApiError::bad_request("provide at least `company_name` or `company_link`"));
    }

    let company = state
        .resolver
        .resolve(req.company_name.as_deref(), req.company_link.as_deref())
        .await
        .inspect_err(|err| warn!(error = %err, "company resolution failed"))?;

    state
        .store
        .upsert(RecordBatch::Companies(vec![company.clone()]))
        .await
        .map_err(IngestError::from)?;

    let kinds = req.resources();
    if !kinds.is_empty() {
        let company_id = company.internal_id;
        let job_id = state
            .jobs
            .enqueue(company, kinds)
            .map_err(|err| ApiError::internal(err.to_string()))?;
        info!(%job_id, company_id, "ingestion job enqueued");
    }

    Ok(Json(ScrapeResponse::from(&req)))
}
