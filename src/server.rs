//! HTTP surface of the print endpoint
//!
//! `POST /print` takes the raw HTML document as its body, queues it and
//! answers with a fixed acknowledgement before any capture work starts. The
//! job id is returned in the `X-Print-Job` header so callers can poll
//! `GET /jobs/{id}`; the body stays the same either way.
//!
//! Every response carries permissive CORS headers that echo the request
//! origin. `OPTIONS` on any path answers 200 with an empty body.

use crate::{
    log_failure, ArtifactArena, BrowserPool, Capturer, Config, HealthChecker, HealthStatus,
    JobLog, JobRecord, Metrics, Pipeline, PrintJob, PrintSink, PrinterTarget, WorkerPool,
};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Body of every `POST /print` response
pub const ACKNOWLEDGEMENT: &str = "Ok!";

pub const JOB_ID_HEADER: &str = "x-print-job";

const ALLOW_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";
const ALLOW_HEADERS: &str = "Accept, Authorization, Content-Type, X-Requested-With, Range";
const EXPOSE_HEADERS: &str = "Content-Length, X-Print-Job";

const DEFAULT_JOB_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub workers: Arc<WorkerPool>,
    pub jobs: Arc<JobLog>,
    pub arena: Arc<ArtifactArena>,
    pub target: PrinterTarget,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthChecker>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the pipeline, worker pool and job log for `config`
    ///
    /// Creates the temp directory and starts the workers; must run inside a
    /// Tokio runtime.
    pub async fn build(
        config: &Config,
        capturer: Arc<dyn Capturer>,
        sink: Arc<dyn PrintSink>,
        browser_pool: Option<BrowserPool>,
        prometheus: Option<PrometheusHandle>,
    ) -> std::io::Result<Self> {
        let arena = Arc::new(ArtifactArena::open(&config.temp_dir, config.artifact_max_age).await?);
        let metrics = Arc::new(Metrics::new());
        let jobs = Arc::new(JobLog::new(config.job_history));

        let pipeline = Arc::new(Pipeline::new(
            capturer,
            sink,
            config.print_width,
            config.commands.clone(),
            jobs.clone(),
            metrics.clone(),
        ));
        let workers = Arc::new(WorkerPool::new(
            pipeline,
            config.worker_count,
            config.queue_capacity,
            metrics.clone(),
        ));
        let health = Arc::new(HealthChecker::new(browser_pool, workers.clone()));

        Ok(Self {
            workers,
            jobs,
            arena,
            target: config.printer.clone(),
            metrics,
            health,
            prometheus,
        })
    }
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/print", post(print))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Serve `router` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Print endpoint listening on http://{}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn print(State(state): State<AppState>, body: Bytes) -> Response {
    let html = String::from_utf8_lossy(&body).into_owned();
    let job = PrintJob::new(html, state.arena.allocate(), state.target.clone());
    let id = job.id.clone();
    info!("Received print job {} ({} bytes)", id, body.len());

    state.metrics.record_received();
    state.jobs.record_received(&job);

    if let Err(err) = state.workers.submit(job) {
        state.jobs.fail(&id, err.stage(), &err);
        state.metrics.record_rejected();
        log_failure(&id, &err);
    }

    ([(HeaderName::from_static(JOB_ID_HEADER), id)], ACKNOWLEDGEMENT).into_response()
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Json<Vec<JobRecord>> {
    Json(state.jobs.recent(query.limit.unwrap_or(DEFAULT_JOB_LIMIT)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.jobs.get(&id) {
        Some(record) => Json(record).into_response(),
        None => (StatusCode::NOT_FOUND, "job not found").into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.health.check().await)
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn cors(request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    apply_cors_headers(response.headers_mut(), origin);
    response
}

/// Permissive CORS headers; the allowed origin echoes the caller's
pub fn apply_cors_headers(headers: &mut HeaderMap, origin: Option<HeaderValue>) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        origin.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_echoes_origin() {
        let mut headers = HeaderMap::new();
        apply_cors_headers(
            &mut headers,
            Some(HeaderValue::from_static("http://editor.local:8080")),
        );
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://editor.local:8080"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn test_cors_without_origin_allows_any() {
        let mut headers = HeaderMap::new();
        apply_cors_headers(&mut headers, None);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
