#![forbid(unsafe_code)]

//! Axum server for the conversion job API.
//!
//! `POST /api/convert` starts a job and answers right away with its id,
//! `GET /api/status/{id}` reports progress, and `GET /files/{id}.{ext}`
//! hands out the finished audio once the job has completed.
//! `POST /api/extract` looks a video up (title, thumbnail, length) without
//! starting a job. The actual
//! conversion is delegated to the configured backend (a local `yt-dlp` or a
//! hosted upstream API).

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tubeconvert::{
    backend::{ArtifactBody, ConversionBackend},
    config::{BackendKind, ServerOverrides, ServerSettings, StoreKind, resolve_server_settings},
    error::ServiceError,
    hosted::HostedBackend,
    job::{ConversionJob, JobId},
    jobdb::SqliteJobStore,
    protocol::{
        CONVERT_PATH, EXTRACT_PATH, ErrorResponse, ExtractRequest, ExtractResponse, FILES_ROUTE,
        STATUS_ROUTE, StatusResponse, SubmitRequest, SubmitResponse, parse_download_file,
    },
    security::{ascii_filename, ensure_not_root, sanitize_filename},
    service::{Delivery, JobService},
    store::{JobStore, MemoryJobStore},
    ytdlp::YtDlpBackend,
};

const DEFAULT_LOG_FILTER: &str = "tubeconvert=info,server=info,tower_http=info";
const FALLBACK_MIME: &str = "audio/mpeg";
// Upper bound between retention sweeps; short windows sweep more often.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ServerArgs {
    data_root: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    backend: Option<BackendKind>,
    env_path: Option<PathBuf>,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = || -> Result<String> {
                match inline.clone() {
                    Some(value) => Ok(value),
                    None => args
                        .next()
                        .ok_or_else(|| anyhow!("{flag} requires a value")),
                }
            };

            match flag.as_str() {
                "--data-root" => parsed.data_root = Some(PathBuf::from(value()?)),
                "--host" => parsed.host = Some(parse_host_arg(&value()?)?.to_string()),
                "--port" => parsed.port = Some(parse_port_arg(&value()?)?),
                "--backend" => parsed.backend = Some(BackendKind::parse(&value()?)?),
                "--env-file" => parsed.env_path = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> ServerOverrides {
        ServerOverrides {
            data_root: self.data_root,
            host: self.host,
            port: self.port,
            backend: self.backend,
            env_path: self.env_path,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBECONVERT_HOST")
}

/// Shared handler state. `default_cookie` is the operator-configured cookie
/// blob used when a request carries none of its own.
#[derive(Clone)]
struct AppState {
    service: JobService,
    default_cookie: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NotFound",
            message: message.into(),
        }
    }

    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "InvalidInput",
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::WorkerDispatchFailed(_)
            | ServiceError::DeliveryFailure(_)
            | ServiceError::LookupFailed(_) => StatusCode::BAD_GATEWAY,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NotReady(_) | ServiceError::JobFailed { .. } => StatusCode::CONFLICT,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "job store failure");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.code, self.message))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse()?;
    ensure_not_root("tubeconvert-server")?;
    init_tracing();

    let settings = resolve_server_settings(args.into_overrides())?;
    let store = open_store(&settings).await?;
    let backend = build_backend(&settings)?;
    let service = JobService::new(store, backend);
    tracing::info!(
        backend = service.backend_name(),
        store = ?settings.job_store,
        data_root = %settings.data_root.display(),
        "conversion service ready"
    );

    tokio::spawn(sweep_expired(service.clone(), settings.job_retention));

    let state = AppState {
        service,
        default_cookie: settings.cookie_header.clone(),
    };
    let app = build_router(state);

    let host = parse_host_arg(&settings.host)?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("Conversion API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(settings: &ServerSettings) -> Result<Arc<dyn JobStore>> {
    match settings.job_store {
        StoreKind::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreKind::Sqlite => {
            let path = settings.job_db_path();
            let store = SqliteJobStore::open(&path)
                .await
                .with_context(|| format!("opening job database {}", path.display()))?;
            let interrupted = store
                .fail_interrupted()
                .await
                .context("closing out jobs interrupted by the last shutdown")?;
            if interrupted > 0 {
                tracing::warn!(count = interrupted, "marked interrupted jobs as failed");
            }
            Ok(Arc::new(store))
        }
    }
}

fn build_backend(settings: &ServerSettings) -> Result<Arc<dyn ConversionBackend>> {
    match settings.backend {
        BackendKind::YtDlp => {
            let ytdlp = settings.ytdlp_settings();
            std::fs::create_dir_all(&ytdlp.output_dir).with_context(|| {
                format!("creating artifact directory {}", ytdlp.output_dir.display())
            })?;
            Ok(Arc::new(YtDlpBackend::new(ytdlp)))
        }
        BackendKind::Hosted => {
            let hosted = HostedBackend::new(
                settings.hosted_settings()?,
                settings.cookie_header.clone(),
            )
            .context("configuring hosted backend")?;
            Ok(Arc::new(hosted))
        }
    }
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(CONVERT_PATH, post(submit_job))
        .route(EXTRACT_PATH, post(extract_info))
        .route(STATUS_ROUTE, get(job_status))
        .route(FILES_ROUTE, get(download_artifact))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Periodically drops finished jobs older than the retention window.
async fn sweep_expired(service: JobService, retention: Duration) {
    let period = (retention / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = service.purge_expired(retention).await {
            tracing::warn!(error = %err, "retention sweep failed");
        }
    }
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(request) = payload.map_err(|err| ApiError::invalid_input(err.body_text()))?;
    let cookie = pick_cookie(
        request.cookie,
        &headers,
        state.default_cookie.as_deref(),
    );
    let receipt = state.service.submit(&request.url, cookie).await?;
    Ok(Json(SubmitResponse {
        success: true,
        id: receipt.id.to_string(),
        status_url: Some(receipt.status_url),
    }))
}

async fn extract_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> ApiResult<Json<ExtractResponse>> {
    let Json(request) = payload.map_err(|err| ApiError::invalid_input(err.body_text()))?;
    let cookie = pick_cookie(
        request.cookie,
        &headers,
        state.default_cookie.as_deref(),
    );
    let info = state.service.describe(&request.url, cookie).await?;
    Ok(Json(ExtractResponse {
        success: true,
        info,
    }))
}

/// Cookie material for a submission: the body field wins, then the request's
/// own `Cookie` header, then the configured default.
fn pick_cookie(
    from_body: Option<String>,
    headers: &HeaderMap,
    configured: Option<&str>,
) -> Option<String> {
    let non_blank = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    from_body
        .and_then(non_blank)
        .or_else(|| {
            headers
                .get(header::COOKIE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .and_then(non_blank)
        })
        .or_else(|| configured.map(str::to_string).and_then(non_blank))
}

async fn job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<StatusResponse>> {
    let id = JobId::parse(&id).ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;
    let job = state.service.status(&id).await?;
    Ok(Json(StatusResponse::from_job(&job)))
}

async fn download_artifact(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
) -> ApiResult<Response> {
    let (id, ext) =
        parse_download_file(&file).ok_or_else(|| ApiError::not_found("file not found"))?;
    let Delivery { job, body } = state.service.artifact(&id).await?;
    let expected_ext = job
        .artifact()
        .map(|artifact| artifact.extension())
        .unwrap_or_default();
    if !ext.is_empty() && !ext.eq_ignore_ascii_case(&expected_ext) {
        return Err(ApiError::not_found("file not found"));
    }
    tracing::debug!(job_id = %id, "delivering artifact");
    Ok(artifact_response(&job, &expected_ext, body))
}

fn artifact_response(job: &ConversionJob, ext: &str, body: ArtifactBody) -> Response {
    match body {
        ArtifactBody::Redirect(url) => match HeaderValue::from_str(&url) {
            Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
            Err(_) => ApiError {
                status: StatusCode::BAD_GATEWAY,
                code: "DeliveryFailure",
                message: "artifact location is not a valid URL".into(),
            }
            .into_response(),
        },
        ArtifactBody::Stream { body, length } => {
            let mut response = Body::from_stream(body).into_response();
            let headers = response.headers_mut();
            let mime = MimeGuess::from_ext(ext)
                .first()
                .map(|mime| mime.to_string())
                .unwrap_or_else(|| FALLBACK_MIME.to_string());
            if let Ok(value) = HeaderValue::from_str(&mime) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            if let Ok(value) = HeaderValue::from_str(&content_disposition(job, ext)) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            if let Some(length) = length {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            }
            response
        }
    }
}

/// `attachment` disposition named after the job title, with an ASCII
/// fallback plus the RFC 5987 UTF-8 form.
fn content_disposition(job: &ConversionJob, ext: &str) -> String {
    let stem = job.title().unwrap_or(job.id().as_str());
    let ascii = format!("{}.{ext}", ascii_filename(stem));
    let utf8 = format!("{}.{ext}", sanitize_filename(stem));
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(&utf8)
    )
}
