use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{
        HeaderMap, HeaderName, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
        request::Parts,
    },
    response::Response,
    routing::get,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::debug;

use crate::{
    backend::{ExtractionBackend, ExtractionResult},
    config::{Config, non_empty},
    error::ApiError,
    orchestrator::{DownloadOrchestrator, ExtractionRequest, JobLimits, validate_source_url},
    rate_limit::RateLimiter,
    stream::{DOWNLOAD_FILENAME_HEADER, stream},
    transcode::{Bitrate, DEFAULT_BITRATE, Transcoder},
    workspace::WorkspaceManager,
};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared secret compared by digest.
#[derive(Debug)]
pub struct ApiKey {
    digest: Vec<u8>,
}

impl ApiKey {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).to_vec(),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        Sha256::digest(candidate.as_bytes()).as_slice() == self.digest.as_slice()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DownloadOrchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub api_key: Arc<ApiKey>,
    pub trust_proxy_headers: bool,
    pub stream_chunk_bytes: usize,
}

impl AppState {
    pub fn new(config: &Config, backend: ExtractionBackend) -> Self {
        let orchestrator = DownloadOrchestrator::new(
            Arc::new(backend),
            Transcoder::new(config.ffmpeg.clone(), config.transcode_timeout),
            WorkspaceManager::new(&config.download_dir, config.stale_workspace_after),
            JobLimits::from_config(config),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_max_requests,
                config.rate_limit_window,
            )),
            api_key: Arc::new(ApiKey::new(&config.api_key)),
            trust_proxy_headers: config.trust_proxy_headers,
            stream_chunk_bytes: config.stream_chunk_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/formats", get(fetch_formats))
        .route("/download", get(download))
        .route("/convert_mp3", get(convert_mp3))
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            CONTENT_LENGTH,
            CONTENT_TYPE,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ])
        .max_age(Duration::from_secs(3600))
}

/// Address used as the rate-limit key.
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let forwarded = if state.trust_proxy_headers {
            extract_client_ip(&parts.headers)
        } else {
            None
        };
        let socket = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Ok(Self(
            forwarded
                .or(socket)
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

/// Rate limit first, then the shared secret.
async fn guard(
    state: &AppState,
    client: &ClientAddr,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> Result<(), ApiError> {
    let admission = state.rate_limiter.admit(&client.0).await;
    if !admission.allowed {
        debug!("rate limited {}", client.0);
        return Err(ApiError::rate_limited(
            admission.limit,
            admission.retry_after.as_secs().max(1),
        ));
    }

    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(non_empty)
        .or_else(|| query_key.and_then(non_empty));

    match presented {
        Some(key) if state.api_key.matches(key) => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    active_jobs: usize,
    capacity: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.orchestrator.backend().name(),
        active_jobs: state.orchestrator.active_jobs(),
        capacity: state.orchestrator.capacity(),
    })
}

#[derive(Debug, Deserialize)]
struct FormatsParams {
    url: Option<String>,
    api_key: Option<String>,
}

async fn fetch_formats(
    State(state): State<AppState>,
    client: ClientAddr,
    headers: HeaderMap,
    Query(params): Query<FormatsParams>,
) -> Result<Json<ExtractionResult>, ApiError> {
    guard(&state, &client, &headers, params.api_key.as_deref()).await?;

    let url = params
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("missing url param"))?;
    let url = validate_source_url(url).map_err(ApiError::bad_request)?;

    let result = state
        .orchestrator
        .backend()
        .list_formats(&url)
        .await
        .map_err(|error| ApiError::from_job(error, StatusCode::BAD_REQUEST))?;

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: Option<String>,
    format_id: Option<String>,
    bitrate: Option<String>,
    api_key: Option<String>,
}

impl DownloadParams {
    fn required(&self) -> Result<(&str, &str), ApiError> {
        match (
            self.url.as_deref().and_then(non_empty),
            self.format_id.as_deref().and_then(non_empty),
        ) {
            (Some(url), Some(format_id)) => Ok((url, format_id)),
            _ => Err(ApiError::bad_request(
                "missing params (url and format_id required)",
            )),
        }
    }
}

async fn download(
    State(state): State<AppState>,
    client: ClientAddr,
    headers: HeaderMap,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    guard(&state, &client, &headers, params.api_key.as_deref()).await?;

    let (url, format_id) = params.required()?;
    let request =
        ExtractionRequest::download(url, Some(format_id)).map_err(ApiError::bad_request)?;

    let job = state.orchestrator.run(request).await?;
    Ok(stream(job, state.stream_chunk_bytes).await?)
}

async fn convert_mp3(
    State(state): State<AppState>,
    client: ClientAddr,
    headers: HeaderMap,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    guard(&state, &client, &headers, params.api_key.as_deref()).await?;

    let (url, format_id) = params.required()?;
    let bitrate = match params.bitrate.as_deref().and_then(non_empty) {
        Some(value) => value.parse::<Bitrate>().map_err(ApiError::bad_request)?,
        None => DEFAULT_BITRATE,
    };
    let request = ExtractionRequest::convert(url, Some(format_id), bitrate)
        .map_err(ApiError::bad_request)?;

    let job = state.orchestrator.run(request).await?;
    Ok(stream(job, state.stream_chunk_bytes).await?)
}
