//! HTTP surface of the conversion service.
//!
//! - `GET /convert?file=<path>` converts a file already on the server.
//! - `POST /convert` converts the multipart upload in field `datafile`.
//! - `GET /version` reports the conversion tool version.
//! - `GET /health` reports pool statistics.

use axum::{
    body::{Body, Bytes},
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, OriginalUri, Query, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::cleanup::CleanupGuard;
use crate::config::ServiceConfig;
use crate::error::{self, ErrorFormat, ErrorPayload, ErrorResponder, ServiceError, FILE_PARAM, FORM_FIELD_DATAFILE};
use crate::invoker::{ConversionInvoker, ConversionResult};
use crate::naming;
use crate::pool::{ConverterPool, PoolStats};
use crate::request::{ConversionRequest, RequestSource};
use crate::staging::{StagingArea, StagingLimits};
use crate::telemetry;

const FILENAME_HEADER: HeaderName = HeaderName::from_static("filename");

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    staging: Arc<StagingArea>,
    invoker: ConversionInvoker,
    output_dir: Arc<PathBuf>,
    max_request_bytes: usize,
}

impl AppState {
    /// Creates the staging and output directories if needed.
    pub fn new(config: &ServiceConfig, pool: ConverterPool) -> io::Result<Self> {
        Self::with_dirs(
            pool,
            config.staging_dir.clone(),
            config.staging_limits(),
            config.output_dir.clone(),
            config.borrow_timeout,
            config.max_request_bytes,
        )
    }

    pub fn with_dirs(
        pool: ConverterPool,
        staging_dir: PathBuf,
        limits: StagingLimits,
        output_dir: PathBuf,
        borrow_timeout: Option<std::time::Duration>,
        max_request_bytes: usize,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&output_dir)?;
        let staging = StagingArea::new(staging_dir, limits)?;
        Ok(Self {
            staging: Arc::new(staging),
            invoker: ConversionInvoker::new(pool, output_dir.clone(), borrow_timeout),
            output_dir: Arc::new(output_dir),
            max_request_bytes,
        })
    }

    pub fn pool(&self) -> &ConverterPool {
        self.invoker.pool()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/convert", get(convert_local).post(convert_upload))
        .route("/version", get(version))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(state.max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConvertQuery {
    file: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    pool: PoolStats,
}

/// GET /convert?file=<path>
async fn convert_local(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    query: Option<Query<ConvertQuery>>,
) -> Response {
    let responder = ErrorResponder::new(uri.to_string(), ErrorFormat::negotiate(&headers));
    let mut request = ConversionRequest::new(RequestSource::Local);
    let mut guard = CleanupGuard::new(state.output_dir.as_path());

    let file = query.and_then(|Query(q)| q.file);
    let result = match file.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        None => Err(ServiceError::MissingParameter(FILE_PARAM)),
        Some(file) => convert_existing(&state, file, &mut guard, &mut request).await,
    };

    respond(request, guard, result, &responder).await
}

async fn convert_existing(
    state: &AppState,
    file: &str,
    guard: &mut CleanupGuard,
    request: &mut ConversionRequest,
) -> Result<ConversionResult, ServiceError> {
    let is_file = tokio::fs::metadata(file)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(ServiceError::FileNotFound(file.to_string()));
    }

    let staged = state.staging.resolve_local(file);
    guard.record(&staged);
    request.mark_staged(&staged);

    request.start_converting();
    state.invoker.convert(&staged).await
}

/// POST /convert (multipart, field `datafile`)
async fn convert_upload(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let responder = ErrorResponder::new(uri.to_string(), ErrorFormat::negotiate(&headers));
    let mut request = ConversionRequest::new(RequestSource::Upload);
    let mut guard = CleanupGuard::new(state.output_dir.as_path());

    let result = match multipart {
        Ok(multipart) => convert_multipart(&state, multipart, &mut guard, &mut request).await,
        Err(rejection) => {
            tracing::debug!("Multipart rejected: {}", rejection);
            Err(ServiceError::MissingMultipart)
        }
    };

    respond(request, guard, result, &responder).await
}

async fn convert_multipart(
    state: &AppState,
    mut multipart: Multipart,
    guard: &mut CleanupGuard,
    request: &mut ConversionRequest,
) -> Result<ConversionResult, ServiceError> {
    let staged = loop {
        let field = match multipart.next_field().await.map_err(multipart_error)? {
            Some(field) => field,
            None => return Err(ServiceError::EmptyUpload),
        };

        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(|f| naming::base_name(f).to_string());
        if name != FORM_FIELD_DATAFILE {
            if file_name.is_none() {
                tracing::debug!("Skipping form field '{}'", name);
                continue;
            }
            return Err(ServiceError::WrongFieldName);
        }

        let original_name = file_name.unwrap_or_default();

        let over_limit = AtomicBool::new(false);
        let chunks = field.map(|chunk| {
            chunk.map_err(|e| {
                if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    over_limit.store(true, Ordering::Relaxed);
                }
                e
            })
        });

        match state.staging.stage(chunks, &original_name).await {
            Ok(staged) => break staged,
            Err(_) if over_limit.load(Ordering::Relaxed) => return Err(ServiceError::UploadTooLarge),
            Err(e) => return Err(e.into()),
        }
    };

    guard.record(&staged);
    request.mark_staged(&staged);

    request.start_converting();
    state.invoker.convert(&staged).await
}

fn multipart_error(err: MultipartError) -> ServiceError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::UploadTooLarge
    } else {
        ServiceError::MalformedUpload(err.body_text())
    }
}

/// Finishes a conversion request: records telemetry and hands the guard to
/// the response body, or lets it clean up now on failure.
async fn respond(
    mut request: ConversionRequest,
    guard: CleanupGuard,
    result: Result<ConversionResult, ServiceError>,
    responder: &ErrorResponder,
) -> Response {
    let outcome = match result {
        Ok(artifact) => artifact_response(artifact, guard).await,
        Err(e) => Err(e),
    };

    let response = match outcome {
        Ok(response) => {
            request.mark_complete();
            response
        }
        Err(e) => {
            request.mark_failed(e.to_string());
            responder.respond(&e)
        }
    };
    telemetry::record_conversion_telemetry(&request);
    response
}

async fn artifact_response(artifact: ConversionResult, guard: CleanupGuard) -> Result<Response, ServiceError> {
    let unavailable = |e: io::Error| {
        ServiceError::OutputUnavailable(format!("{}: {}", artifact.output_file.display(), e))
    };
    let file = File::open(&artifact.output_file).await.map_err(unavailable)?;
    let length = file.metadata().await.map_err(unavailable)?.len();

    let download_name = header_safe(&artifact.download_name);
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", download_name))
        .map_err(|e| ServiceError::Unexpected(e.to_string()))?;
    let filename = HeaderValue::from_str(&download_name).map_err(|e| ServiceError::Unexpected(e.to_string()))?;

    let body = Body::from_stream(GuardedStream {
        inner: ReaderStream::new(file),
        _guard: guard,
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (header::CONTENT_LENGTH, HeaderValue::from(length)),
            (header::CONTENT_DISPOSITION, disposition),
            (FILENAME_HEADER, filename),
        ],
        body,
    )
        .into_response())
}

/// Replaces characters that cannot appear in a quoted header parameter.
fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect()
}

/// Response body stream that owns the request's cleanup guard, so cleanup
/// runs once the body has been sent or dropped.
struct GuardedStream {
    inner: ReaderStream<File>,
    _guard: CleanupGuard,
}

impl Stream for GuardedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// GET /version
async fn version(State(state): State<AppState>, OriginalUri(uri): OriginalUri, headers: HeaderMap) -> Response {
    match state.invoker.version().await {
        Ok(version) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{}\n", version),
        )
            .into_response(),
        Err(e) => ErrorResponder::new(uri.to_string(), ErrorFormat::negotiate(&headers)).respond(&e),
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        pool: state.pool().stats(),
    })
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!("Request handler panicked: {}", detail);

    let err = ServiceError::Unexpected(detail);
    let payload = ErrorPayload::new(err.status_code(), err.public_message(), "unknown");
    error::render(&payload, ErrorFormat::default())
}
