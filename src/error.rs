//! Failure taxonomy and error responses.
//!
//! Every failure is classified close to where it happens into a
//! [`ServiceError`]; status codes are assigned here and nowhere else.

use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::converter::ConversionError;
use crate::pool::PoolError;
use crate::staging::StagingError;

/// Form field that must carry the uploaded file.
pub const FORM_FIELD_DATAFILE: &str = "datafile";

/// Query parameter naming a local file.
pub const FILE_PARAM: &str = "file";

/// Broad failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    CallerInput,
    ResourceExhaustion,
    ToolFailure,
    UnexpectedFault,
}

/// Service-wide error type.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Missing parameter: [{0}]")]
    MissingParameter(&'static str),

    #[error("Missing Multipart Form Data.")]
    MissingMultipart,

    #[error("The request did not have the correct name attribute of \"datafile\" in the form processing. Processing halted.")]
    WrongFieldName,

    #[error("Missing File Data.")]
    EmptyUpload,

    #[error("Upload exceeds the maximum allowed size.")]
    UploadTooLarge,

    #[error("Malformed multipart request: {0}")]
    MalformedUpload(String),

    #[error("File not sent with request: {0}")]
    FileNotFound(String),

    #[error("PdfaConverter could not handle this request: {0}")]
    UnsupportedInputType(String),

    #[error("No converter became available within {} ms; retry later.", .0.as_millis())]
    PoolExhausted(Duration),

    #[error("Converter could not be constructed: {0}")]
    ConstructionFailed(String),

    #[error("PdfaConverter failed unexpectedly: {0}")]
    ToolExecutionFailed(String),

    #[error("PdfaConverter produced no output: {0}")]
    OutputUnavailable(String),

    #[error("Getting PdfaConverter version failed: {0}")]
    VersionUnavailable(String),

    #[error("Unexpected server error: {0}")]
    Unexpected(String),
}

impl ServiceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::MissingParameter(_)
            | ServiceError::MissingMultipart
            | ServiceError::WrongFieldName
            | ServiceError::EmptyUpload
            | ServiceError::UploadTooLarge
            | ServiceError::MalformedUpload(_)
            | ServiceError::FileNotFound(_)
            | ServiceError::UnsupportedInputType(_) => ErrorCategory::CallerInput,
            ServiceError::PoolExhausted(_) => ErrorCategory::ResourceExhaustion,
            ServiceError::ConstructionFailed(_)
            | ServiceError::ToolExecutionFailed(_)
            | ServiceError::OutputUnavailable(_)
            | ServiceError::VersionUnavailable(_) => ErrorCategory::ToolFailure,
            ServiceError::Unexpected(_) => ErrorCategory::UnexpectedFault,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match (self, self.category()) {
            (ServiceError::UploadTooLarge, _) => StatusCode::PAYLOAD_TOO_LARGE,
            (_, ErrorCategory::CallerInput) => StatusCode::BAD_REQUEST,
            (_, ErrorCategory::ResourceExhaustion) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorCategory::ToolFailure) | (_, ErrorCategory::UnexpectedFault) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show the caller. Tool and internal details stay in
    /// the server log.
    pub fn public_message(&self) -> String {
        match self.category() {
            ErrorCategory::CallerInput | ErrorCategory::ResourceExhaustion => self.to_string(),
            ErrorCategory::ToolFailure => match self {
                ServiceError::VersionUnavailable(_) => "Getting PdfaConverter version failed.".to_string(),
                _ => "PdfaConverter failed unexpectedly.".to_string(),
            },
            ErrorCategory::UnexpectedFault => "There was an unexpected server error.".to_string(),
        }
    }
}

impl From<PoolError> for ServiceError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { waited } => ServiceError::PoolExhausted(waited),
            PoolError::ConstructionFailed(msg) => ServiceError::ConstructionFailed(msg),
            PoolError::Closed => ServiceError::Unexpected("converter pool is closed".to_string()),
        }
    }
}

impl From<ConversionError> for ServiceError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::UnknownFileType(msg) => ServiceError::UnsupportedInputType(msg),
            ConversionError::ExternalTool(msg) => ServiceError::ToolExecutionFailed(msg),
            ConversionError::GeneratedFileUnavailable(msg) => ServiceError::OutputUnavailable(msg),
        }
    }
}

impl From<StagingError> for ServiceError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::Empty => ServiceError::EmptyUpload,
            StagingError::TooLarge { .. } => ServiceError::UploadTooLarge,
            StagingError::Read(msg) => ServiceError::MalformedUpload(msg),
            StagingError::Io(e) => ServiceError::Unexpected(format!("staging failed: {}", e)),
        }
    }
}

/// Structured error body sent to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename = "error", rename_all = "camelCase")]
pub struct ErrorPayload {
    pub status_code: u16,
    pub reason_phrase: String,
    pub message: String,
    pub request_context: String,
}

impl ErrorPayload {
    pub fn new(status: StatusCode, message: impl Into<String>, request_context: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            reason_phrase: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: message.into(),
            request_context: request_context.into(),
        }
    }

    pub fn from_error(err: &ServiceError, request_context: impl Into<String>) -> Self {
        Self::new(err.status_code(), err.public_message(), request_context)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ErrorPayload [statusCode={}, reasonPhrase={}, message={}, requestContext={}]",
            self.status_code, self.reason_phrase, self.message, self.request_context
        )
    }
}

/// Serialization chosen for error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFormat {
    #[default]
    Xml,
    Json,
}

impl ErrorFormat {
    /// Picks JSON when the `Accept` header asks for it, XML otherwise.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let wants_json = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("application/json") || v.contains("+json"));
        if wants_json {
            ErrorFormat::Json
        } else {
            ErrorFormat::Xml
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            ErrorFormat::Xml => "text/xml",
            ErrorFormat::Json => "application/json",
        }
    }
}

/// Builds error responses for one request.
#[derive(Debug, Clone)]
pub struct ErrorResponder {
    request_context: String,
    format: ErrorFormat,
}

impl ErrorResponder {
    pub fn new(request_context: impl Into<String>, format: ErrorFormat) -> Self {
        Self {
            request_context: request_context.into(),
            format,
        }
    }

    /// Logs `err` with full detail and turns it into a response.
    pub fn respond(&self, err: &ServiceError) -> Response {
        match err.category() {
            ErrorCategory::CallerInput => tracing::warn!(
                status = err.status_code().as_u16(),
                context = %self.request_context,
                "Rejected request: {}", err
            ),
            _ => tracing::error!(
                status = err.status_code().as_u16(),
                context = %self.request_context,
                "Request failed: {}", err
            ),
        }
        render(&ErrorPayload::from_error(err, self.request_context.clone()), self.format)
    }
}

/// Serializes `payload`, falling back to its plain-text form when
/// structured serialization fails.
pub fn render(payload: &ErrorPayload, format: ErrorFormat) -> Response {
    let (content_type, body) = match serialize(payload, format) {
        Ok(body) => (format.content_type(), body),
        Err(e) => {
            tracing::warn!("Error payload serialization failed, sending plain text: {}", e);
            ("text/plain", payload.to_string())
        }
    };

    let status = StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        body,
    )
        .into_response()
}

fn serialize(payload: &ErrorPayload, format: ErrorFormat) -> Result<String, String> {
    match format {
        ErrorFormat::Xml => quick_xml::se::to_string(payload).map_err(|e| e.to_string()),
        ErrorFormat::Json => serde_json::to_string(payload).map_err(|e| e.to_string()),
    }
}
