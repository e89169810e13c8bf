//! Per-request conversion record and state transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::staging::StagedInput;

/// How the input reached the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    /// Multipart upload (`POST /convert`).
    Upload,
    /// File already on the server (`GET /convert?file=`).
    Local,
}

impl fmt::Display for RequestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestSource::Upload => write!(f, "upload"),
            RequestSource::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Received,
    Staged,
    Converting,
    Complete,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Received => write!(f, "received"),
            RequestStatus::Staged => write!(f, "staged"),
            RequestStatus::Converting => write!(f, "converting"),
            RequestStatus::Complete => write!(f, "complete"),
            RequestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One conversion request from arrival to response.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionRequest {
    pub request_id: String,
    pub source: RequestSource,
    pub original_name: Option<String>,
    pub correlation_key: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ConversionRequest {
    pub fn new(source: RequestSource) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            source,
            original_name: None,
            correlation_key: None,
            status: RequestStatus::Received,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn mark_staged(&mut self, staged: &StagedInput) {
        self.original_name = Some(staged.original_name.clone());
        self.correlation_key = Some(staged.correlation_key.clone());
        self.status = RequestStatus::Staged;
        self.updated_at = Utc::now();
    }

    pub fn start_converting(&mut self) {
        self.status = RequestStatus::Converting;
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self) {
        self.status = RequestStatus::Complete;
        self.updated_at = Utc::now();
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = RequestStatus::Failed;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, RequestStatus::Complete | RequestStatus::Failed)
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.is_finished() {
            Some(self.updated_at.signed_duration_since(self.created_at).num_milliseconds())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::InputOrigin;
    use std::path::PathBuf;

    fn staged() -> StagedInput {
        StagedInput {
            correlation_key: "upload_q1".to_string(),
            stored_path: PathBuf::from("/tmp/upload_q1.tmp-memo.doc"),
            original_name: "memo.doc".to_string(),
            origin: InputOrigin::Uploaded,
        }
    }

    #[test]
    fn test_new_request_defaults() {
        let request = ConversionRequest::new(RequestSource::Upload);

        assert_eq!(request.status, RequestStatus::Received);
        assert!(request.correlation_key.is_none());
        assert!(request.error.is_none());
        assert!(request.processing_duration_ms().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let mut request = ConversionRequest::new(RequestSource::Upload);

        request.mark_staged(&staged());
        assert_eq!(request.status, RequestStatus::Staged);
        assert_eq!(request.correlation_key.as_deref(), Some("upload_q1"));
        assert_eq!(request.original_name.as_deref(), Some("memo.doc"));

        request.start_converting();
        assert_eq!(request.status, RequestStatus::Converting);
        assert!(request.processing_duration_ms().is_none());

        request.mark_complete();
        assert_eq!(request.status, RequestStatus::Complete);
        assert!(request.processing_duration_ms().is_some());
    }

    #[test]
    fn test_failure_records_error() {
        let mut request = ConversionRequest::new(RequestSource::Local);
        request.mark_failed("tool crashed".to_string());

        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.error.as_deref(), Some("tool crashed"));
        assert!(request.is_finished());
        assert_eq!(request.source.to_string(), "local");
    }
}
