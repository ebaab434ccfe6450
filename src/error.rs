//! # Error Handling
//!
//! Two error enums cover the two halves of this crate:
//!
//! - [`AnalysisError`] — everything that can end a client-side analysis cycle.
//!   Exactly one of these (or one `AnalysisResult`) is surfaced per cycle.
//! - [`RelayError`] — failures in the relay proxy, converted to HTTP responses
//!   via `ResponseError`.
//!
//! ## Fatal vs non-fatal:
//! `ChannelUnavailable` is the one deliberately non-fatal variant: a cycle
//! that cannot open its progress channel continues in degraded mode (no live
//! progress) and still expects a final result. Malformed progress frames are
//! not modeled here at all — they are logged and dropped inside the channel
//! client and never influence a cycle's outcome.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors that can terminate (or, for `ChannelUnavailable`, degrade) one
/// upload/analysis cycle.
#[derive(Debug)]
pub enum AnalysisError {
    /// Precondition failure: no file was selected. No network call is made.
    NoFileSelected,

    /// The file's type is not in the accepted audio set. Rejected before the
    /// upload starts.
    UnsupportedFileType(String),

    /// The file exceeds the client-side size limit. Rejected before the
    /// upload starts.
    FileTooLarge { size_bytes: u64, limit_bytes: u64 },

    /// The progress channel could not be established or dropped mid-cycle.
    /// Non-fatal: the cycle continues without live progress.
    ChannelUnavailable(String),

    /// The terminal request returned a failure status. The backend's message
    /// is carried verbatim for display.
    AnalysisFailed { status: u16, message: String },

    /// Network-level failure of the terminal request.
    Transport(String),

    /// This cycle was superseded by a newer one before its terminal result
    /// arrived; the stale result is discarded.
    Superseded,
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::NoFileSelected => write!(f, "No audio file selected"),
            AnalysisError::UnsupportedFileType(kind) => {
                write!(f, "Unsupported file type: {}", kind)
            }
            AnalysisError::FileTooLarge { size_bytes, limit_bytes } => write!(
                f,
                "File size {} bytes exceeds the {} byte limit",
                size_bytes, limit_bytes
            ),
            AnalysisError::ChannelUnavailable(reason) => {
                write!(f, "Progress channel unavailable: {}", reason)
            }
            AnalysisError::AnalysisFailed { status, message } => {
                write!(f, "Analysis failed: {} - {}", status, message)
            }
            AnalysisError::Transport(reason) => write!(f, "Transport error: {}", reason),
            AnalysisError::Superseded => write!(f, "Analysis superseded by a newer request"),
        }
    }
}

impl std::error::Error for AnalysisError {}

impl AnalysisError {
    /// Whether this error ends the cycle. Only the channel failing is
    /// survivable; everything else terminates the current attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AnalysisError::ChannelUnavailable(_))
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        AnalysisError::Transport(err.to_string())
    }
}

/// Errors produced by the relay proxy while accepting, validating, or
/// forwarding an upload.
#[derive(Debug)]
pub enum RelayError {
    /// Malformed multipart payload or missing required field.
    BadRequest(String),

    /// The uploaded MIME type is not in the accepted audio set.
    UnsupportedMediaType(String),

    /// The upload exceeds the relay's size limit.
    PayloadTooLarge { limit_bytes: u64 },

    /// The real backend could not be reached.
    UpstreamUnreachable(String),

    /// Something failed on the relay itself (temp file I/O, etc.).
    Internal(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            RelayError::UnsupportedMediaType(kind) => {
                write!(f, "Unsupported file type: {}", kind)
            }
            RelayError::PayloadTooLarge { limit_bytes } => {
                write!(f, "Upload exceeds the {} byte limit", limit_bytes)
            }
            RelayError::UpstreamUnreachable(msg) => {
                write!(f, "Backend unreachable: {}", msg)
            }
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Convert relay errors into the JSON error body the original API speaks:
/// `{"error": {"type": ..., "message": ..., "timestamp": ...}}`.
impl ResponseError for RelayError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UnsupportedMediaType(_) => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            RelayError::BadRequest(msg) => ("bad_request", msg.clone()),
            RelayError::UnsupportedMediaType(kind) => (
                "unsupported_media_type",
                format!("Unsupported file type: {}", kind),
            ),
            RelayError::PayloadTooLarge { limit_bytes } => (
                "payload_too_large",
                format!("Upload exceeds the {} byte limit", limit_bytes),
            ),
            RelayError::UpstreamUnreachable(msg) => ("upstream_unreachable", msg.clone()),
            RelayError::Internal(msg) => ("internal_error", msg.clone()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Internal(format!("I/O error: {}", err))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::UpstreamUnreachable(err.to_string())
    }
}
