//! # Analysis Backend Adapter
//!
//! The terminal request: one multipart POST carrying the audio file and the
//! session id, answered (eventually) by the final analysis payload. The
//! orchestrator talks to the [`AnalysisBackend`] trait so tests can drive it
//! without a network; [`HttpAnalysisBackend`] is the real implementation.

use crate::error::AnalysisError;
use crate::session::SessionId;

use async_trait::async_trait;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// MIME types the backend accepts, keyed by file extension.
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "audio/mp4"),
    ("m4a", "audio/m4a"),
];

/// The final analysis payload, delivered once and atomically by the terminal
/// request (never through the progress channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// AI analysis of the transcribed interview.
    pub analysis: String,
    /// Complete transcription text.
    pub full_transcription: String,
}

/// Seam between the orchestrator and the analysis endpoint.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Submit one file under one session id and await the terminal response.
    async fn submit(
        &self,
        file_path: &Path,
        session_id: &SessionId,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Resolve the MIME type for a file from its extension, rejecting anything
/// outside the accepted audio set before any bytes are read.
pub fn allowed_mime_for(path: &Path) -> Result<&'static str, AnalysisError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .ok_or_else(|| AnalysisError::UnsupportedFileType("unknown".to_string()))?;

    ALLOWED_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
        .ok_or(AnalysisError::UnsupportedFileType(extension))
}

/// Real backend adapter speaking multipart HTTP to `POST /analyze`.
pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    base_url: String,
    max_file_size_bytes: u64,
}

impl HttpAnalysisBackend {
    pub fn new(base_url: String, max_file_size_bytes: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            max_file_size_bytes,
        }
    }

    /// Preflight checks that must fail before any network activity: the file
    /// exists, its type is accepted, and it is under the soft size limit.
    async fn preflight(&self, path: &Path) -> Result<&'static str, AnalysisError> {
        let mime = allowed_mime_for(path)?;

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| AnalysisError::NoFileSelected)?;

        if metadata.len() > self.max_file_size_bytes {
            return Err(AnalysisError::FileTooLarge {
                size_bytes: metadata.len(),
                limit_bytes: self.max_file_size_bytes,
            });
        }

        Ok(mime)
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn submit(
        &self,
        file_path: &Path,
        session_id: &SessionId,
    ) -> Result<AnalysisResult, AnalysisError> {
        let mime = self.preflight(file_path).await?;

        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|err| AnalysisError::Transport(format!("Failed to read file: {}", err)))?;

        info!(
            "Submitting {} ({} bytes) for analysis, session {}",
            file_name,
            bytes.len(),
            session_id
        );

        let file_part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|err| AnalysisError::Transport(err.to_string()))?;

        let form = multipart::Form::new()
            .part("audio_file", file_part)
            .text("session_id", session_id.to_string());

        let response = self
            .client
            .post(format!("{}/analyze", self.base_url.trim_end_matches('/')))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        debug!("Terminal request returned {}", status);

        if status.is_success() {
            response.json::<AnalysisResult>().await.map_err(|err| {
                AnalysisError::Transport(format!("Invalid analysis response: {}", err))
            })
        } else {
            // Surface the status and body text verbatim; the backend's own
            // words are the most useful thing we can show the user.
            let body = response.text().await.unwrap_or_default();
            Err(AnalysisError::AnalysisFailed {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_allowed_mime_for_known_extensions() {
        assert_eq!(allowed_mime_for(Path::new("interview.mp3")).unwrap(), "audio/mpeg");
        assert_eq!(allowed_mime_for(Path::new("call.WAV")).unwrap(), "audio/wav");
        assert_eq!(allowed_mime_for(Path::new("meeting.m4a")).unwrap(), "audio/m4a");
        assert_eq!(allowed_mime_for(Path::new("video.mp4")).unwrap(), "audio/mp4");
    }

    #[test]
    fn test_unsupported_extensions_are_rejected() {
        assert!(matches!(
            allowed_mime_for(Path::new("notes.txt")),
            Err(AnalysisError::UnsupportedFileType(ext)) if ext == "txt"
        ));
        assert!(matches!(
            allowed_mime_for(Path::new("no_extension")),
            Err(AnalysisError::UnsupportedFileType(_))
        ));
    }

    #[tokio::test]
    async fn test_preflight_rejects_missing_file() {
        let backend = HttpAnalysisBackend::new("http://localhost:8000".into(), 1024);
        let err = backend
            .preflight(Path::new("/nonexistent/interview.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::NoFileSelected));
    }

    #[tokio::test]
    async fn test_preflight_rejects_oversized_file() {
        let mut file = tempfile::Builder::new().suffix(".mp3").tempfile().unwrap();
        file.write_all(&[0u8; 64]).unwrap();

        let backend = HttpAnalysisBackend::new("http://localhost:8000".into(), 16);
        let err = backend.preflight(file.path()).await.unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::FileTooLarge { size_bytes: 64, limit_bytes: 16 }
        ));
    }

    #[test]
    fn test_analysis_result_parses_backend_response() {
        // The backend sends extra fields (success, segment data); only the
        // two we display matter.
        let json = r#"{
            "success": true,
            "analysis": "key insights",
            "transcription": {"segments": []},
            "full_transcription": "hello world"
        }"#;
        let result: AnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.analysis, "key insights");
        assert_eq!(result.full_transcription, "hello world");
    }
}
