//! # Relay Proxy
//!
//! A thin HTTP front in front of the real analysis backend. It accepts the
//! same multipart contract (`audio_file` + `session_id`), spools the upload
//! to a temp file, and forwards it upstream, relaying the backend's status
//! and JSON body verbatim. Browser clients talk to the relay; the relay
//! enforces its own tighter size limit because the spool lands on local disk.
//!
//! ## Endpoints:
//! - `POST /analyze` — validate, spool, forward
//! - `GET /health` — liveness plus uptime
//!
//! Temp file cleanup is guaranteed by RAII: the spool is a `NamedTempFile`
//! that is removed when the handler returns, on success and on every error
//! path alike.

use crate::backend::allowed_mime_for;
use crate::config::AppConfig;
use crate::error::RelayError;

use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{web, App, HttpResponse, HttpServer};
use futures_util::StreamExt;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_actix_web::TracingLogger;

/// Shared relay state: where to forward, how much to accept, and when we
/// started (for the health endpoint).
pub struct RelayState {
    pub forward_url: String,
    pub limit_bytes: u64,
    pub client: reqwest::Client,
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            forward_url: format!("{}/analyze", config.backend.base_url.trim_end_matches('/')),
            limit_bytes: config.relay_limit_bytes(),
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }
}

/// One spooled upload: the temp file plus what we learned about it.
struct SpooledUpload {
    file: tempfile::NamedTempFile,
    file_name: String,
    mime: &'static str,
    size_bytes: u64,
}

/// Liveness endpoint.
async fn health(state: web::Data<RelayState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs()
    }))
}

/// `POST /analyze`: accept the multipart upload, spool it, forward it, and
/// hand the backend's answer back unchanged.
async fn analyze(
    mut payload: Multipart,
    state: web::Data<RelayState>,
) -> Result<HttpResponse, RelayError> {
    let mut upload: Option<SpooledUpload> = None;
    let mut session_id: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| RelayError::BadRequest(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| RelayError::BadRequest("Missing content disposition".to_string()))?;

        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| RelayError::BadRequest("Missing field name".to_string()))?
            .to_string();

        match field_name.as_str() {
            "audio_file" => {
                let file_name = content_disposition
                    .get_filename()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "audio".to_string());

                // Type check before a single byte hits the disk.
                let mime = allowed_mime_for(Path::new(&file_name)).map_err(|_| {
                    RelayError::UnsupportedMediaType(file_name.clone())
                })?;

                let mut spool = tempfile::NamedTempFile::new()?;
                let mut size_bytes: u64 = 0;

                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| RelayError::BadRequest(format!("Chunk error: {}", e)))?;

                    size_bytes += chunk.len() as u64;
                    if size_bytes > state.limit_bytes {
                        warn!(
                            "Rejecting oversized upload {} ({} bytes so far)",
                            file_name, size_bytes
                        );
                        return Err(RelayError::PayloadTooLarge {
                            limit_bytes: state.limit_bytes,
                        });
                    }

                    spool.write_all(&chunk)?;
                }

                upload = Some(SpooledUpload {
                    file: spool,
                    file_name,
                    mime,
                    size_bytes,
                });
            }
            "session_id" => {
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| RelayError::BadRequest(format!("Chunk error: {}", e)))?;
                    bytes.extend_from_slice(&chunk);
                }
                session_id = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            other => {
                debug!("Ignoring unexpected multipart field: {}", other);
            }
        }
    }

    let upload = upload
        .ok_or_else(|| RelayError::BadRequest("No audio file provided".to_string()))?;
    let session_id = session_id
        .ok_or_else(|| RelayError::BadRequest("Missing session_id field".to_string()))?;

    info!(
        "Forwarding {} ({} bytes) for session {}",
        upload.file_name, upload.size_bytes, session_id
    );

    let bytes = tokio::fs::read(upload.file.path())
        .await
        .map_err(RelayError::from)?;

    let file_part = reqwest::multipart::Part::bytes(bytes)
        .file_name(upload.file_name.clone())
        .mime_str(upload.mime)
        .map_err(|e| RelayError::Internal(e.to_string()))?;

    let form = reqwest::multipart::Form::new()
        .part("audio_file", file_part)
        .text("session_id", session_id);

    let response = state
        .client
        .post(&state.forward_url)
        .multipart(form)
        .send()
        .await?;

    // Relay the backend's verdict untouched: same status, same JSON body.
    let status = actix_web::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let body = response.text().await.unwrap_or_default();

    debug!("Backend answered {} ({} bytes)", status, body.len());

    Ok(HttpResponse::build(status)
        .content_type("application/json")
        .body(body))
}

/// Route table, shared by the real server and the tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/analyze", web::post().to(analyze))
        .route("/health", web::get().to(health));
}

/// Run the relay until the process is stopped.
pub async fn run_relay(config: AppConfig) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.relay.host, config.relay.port);
    let state = web::Data::new(RelayState::new(&config));

    info!(
        "Starting relay on {} (forwarding to {})",
        bind_addr, state.forward_url
    );

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(configure)
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    Ok(())
}
