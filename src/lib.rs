//! # Interview Analyzer
//!
//! Client-side orchestration for an audio analysis backend, plus a small
//! relay proxy. One analysis cycle uploads an audio file, watches live
//! progress over a server-push WebSocket channel, and resolves to the final
//! analysis and transcription delivered by the terminal HTTP response.
//!
//! ## Module Map:
//! - **session**: session id generation (the correlation key for both legs)
//! - **progress**: stage vocabulary, event decoding, latest-state reduction
//! - **channel**: the WebSocket progress channel client and its lifecycle
//! - **backend**: the terminal `POST /analyze` request behind a trait seam
//! - **orchestrator**: one-cycle-at-a-time driver reconciling both legs
//! - **relay**: the HTTP proxy in front of the real backend
//! - **config**: TOML + environment configuration
//! - **error**: the cycle and relay error taxonomies

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod relay;
pub mod session;

pub use backend::{AnalysisBackend, AnalysisResult, HttpAnalysisBackend};
pub use channel::{ChannelHandle, ChannelState};
pub use config::AppConfig;
pub use error::{AnalysisError, RelayError};
pub use orchestrator::{Orchestrator, ProgressConnector, WsProgressConnector};
pub use progress::{ProgressEvent, ProgressState, StageTag};
pub use session::SessionId;
