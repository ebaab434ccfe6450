//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-platform variables (BACKEND_URL, HOST, PORT)
//! 2. Environment variables (APP_BACKEND_BASE_URL, APP_RELAY_PORT, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub upload: UploadConfig,
    pub channel: ChannelConfig,
    pub relay: RelayConfig,
}

/// Where the real analysis backend lives.
///
/// ## Fields:
/// - `base_url`: HTTP endpoint hosting `POST /analyze`
/// - `ws_base_url`: WebSocket endpoint hosting `/ws/{session_id}`; empty
///   string means "derive from base_url by swapping the scheme"
/// - `connect_timeout_secs`: timeout for establishing the progress channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub ws_base_url: String,
    pub connect_timeout_secs: u64,
}

impl BackendConfig {
    /// WebSocket base URL, derived from the HTTP URL when not set explicitly.
    pub fn effective_ws_base_url(&self) -> String {
        if !self.ws_base_url.is_empty() {
            return self.ws_base_url.clone();
        }
        self.base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

/// Client-side upload limits.
///
/// The 1 GiB default is a soft limit: the backend enforces the same bound,
/// this check just fails fast before any bytes leave the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_file_size_mb: u64,
}

/// Progress channel tuning.
///
/// `settle_delay_ms` is the grace period between observing the final
/// `(completed, 100)` frame and tearing the channel down, so the last frame
/// has a chance to render. It is a design constant more than a knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub settle_delay_ms: u64,
}

/// Relay proxy settings.
///
/// The relay accepts the same multipart contract as the backend but enforces
/// a tighter 200 MiB limit because it spools uploads to local disk first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub max_file_size_mb: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: "http://localhost:8000".to_string(),
                ws_base_url: String::new(),
                connect_timeout_secs: 5,
            },
            upload: UploadConfig {
                max_file_size_mb: 1024, // 1 GiB soft limit, matches the backend
            },
            channel: ChannelConfig {
                settle_delay_ms: 1000, // let the final frame render before teardown
            },
            relay: RelayConfig {
                host: "127.0.0.1".to_string(),
                port: 3001,
                max_file_size_mb: 200, // relay spools to disk, keep it tighter
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_BACKEND_BASE_URL=http://analysis.internal:8000`
    /// - `APP_RELAY_PORT=8080`
    /// - `BACKEND_URL=...`: special case honored for parity with the web client
    /// - `HOST` / `PORT`: special cases for deployment platforms (bind address
    ///   of the relay)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("_")
                    .try_parsing(true),
            );

        // Deployment-platform variables that don't follow the APP_ prefix.
        if let Ok(url) = env::var("BACKEND_URL") {
            settings = settings.set_override("backend.base_url", url)?;
        }

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("relay.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("relay.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.is_empty() {
            return Err(anyhow::anyhow!("Backend base URL cannot be empty"));
        }

        if self.relay.port == 0 {
            return Err(anyhow::anyhow!("Relay port cannot be 0"));
        }

        if self.upload.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("Upload size limit must be greater than 0"));
        }

        if self.relay.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("Relay size limit must be greater than 0"));
        }

        Ok(())
    }

    /// Client-side upload limit in bytes.
    pub fn upload_limit_bytes(&self) -> u64 {
        self.upload.max_file_size_mb * 1024 * 1024
    }

    /// Relay upload limit in bytes.
    pub fn relay_limit_bytes(&self) -> u64 {
        self.relay.max_file_size_mb * 1024 * 1024
    }
}
