//! Server configuration.

use serde::{Deserialize, Serialize};

use agora_core::{Error, Result};

/// CORS configuration for browser-based access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (development only).
    /// Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            // Secure-by-default: CORS disabled until origins are configured.
            allowed_origins: Vec::new(),
            max_age_seconds: 3600,
        }
    }
}

/// Configuration for the Agora API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Path to the `SQLite` database file. Unset uses an in-memory database,
    /// which is only allowed in debug mode.
    #[serde(default)]
    pub database_path: Option<String>,

    /// Directory holding one capability schema document per capability.
    pub schema_dir: String,

    /// Public base URL used to build worker callback URLs.
    pub public_base_url: String,

    /// Enable debug mode (pretty logs, in-memory database allowed).
    pub debug: bool,

    /// Maximum background jobs executing at once.
    pub runner_concurrency: usize,

    /// Background queue poll interval in milliseconds.
    pub runner_poll_interval_ms: u64,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            database_path: None,
            schema_dir: "schemas".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            debug: false,
            runner_concurrency: 10,
            runner_poll_interval_ms: 250,
            cors: CorsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `AGORA_HTTP_PORT`
    /// - `AGORA_DATABASE_PATH`
    /// - `AGORA_SCHEMA_DIR`
    /// - `AGORA_PUBLIC_BASE_URL`
    /// - `AGORA_DEBUG`
    /// - `AGORA_RUNNER_CONCURRENCY`
    /// - `AGORA_RUNNER_POLL_INTERVAL_MS`
    /// - `AGORA_CORS_ALLOWED_ORIGINS` (comma-separated, or `*`)
    /// - `AGORA_CORS_MAX_AGE_SECONDS`
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("AGORA_HTTP_PORT")? {
            config.http_port = port;
        }
        config.database_path = env_string("AGORA_DATABASE_PATH");
        if let Some(dir) = env_string("AGORA_SCHEMA_DIR") {
            config.schema_dir = dir;
        }
        if let Some(url) = env_string("AGORA_PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(debug) = env_bool("AGORA_DEBUG")? {
            config.debug = debug;
        }
        if let Some(concurrency) = env_usize("AGORA_RUNNER_CONCURRENCY")? {
            if concurrency == 0 {
                return Err(Error::InvalidInput(
                    "AGORA_RUNNER_CONCURRENCY must be greater than 0".to_string(),
                ));
            }
            config.runner_concurrency = concurrency;
        }
        if let Some(interval) = env_u64("AGORA_RUNNER_POLL_INTERVAL_MS")? {
            config.runner_poll_interval_ms = interval;
        }
        if let Some(origins) = env_string("AGORA_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("AGORA_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        Ok(config)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
