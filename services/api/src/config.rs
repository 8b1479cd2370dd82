//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// REST endpoint and bearer token of one vector index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorIndexConfig {
    pub url: String,
    pub token: String,
}

/// Where jobs go. Without an event key they run on the in-process queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRunnerConfig {
    pub event_key: Option<String>,
    pub base_url: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: String,
    pub chat_model: String,
    pub vector_index: VectorIndexConfig,
    pub resource_index: VectorIndexConfig,
    pub jobs: JobRunnerConfig,
    pub jobs_secret: Option<String>,
    pub cors_origin: String,
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Server and database ---
        let bind_address_str =
            optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:4000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = required("DATABASE_URL")?;

        let log_level_str = optional("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Model ---
        let openai_api_key = required("OPENAI_API_KEY")?;
        let chat_model = optional("CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        // --- Vector indexes ---
        let vector_index = VectorIndexConfig {
            url: required("VECTOR_REST_URL")?,
            token: required("VECTOR_REST_TOKEN")?,
        };
        let resource_index = match (
            optional("RESOURCE_VECTOR_REST_URL"),
            optional("RESOURCE_VECTOR_REST_TOKEN"),
        ) {
            (Some(url), Some(token)) => VectorIndexConfig { url, token },
            (None, None) => vector_index.clone(),
            _ => {
                return Err(ConfigError::InvalidValue(
                    "RESOURCE_VECTOR_REST_URL".to_string(),
                    "RESOURCE_VECTOR_REST_URL and RESOURCE_VECTOR_REST_TOKEN must be set together"
                        .to_string(),
                ))
            }
        };

        // --- Jobs and HTTP ---
        let jobs = JobRunnerConfig {
            event_key: optional("INNGEST_EVENT_KEY"),
            base_url: optional("INNGEST_BASE_URL")
                .unwrap_or_else(|| "https://inn.gs".to_string()),
        };
        let jobs_secret = optional("JOBS_SECRET");
        let cors_origin = optional("CORS_ORIGIN").unwrap_or_else(|| "*".to_string());

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            chat_model,
            vector_index,
            resource_index,
            jobs,
            jobs_secret,
            cors_origin,
        })
    }
}
