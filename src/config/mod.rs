//! Configuration module for the Stagecraft backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A configuration value that could not be parsed.
#[derive(Debug)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.key, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for API authentication (required in production)
    pub api_psk: Option<String>,
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Base URL of the HTTP content service; bindings degrade when unset
    pub content_source_url: Option<String>,
    /// Upper bound for a single content fetch during a build
    pub content_timeout: Duration,
    /// Prefix used when assigning `liveUrl` to promoted deployments
    pub public_base_url: String,
}

const KEY_BIND_ADDR: &str = "STAGECRAFT_BIND_ADDR";
const KEY_LOG_FORMAT: &str = "STAGECRAFT_LOG_FORMAT";
const KEY_CONTENT_TIMEOUT: &str = "STAGECRAFT_CONTENT_TIMEOUT_MS";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_psk = env::var("STAGECRAFT_API_PSK")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let db_path = env::var("STAGECRAFT_DB_PATH")
            .unwrap_or_else(|_| "./data/stagecraft.sqlite".to_string())
            .into();

        let raw_addr = env::var(KEY_BIND_ADDR).unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let bind_addr = raw_addr.parse().map_err(|e: std::net::AddrParseError| ConfigError {
            key: KEY_BIND_ADDR,
            value: raw_addr.clone(),
            reason: e.to_string(),
        })?;

        let log_level = env::var("STAGECRAFT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let raw_format = env::var(KEY_LOG_FORMAT).unwrap_or_else(|_| "pretty".to_string());
        let log_format = LogFormat::from_str(&raw_format).ok_or_else(|| ConfigError {
            key: KEY_LOG_FORMAT,
            value: raw_format.clone(),
            reason: "expected `pretty` or `json`".to_string(),
        })?;

        let content_source_url = env::var("STAGECRAFT_CONTENT_SOURCE_URL")
            .ok()
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let raw_timeout = env::var(KEY_CONTENT_TIMEOUT).unwrap_or_else(|_| "3000".to_string());
        let timeout_ms: u64 = raw_timeout.parse().map_err(|e: std::num::ParseIntError| {
            ConfigError {
                key: KEY_CONTENT_TIMEOUT,
                value: raw_timeout.clone(),
                reason: e.to_string(),
            }
        })?;

        let public_base_url = env::var("STAGECRAFT_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/render".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            api_psk,
            db_path,
            bind_addr,
            log_level,
            log_format,
            content_source_url,
            content_timeout: Duration::from_millis(timeout_ms),
            public_base_url,
        })
    }
}
