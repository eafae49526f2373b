//! Pipeline configuration from environment variables

use std::env;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    /// Logical user owning settings and alerts
    pub user_id: String,

    /// Detection service endpoint
    pub detection_url: String,

    /// API key sent to the detection service
    pub detection_api_key: Option<String>,

    /// Source reference handed to the detector (video path or camera id)
    pub source_ref: String,

    /// Minimum detector confidence
    pub detection_confidence: f64,

    /// Rating (tariff quote) service endpoint
    pub rating_url: String,

    /// Per-request timeout for both gateways, seconds
    pub gateway_timeout_secs: u64,

    /// Minimum offset gap between processed triggers
    pub min_trigger_spacing: f64,

    /// Playback ticker interval in milliseconds
    pub trigger_interval_ms: u64,

    /// Duplicate filter tolerance
    pub duplicate_tolerance: f64,

    /// How many persisted deltas the duplicate filter sees
    pub history_limit: usize,

    /// Master enable flag for pipeline
    pub enabled: bool,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `METERFLOW_DB_PATH` (default: meterflow.db)
    /// - `METERFLOW_SCHEMA_DIR` (default: sql)
    /// - `METERFLOW_USER_ID` (default: admin)
    /// - `DETECTION_URL` (default: http://127.0.0.1:9001/detect)
    /// - `DETECTION_API_KEY` (default: unset)
    /// - `DETECTION_SOURCE` (default: static/sample.mp4)
    /// - `DETECTION_CONFIDENCE` (default: 0.05)
    /// - `RATING_URL` (default: http://127.0.0.1:9002/quote)
    /// - `GATEWAY_TIMEOUT_SECS` (default: 10)
    /// - `TRIGGER_MIN_SPACING` (default: 4.5)
    /// - `TRIGGER_INTERVAL_MS` (default: 1000)
    /// - `DUPLICATE_TOLERANCE` (default: 0.1)
    /// - `HISTORY_LIMIT` (default: 10)
    /// - `ENABLE_PIPELINE` (default: false)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("METERFLOW_DB_PATH").unwrap_or_else(|_| "meterflow.db".to_string()),

            schema_dir: env::var("METERFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            user_id: env::var("METERFLOW_USER_ID").unwrap_or_else(|_| "admin".to_string()),

            detection_url: env::var("DETECTION_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9001/detect".to_string()),

            detection_api_key: env::var("DETECTION_API_KEY").ok().filter(|s| !s.is_empty()),

            source_ref: env::var("DETECTION_SOURCE")
                .unwrap_or_else(|_| "static/sample.mp4".to_string()),

            detection_confidence: parse_or("DETECTION_CONFIDENCE", 0.05),

            rating_url: env::var("RATING_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9002/quote".to_string()),

            gateway_timeout_secs: parse_or("GATEWAY_TIMEOUT_SECS", 10),

            min_trigger_spacing: parse_or("TRIGGER_MIN_SPACING", 4.5),

            trigger_interval_ms: parse_or("TRIGGER_INTERVAL_MS", 1_000),

            duplicate_tolerance: parse_or("DUPLICATE_TOLERANCE", 0.1),

            history_limit: parse_or("HISTORY_LIMIT", 10),

            enabled: parse_or("ENABLE_PIPELINE", false),
        }
    }

    /// Reject values that would make the pipeline misbehave silently
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [("DETECTION_URL", &self.detection_url), ("RATING_URL", &self.rating_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }
        if self.min_trigger_spacing < 0.0 {
            return Err(ConfigError::InvalidValue(
                "TRIGGER_MIN_SPACING must not be negative".to_string(),
            ));
        }
        if self.duplicate_tolerance <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "DUPLICATE_TOLERANCE must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Validate a user-supplied daily cost limit
///
/// Non-numeric and non-positive values are rejected; the caller keeps
/// whatever limit was active before.
pub fn parse_daily_limit(raw: &str) -> Result<f64, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue("No cost limit provided".to_string()));
    }
    let limit: f64 = trimmed
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("Invalid cost limit value: {}", trimmed)))?;
    if !limit.is_finite() || limit <= 0.0 {
        return Err(ConfigError::InvalidValue(
            "Please enter a valid cost limit greater than 0".to_string(),
        ));
    }
    Ok(limit)
}
