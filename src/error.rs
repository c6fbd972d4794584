use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaincheckError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Controller API rate limited (resets {})", format_reset(.reset_at))]
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        remaining: Option<i64>,
    },

    #[error("Invalid target {ids:?}: [{code}] {message}")]
    InvalidTarget {
        ids: Vec<String>,
        code: String,
        message: String,
    },

    #[error("Controller request failed: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

fn format_reset(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(at) => at.to_rfc3339(),
        None => "at an unknown time".to_string(),
    }
}

impl RaincheckError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RaincheckError::RateLimited { .. })
    }

    pub fn is_invalid_target(&self) -> bool {
        matches!(self, RaincheckError::InvalidTarget { .. })
    }

    /// Reset time carried by a rate-limit error, if known.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RaincheckError::RateLimited { reset_at, .. } => *reset_at,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RaincheckError>;
