use crate::error::{AppError, AppResult};
use axum::http::StatusCode;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Process-wide settings, read once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Settings {
    pub dmr_base_url: String,
    pub dmr_api_key: String,
    pub model_id: String,
    /// Public-facing base URL the UI is served under, if any.
    pub api_base_url: Option<String>,
    pub listen: String,
    pub metrics_path: String,
    pub request_timeout_ms: u64,
}

impl Settings {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "config_missing",
                    format!("missing required setting {key}"),
                )
                .with_param(key)
            })
        };

        let dmr_base_url = require("DMR_BASE_URL")?;
        let dmr_api_key = require("DMR_API_KEY")?;
        let model_id = require("MODEL_ID")?;
        let request_timeout_ms = match get("CHATRELAY_REQUEST_TIMEOUT_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| {
                    AppError::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "config_invalid",
                        format!("CHATRELAY_REQUEST_TIMEOUT_MS must be a positive integer, got {raw:?}"),
                    )
                    .with_param("CHATRELAY_REQUEST_TIMEOUT_MS")
                })?,
            None => DEFAULT_REQUEST_TIMEOUT_MS,
        };

        Ok(Self {
            dmr_base_url: dmr_base_url.trim().to_string(),
            dmr_api_key,
            model_id,
            api_base_url: get("API_BASE_URL"),
            listen: get("CHATRELAY_LISTEN").unwrap_or_else(default_listen),
            metrics_path: get("CHATRELAY_METRICS_PATH").unwrap_or_else(default_metrics_path),
            request_timeout_ms,
        })
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
