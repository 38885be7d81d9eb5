use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::structured::StructuredRegistry;
use crate::upstream::UpstreamClient;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub upstream: UpstreamClient,
    pub structured: Arc<StructuredRegistry>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub fn load_state() -> AppResult<AppState> {
    load_state_with_settings(Settings::from_env()?)
}

pub fn load_state_with_settings(settings: Settings) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatrelay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let metrics = init_metrics()?;
    let settings = Arc::new(settings);
    let structured = Arc::new(StructuredRegistry::new());
    tracing::debug!(types = ?structured.names(), "structured output types registered");

    Ok(AppState {
        upstream: UpstreamClient::new(http, settings.clone()),
        settings,
        structured,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.settings.metrics_path.clone();
    Router::<AppState>::new()
        .route("/chat", post(crate::handlers::chat))
        .route("/chat/stream", post(crate::handlers::chat_stream))
        .route("/structured", post(crate::handlers::structured))
        .route("/healthz", get(crate::handlers::healthz))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}
