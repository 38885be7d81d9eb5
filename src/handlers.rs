use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::request::{ChatMessage, CompletionRequest, Role};
use crate::structured::{self, MISSING_CHOICES_MESSAGE};
use crate::upstream::{CompletionResult, UpstreamCallError};
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "model": state.settings.model_id }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Plain chat. One choice comes back as a bare string, several as
/// `{answers, raw}` so the UI can let the user pick.
pub async fn chat(State(state): State<AppState>, Json(body): Json<Value>) -> AppResult<Response> {
    let req = parse_chat_request(body)?;
    let result = state
        .upstream
        .complete(&req)
        .await
        .map_err(upstream_error_to_app)?;
    let texts = chat_texts(&result)?;
    if texts.len() == 1 {
        let answer = texts.into_iter().next().unwrap_or_default();
        return Ok(Json(Value::String(answer)).into_response());
    }
    Ok(Json(json!({ "answers": texts, "raw": result.raw })).into_response())
}

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let req = parse_chat_request(body)?;
    let fragments = state
        .upstream
        .stream(&req)
        .await
        .map_err(upstream_error_to_app)?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())
        .body(Body::from_stream(fragments))
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_build_failed",
                err.to_string(),
            )
        })
}

/// Runs a registered structured task and validates each choice on its own.
pub async fn structured(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let mut req = CompletionRequest::from_value(body)?;
    let registered = req
        .response_type
        .as_deref()
        .and_then(|name| state.structured.lookup(name))
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "unknown_response_type",
                "Unknown response_type",
            )
            .with_param("response_type")
        })?;
    req.validate()?;

    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    messages.push(ChatMessage::new(Role::System, registered.system_message()));
    messages.append(&mut req.messages);
    req.messages = messages;
    req.response_schema = Some(registered.schema.clone());
    req.stream = false;

    let result = state
        .upstream
        .complete(&req)
        .await
        .map_err(upstream_error_to_app)?;

    let Some(choices) = result.choices.as_ref() else {
        tracing::warn!(response_type = registered.kind.name(), "{}", MISSING_CHOICES_MESSAGE);
        return Ok(Json(structured::missing_choices_record(&result.raw)).into_response());
    };
    let outcomes: Vec<Value> = choices
        .iter()
        .map(|choice| {
            structured::choice_outcome(registered.kind, choice.text.as_deref()).unwrap_or_else(
                |record| {
                    metrics::counter!(
                        "chatrelay_structured_choice_failures_total",
                        "response_type" => registered.kind.name()
                    )
                    .increment(1);
                    record
                },
            )
        })
        .collect();
    Ok(Json(Value::Array(outcomes)).into_response())
}

fn parse_chat_request(body: Value) -> AppResult<CompletionRequest> {
    let req = CompletionRequest::from_value(body)?.without_structured_output();
    req.validate()?;
    Ok(req)
}

fn chat_texts(result: &CompletionResult) -> AppResult<Vec<String>> {
    match result.texts() {
        Some(texts) if !texts.is_empty() => Ok(texts),
        _ => {
            tracing::warn!("{}", MISSING_CHOICES_MESSAGE);
            Err(AppError::bad_gateway(
                "upstream_contract_violation",
                MISSING_CHOICES_MESSAGE,
            ))
        }
    }
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    AppError::bad_gateway("upstream_error", err.message)
}
