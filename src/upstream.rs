use crate::config::Settings;
use crate::request::CompletionRequest;
use axum::http::StatusCode;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::future::try_join_all;
use serde_json::{Map, Number, Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const DONE_SENTINEL: &str = "[DONE]";
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    /// `message.content` of the choice, absent when the upstream omitted it.
    pub text: Option<String>,
}

/// Merged outcome of one logical completion request.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    /// `None` when the upstream payload carried no `choices` array.
    pub choices: Option<Vec<Choice>>,
    pub usage: Option<Map<String, Value>>,
    pub raw: Value,
}

impl CompletionResult {
    fn from_raw(raw: Value) -> Self {
        let choices = raw.get("choices").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .map(|choice| Choice {
                    text: choice
                        .get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_str())
                        .map(|s| s.to_string()),
                })
                .collect()
        });
        let usage = raw.get("usage").and_then(|v| v.as_object()).cloned();
        Self {
            choices,
            usage,
            raw,
        }
    }

    /// All choice texts, or `None` if choices are missing or any is malformed.
    pub fn texts(&self) -> Option<Vec<String>> {
        self.choices
            .as_ref()?
            .iter()
            .map(|choice| choice.text.clone())
            .collect()
    }
}

/// Stream of text fragments relayed from a streaming upstream call.
pub type FragmentStream = ReceiverStream<Result<Bytes, UpstreamCallError>>;

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    settings: Arc<Settings>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, settings: Arc<Settings>) -> Self {
        Self { http, settings }
    }

    pub fn model_id(&self) -> &str {
        &self.settings.model_id
    }

    /// Runs `max(1, n)` single-completion calls concurrently and merges them
    /// in issue order. Any failing call fails the whole request.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResult, UpstreamCallError> {
        let payload = build_payload(&self.settings.model_id, req, false);
        let target_n = req.n.max(1) as usize;
        tracing::debug!(target_n, model = %self.settings.model_id, "fanning out completion");

        let responses = gather_all(target_n, |_| self.call_once(&payload)).await;
        let responses = match responses {
            Ok(v) => v,
            Err(err) => {
                metrics::counter!("chatrelay_upstream_calls_total", "outcome" => "failed")
                    .increment(1);
                tracing::warn!(kind = ?err.kind, status = ?err.status, "upstream call failed: {}", err.message);
                return Err(err);
            }
        };
        metrics::counter!("chatrelay_upstream_calls_total", "outcome" => "ok")
            .increment(target_n as u64);
        tracing::debug!(responses = responses.len(), "merging upstream responses");
        Ok(CompletionResult::from_raw(merge_responses(responses)))
    }

    /// Opens a single streaming call and relays `delta.content` fragments.
    ///
    /// Fails before yielding anything if the upstream rejects the request.
    pub async fn stream(&self, req: &CompletionRequest) -> Result<FragmentStream, UpstreamCallError> {
        let payload = build_payload(&self.settings.model_id, req, true);
        let resp = self.send(&payload, None).await?;

        let (tx, rx) = mpsc::channel::<Result<Bytes, UpstreamCallError>>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            relay_fragments(resp, tx).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn call_once(&self, payload: &Value) -> Result<Value, UpstreamCallError> {
        let timeout = Duration::from_millis(self.settings.request_timeout_ms);
        let resp = self.send(payload, Some(timeout)).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
        })?;
        serde_json::from_str(&text).map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
        })
    }

    async fn send(
        &self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let url = join_url(&self.settings.dmr_base_url, CHAT_COMPLETIONS_PATH);
        let mut req = self
            .http
            .post(url)
            .bearer_auth(&self.settings.dmr_api_key)
            .json(payload);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                format!("upstream status {}: {}", status, text),
            ));
        }
        Ok(resp)
    }
}

/// Launches `n` futures at once and waits for all of them.
///
/// Results come back in launch order. The first error is returned and the
/// remaining futures are dropped without their results being observed.
pub async fn gather_all<F, Fut, T, E>(n: usize, make: F) -> Result<Vec<T>, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    try_join_all((0..n).map(make)).await
}

/// Upstream request body for one call. `n` is always 1.
pub fn build_payload(model: &str, req: &CompletionRequest, stream: bool) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    let mut payload = json!({
        "model": model,
        "messages": messages,
        "seed": req.seed,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
        "top_p": req.top_p,
        "presence_penalty": req.presence_penalty,
        "frequency_penalty": req.frequency_penalty,
        "stop": req.stop,
        "n": 1,
        "stream": stream,
        "top_k": req.top_k,
        "min_p": req.min_p,
        "typical_p": req.typical_p,
        "tfs_z": req.tfs_z,
        "repeat_penalty": req.repeat_penalty,
        "repeat_last_n": req.repeat_last_n,
        "mirostat_mode": req.mirostat_mode,
        "mirostat_tau": req.mirostat_tau,
        "mirostat_eta": req.mirostat_eta,
    });
    if !stream {
        if let (Some(schema), Some(obj)) = (req.response_schema.as_ref(), payload.as_object_mut()) {
            obj.insert(
                "response_format".to_string(),
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": req.response_type,
                        "schema": schema,
                        "strict": true,
                    }
                }),
            );
        }
    }
    payload
}

/// Folds the per-call responses into one payload shaped like the first.
pub fn merge_responses(responses: Vec<Value>) -> Value {
    let mut iter = responses.into_iter();
    let Some(mut base) = iter.next() else {
        return json!({ "choices": [] });
    };
    let rest: Vec<Value> = iter.collect();
    if rest.is_empty() {
        return base;
    }

    let all = std::iter::once(&base).chain(rest.iter());
    let choices: Option<Vec<Value>> = all
        .map(|resp| resp.get("choices").and_then(|v| v.as_array()).cloned())
        .collect::<Option<Vec<Vec<Value>>>>()
        .map(|lists| lists.into_iter().flatten().collect());

    let all = std::iter::once(&base).chain(rest.iter());
    let usage = merge_usage(all.map(|resp| resp.get("usage")));

    if let Some(obj) = base.as_object_mut() {
        match choices {
            Some(choices) => {
                obj.insert("choices".to_string(), Value::Array(choices));
            }
            None => {
                obj.remove("choices");
            }
        }
        match usage {
            Some(usage) => {
                obj.insert("usage".to_string(), Value::Object(usage));
            }
            None => {
                obj.remove("usage");
            }
        }
    }
    base
}

/// Sums numeric usage counters over the union of keys.
///
/// Returns `None` unless every response carries a usage object. Non-numeric
/// fields are dropped.
pub fn merge_usage<'a, I>(usages: I) -> Option<Map<String, Value>>
where
    I: IntoIterator<Item = Option<&'a Value>>,
{
    let mut totals: Vec<(String, Sum)> = Vec::new();
    for usage in usages {
        let usage = usage?.as_object()?;
        for (key, value) in usage {
            let Value::Number(num) = value else { continue };
            match totals.iter_mut().find(|(k, _)| k == key) {
                Some((_, sum)) => sum.add(num),
                None => totals.push((key.clone(), Sum::from_number(num))),
            }
        }
    }
    Some(
        totals
            .into_iter()
            .filter_map(|(key, sum)| sum.into_value().map(|v| (key, v)))
            .collect(),
    )
}

#[derive(Debug, Clone, Copy)]
enum Sum {
    Int(i64),
    Float(f64),
}

impl Sum {
    fn from_number(num: &Number) -> Self {
        match num.as_i64() {
            Some(i) => Sum::Int(i),
            None => Sum::Float(num.as_f64().unwrap_or(0.0)),
        }
    }

    fn add(&mut self, num: &Number) {
        *self = match (*self, num.as_i64()) {
            (Sum::Int(acc), Some(i)) => match acc.checked_add(i) {
                Some(total) => Sum::Int(total),
                None => Sum::Float(acc as f64 + i as f64),
            },
            (Sum::Int(acc), None) => Sum::Float(acc as f64 + num.as_f64().unwrap_or(0.0)),
            (Sum::Float(acc), _) => Sum::Float(acc + num.as_f64().unwrap_or(0.0)),
        };
    }

    fn into_value(self) -> Option<Value> {
        match self {
            Sum::Int(i) => Some(Value::from(i)),
            Sum::Float(f) => Number::from_f64(f).map(Value::Number),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    Fragment(String),
    Empty,
    Done,
    Malformed,
}

/// Interprets the data field of one SSE event.
pub fn parse_frame(data: &str) -> Frame {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Frame::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Frame::Malformed;
    };
    if !value.is_object() {
        return Frame::Malformed;
    }
    match value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => Frame::Fragment(text.to_string()),
        _ => Frame::Empty,
    }
}

async fn relay_fragments(
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, UpstreamCallError>>,
) {
    let mut events = resp.bytes_stream().eventsource();
    let mut skipped: u64 = 0;
    loop {
        // A stalled upstream never yields, so the consumer hanging up must
        // end the read on its own.
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("stream consumer went away, closing upstream read");
                return;
            }
            next = events.next() => next,
        };
        let Some(ev) = next else { break };
        let ev = match ev {
            Ok(ev) => ev,
            Err(eventsource_stream::EventStreamError::Transport(err)) => {
                tracing::warn!("upstream stream interrupted: {err}");
                let _ = tx
                    .send(Err(UpstreamCallError::new(
                        UpstreamErrorKind::Network,
                        None,
                        err.to_string(),
                    )))
                    .await;
                return;
            }
            Err(err) => {
                skipped += 1;
                metrics::counter!("chatrelay_stream_frames_skipped_total").increment(1);
                tracing::debug!("skipping undecodable stream frame: {err}");
                continue;
            }
        };
        match parse_frame(&ev.data) {
            Frame::Done => break,
            Frame::Empty => {}
            Frame::Malformed => {
                skipped += 1;
                metrics::counter!("chatrelay_stream_frames_skipped_total").increment(1);
                tracing::debug!(data = %ev.data, "skipping malformed stream frame");
            }
            Frame::Fragment(text) => {
                if tx.send(Ok(Bytes::from(text))).await.is_err() {
                    tracing::debug!("stream consumer went away, closing upstream read");
                    return;
                }
            }
        }
    }
    if skipped > 0 {
        tracing::info!(skipped, "stream finished with skipped frames");
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ChatMessage, Role};

    fn request(n: u32) -> CompletionRequest {
        CompletionRequest::from_value(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "Hi"}
            ],
            "n": n,
            "seed": 7,
            "stop": ["###"],
            "stream": true
        }))
        .unwrap()
    }

    fn response(content: &str, usage: Option<Value>) -> Value {
        let mut v = json!({
            "id": "chatcmpl_test",
            "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        });
        if let Some(usage) = usage {
            v["usage"] = usage;
        }
        v
    }

    #[test]
    fn payload_forces_single_completion_and_copies_knobs() {
        let payload = build_payload("ai/test", &request(4), false);
        assert_eq!(payload["n"], 1);
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["model"], "ai/test");
        assert_eq!(payload["seed"], 7);
        assert_eq!(payload["stop"], json!(["###"]));
        assert_eq!(payload["top_k"], 40);
        assert_eq!(payload["tfs_z"], 1.0);
        assert_eq!(payload["mirostat_mode"], 0);
        assert_eq!(
            payload["messages"],
            json!([
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "Hi"}
            ])
        );
        assert!(payload.get("response_format").is_none());
    }

    #[test]
    fn payload_attaches_strict_schema_directive() {
        let mut req = request(1);
        req.messages.push(ChatMessage::new(Role::Assistant, "ok"));
        req.response_type = Some("recipe".to_string());
        req.response_schema = Some(json!({"type": "object"}));
        let payload = build_payload("m", &req, false);
        assert_eq!(
            payload["response_format"],
            json!({
                "type": "json_schema",
                "json_schema": {"name": "recipe", "schema": {"type": "object"}, "strict": true}
            })
        );
        let streaming = build_payload("m", &req, true);
        assert_eq!(streaming["stream"], true);
        assert!(streaming.get("response_format").is_none());
    }

    #[test]
    fn merge_concatenates_choices_in_order() {
        let merged = merge_responses(vec![
            response("a", None),
            response("b", None),
            response("c", None),
        ]);
        let result = CompletionResult::from_raw(merged);
        assert_eq!(
            result.texts(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(result.raw["id"], "chatcmpl_test");
    }

    #[test]
    fn merge_drops_choices_when_any_response_lacks_them() {
        let merged = merge_responses(vec![response("a", None), json!({"id": "x"})]);
        let result = CompletionResult::from_raw(merged);
        assert!(result.choices.is_none());
        assert!(result.texts().is_none());
    }

    #[test]
    fn usage_sums_over_union_of_keys() {
        let merged = merge_responses(vec![
            response(
                "a",
                Some(json!({"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8})),
            ),
            response(
                "b",
                Some(json!({"prompt_tokens": 3, "completion_tokens": 7, "total_tokens": 10, "cached_tokens": 2})),
            ),
        ]);
        assert_eq!(
            merged["usage"],
            json!({"prompt_tokens": 6, "completion_tokens": 12, "total_tokens": 18, "cached_tokens": 2})
        );
    }

    #[test]
    fn usage_omitted_when_any_response_lacks_it() {
        let merged = merge_responses(vec![
            response("a", Some(json!({"total_tokens": 8}))),
            response("b", None),
        ]);
        assert!(merged.get("usage").is_none());
    }

    #[test]
    fn usage_drops_non_numeric_fields_and_mixes_floats() {
        let usage = merge_usage([
            Some(&json!({"total_tokens": 1, "cost": 0.5, "details": {"x": 1}, "note": "a"})),
            Some(&json!({"total_tokens": 2, "cost": 1})),
        ])
        .unwrap();
        assert_eq!(usage.get("total_tokens"), Some(&json!(3)));
        assert_eq!(usage.get("cost"), Some(&json!(1.5)));
        assert!(usage.get("details").is_none());
        assert!(usage.get("note").is_none());
    }

    #[test]
    fn single_response_passes_through_unchanged() {
        let only = response("a", Some(json!({"total_tokens": 8, "note": "kept"})));
        assert_eq!(merge_responses(vec![only.clone()]), only);
    }

    #[test]
    fn frames_are_classified() {
        assert_eq!(parse_frame("[DONE]"), Frame::Done);
        assert_eq!(parse_frame(" [DONE] "), Frame::Done);
        assert_eq!(parse_frame("{not json"), Frame::Malformed);
        assert_eq!(parse_frame("42"), Frame::Malformed);
        assert_eq!(
            parse_frame(r#"{"choices":[{"delta":{"content":"Hello"}}]}"#),
            Frame::Fragment("Hello".to_string())
        );
        assert_eq!(
            parse_frame(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            Frame::Empty
        );
        assert_eq!(parse_frame(r#"{"choices":[]}"#), Frame::Empty);
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("http://h:1/engines/v1/", "/chat/completions"),
            "http://h:1/engines/v1/chat/completions"
        );
        assert_eq!(join_url("http://h:1", "chat/completions"), "http://h:1/chat/completions");
    }

    #[tokio::test]
    async fn gather_keeps_launch_order_not_completion_order() {
        let out: Result<Vec<usize>, String> = gather_all(4, |i| async move {
            tokio::time::sleep(Duration::from_millis(((4 - i) * 20) as u64)).await;
            Ok(i)
        })
        .await;
        assert_eq!(out.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn gather_runs_calls_concurrently() {
        // Every call waits for all the others, so only an overlapping run finishes.
        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let gathered = tokio::time::timeout(
            Duration::from_secs(2),
            gather_all(4, |i| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok::<usize, String>(i)
                }
            }),
        )
        .await
        .expect("calls did not overlap");
        assert_eq!(gathered.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn gather_fails_when_any_call_fails() {
        let out: Result<Vec<usize>, String> = gather_all(3, |i| async move {
            if i == 1 {
                Err(format!("call {i} failed"))
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(i)
            }
        })
        .await;
        assert_eq!(out.unwrap_err(), "call 1 failed");
    }
}
