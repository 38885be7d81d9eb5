use crate::error::{AppError, AppResult};
use crate::structured::StructuredKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A chat completion request as accepted from the UI.
///
/// Decoding parameters mirror the llama.cpp knobs exposed by Docker Model
/// Runner; every field has a default so the UI may send only `messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub response_schema: Option<Value>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_min_p")]
    pub min_p: f64,
    #[serde(default = "default_one")]
    pub typical_p: f64,
    #[serde(default = "default_one", alias = "tail_free_sampling")]
    pub tfs_z: f64,
    #[serde(default = "default_one")]
    pub repeat_penalty: f64,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i64,
    #[serde(default)]
    pub mirostat_mode: u8,
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f64,
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f64,
}

pub const MAX_COMPLETIONS: u32 = 10;

impl CompletionRequest {
    /// Decodes a raw JSON body, reporting serde failures as invalid requests.
    pub fn from_value(body: Value) -> AppResult<Self> {
        serde_json::from_value(body).map_err(|err| AppError::invalid_request(err.to_string()))
    }

    pub fn validate(&self) -> AppResult<()> {
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        check_range("min_p", self.min_p, 0.0, 1.0)?;
        check_range("typical_p", self.typical_p, 0.0, 1.0)?;
        check_range("tfs_z", self.tfs_z, 0.0, 1.0)?;
        check_min("repeat_penalty", self.repeat_penalty, 0.0)?;
        check_min("mirostat_tau", self.mirostat_tau, 0.0)?;
        check_min("mirostat_eta", self.mirostat_eta, 0.0)?;

        if !(32..=2048).contains(&self.max_tokens) {
            return Err(out_of_range("max_tokens", "between 32 and 2048"));
        }
        if !(1..=MAX_COMPLETIONS).contains(&self.n) {
            return Err(out_of_range("n", "between 1 and 10"));
        }
        if self.top_k < 0 {
            return Err(out_of_range("top_k", "at least 0"));
        }
        if self.repeat_last_n < -1 {
            return Err(out_of_range("repeat_last_n", "at least -1"));
        }
        if self.mirostat_mode > 2 {
            return Err(out_of_range("mirostat_mode", "between 0 and 2"));
        }

        if self.response_schema.is_some() {
            let registered = self
                .response_type
                .as_deref()
                .is_some_and(|name| StructuredKind::from_name(name).is_some());
            if !registered {
                return Err(AppError::invalid_request(
                    "response_schema requires a registered response_type",
                )
                .with_param("response_schema"));
            }
        }
        Ok(())
    }

    /// Copy with structured-output fields removed.
    pub fn without_structured_output(&self) -> Self {
        Self {
            response_type: None,
            response_schema: None,
            ..self.clone()
        }
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> AppResult<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(out_of_range(field, &format!("between {min} and {max}")))
    }
}

fn check_min(field: &str, value: f64, min: f64) -> AppResult<()> {
    if value.is_finite() && value >= min {
        Ok(())
    } else {
        Err(out_of_range(field, &format!("at least {min}")))
    }
}

fn out_of_range(field: &str, expected: &str) -> AppError {
    AppError::invalid_request(format!("{field} must be {expected}")).with_param(field)
}

fn default_temperature() -> f64 {
    0.8
}

fn default_max_tokens() -> u32 {
    512
}

fn default_top_p() -> f64 {
    0.95
}

fn default_n() -> u32 {
    1
}

fn default_top_k() -> i64 {
    40
}

fn default_min_p() -> f64 {
    0.05
}

fn default_one() -> f64 {
    1.0
}

fn default_repeat_last_n() -> i64 {
    64
}

fn default_mirostat_tau() -> f64 {
    5.0
}

fn default_mirostat_eta() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> CompletionRequest {
        CompletionRequest::from_value(body).expect("request should decode")
    }

    #[test]
    fn defaults_fill_unspecified_fields() {
        let req = parse(json!({"messages": [{"role": "user", "content": "Hi"}]}));
        assert_eq!(req.n, 1);
        assert_eq!(req.max_tokens, 512);
        assert_eq!(req.top_k, 40);
        assert_eq!(req.repeat_last_n, 64);
        assert!(!req.stream);
        assert!(req.stop.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn tail_free_sampling_is_accepted_as_alias() {
        let req = parse(json!({
            "messages": [],
            "tail_free_sampling": 0.5
        }));
        assert_eq!(req.tfs_z, 0.5);
    }

    #[test]
    fn unknown_role_fails_to_decode() {
        let err = CompletionRequest::from_value(json!({
            "messages": [{"role": "tool", "content": "x"}]
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_request");
    }

    #[test]
    fn out_of_range_values_are_rejected_not_clamped() {
        let cases = [
            json!({"messages": [], "temperature": 2.5}),
            json!({"messages": [], "n": 0}),
            json!({"messages": [], "n": 11}),
            json!({"messages": [], "max_tokens": 16}),
            json!({"messages": [], "presence_penalty": -3.0}),
            json!({"messages": [], "repeat_last_n": -2}),
            json!({"messages": [], "mirostat_mode": 3}),
        ];
        let params = [
            "temperature",
            "n",
            "n",
            "max_tokens",
            "presence_penalty",
            "repeat_last_n",
            "mirostat_mode",
        ];
        for (body, param) in cases.into_iter().zip(params) {
            let err = parse(body).validate().unwrap_err();
            assert_eq!(err.param.as_deref(), Some(param));
        }
    }

    #[test]
    fn schema_without_registered_type_is_rejected() {
        let req = parse(json!({
            "messages": [],
            "response_type": "haiku",
            "response_schema": {"type": "object"}
        }));
        let err = req.validate().unwrap_err();
        assert_eq!(err.param.as_deref(), Some("response_schema"));

        let req = parse(json!({
            "messages": [],
            "response_type": "recipe",
            "response_schema": {"type": "object"}
        }));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn without_structured_output_keeps_decoding_parameters() {
        let req = parse(json!({
            "messages": [{"role": "user", "content": "Hi"}],
            "response_type": "recipe",
            "response_schema": {"type": "object"},
            "temperature": 0.3
        }));
        let clean = req.without_structured_output();
        assert!(clean.response_type.is_none());
        assert!(clean.response_schema.is_none());
        assert_eq!(clean.temperature, 0.3);
        assert_eq!(clean.messages, req.messages);
    }
}
