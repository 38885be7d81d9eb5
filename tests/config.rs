use std::collections::HashMap;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

const REQUIRED: [(&str, &str); 3] = [
    ("DMR_BASE_URL", "http://localhost:12434/engines/v1"),
    ("DMR_API_KEY", "test-key"),
    ("MODEL_ID", "ai/test-model:latest"),
];

#[test]
fn required_settings_with_defaults() {
    let settings = chatrelay::config::Settings::from_lookup(lookup(&REQUIRED)).expect("settings");
    assert_eq!(settings.dmr_base_url, "http://localhost:12434/engines/v1");
    assert_eq!(settings.dmr_api_key, "test-key");
    assert_eq!(settings.model_id, "ai/test-model:latest");
    assert_eq!(settings.api_base_url, None);
    assert_eq!(settings.listen, "0.0.0.0:8000");
    assert_eq!(settings.metrics_path, "/metrics");
    assert_eq!(
        settings.request_timeout_ms,
        chatrelay::config::DEFAULT_REQUEST_TIMEOUT_MS
    );
}

#[test]
fn missing_model_id_is_reported_by_name() {
    let err = chatrelay::config::Settings::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
    assert_eq!(err.code, "config_missing");
    assert_eq!(err.param.as_deref(), Some("MODEL_ID"));
}

#[test]
fn blank_values_count_as_missing() {
    let mut pairs = REQUIRED.to_vec();
    pairs[1] = ("DMR_API_KEY", "   ");
    let err = chatrelay::config::Settings::from_lookup(lookup(&pairs)).unwrap_err();
    assert_eq!(err.param.as_deref(), Some("DMR_API_KEY"));
}

#[test]
fn optional_settings_override_defaults() {
    let mut pairs = REQUIRED.to_vec();
    pairs.push(("API_BASE_URL", "https://chat.example.org"));
    pairs.push(("CHATRELAY_LISTEN", "127.0.0.1:9000"));
    pairs.push(("CHATRELAY_REQUEST_TIMEOUT_MS", "1500"));
    let settings = chatrelay::config::Settings::from_lookup(lookup(&pairs)).expect("settings");
    assert_eq!(settings.api_base_url.as_deref(), Some("https://chat.example.org"));
    assert_eq!(settings.listen, "127.0.0.1:9000");
    assert_eq!(settings.request_timeout_ms, 1500);
}

#[test]
fn invalid_timeout_is_rejected() {
    let mut pairs = REQUIRED.to_vec();
    pairs.push(("CHATRELAY_REQUEST_TIMEOUT_MS", "soon"));
    let err = chatrelay::config::Settings::from_lookup(lookup(&pairs)).unwrap_err();
    assert_eq!(err.code, "config_invalid");
}
