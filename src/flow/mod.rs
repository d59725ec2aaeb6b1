pub mod payload;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::{FlowConfig, FlowTarget};

const ERROR_BODY_MAX_CHARS: usize = 256;

#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("flow returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("flow request failed: {0}")]
    Transport(String),
    #[error("flow response is not valid JSON: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<Value, InvocationError>;
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, InvocationError>;
}

#[derive(Debug, Clone)]
pub struct LangflowClient {
    http: Client,
    url: String,
    api_key: Option<String>,
    input_type: String,
    output_type: String,
    input_component: String,
    tweaks: Map<String, Value>,
}

impl LangflowClient {
    pub fn new(flow: &FlowConfig, target: &FlowTarget) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(Duration::from_millis(flow.timeout_ms.max(1_000)))
            .build()
            .map_err(|err| format!("failed building flow http client: {err}"))?;
        Ok(Self {
            http,
            url: target.url.trim().to_owned(),
            api_key: flow
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToOwned::to_owned),
            input_type: flow.input_type.clone(),
            output_type: flow.output_type.clone(),
            input_component: target.input_component.clone(),
            tweaks: target.tweaks.clone(),
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut tweaks = self.tweaks.clone();
        let input = tweaks
            .entry(self.input_component.clone())
            .or_insert_with(|| json!({}));
        match input {
            Value::Object(fields) => {
                fields.insert("input_value".to_owned(), Value::String(prompt.to_owned()));
            }
            other => *other = json!({ "input_value": prompt }),
        }
        json!({
            "input_type": self.input_type,
            "output_type": self.output_type,
            "tweaks": tweaks,
        })
    }
}

#[async_trait]
impl FlowEngine for LangflowClient {
    async fn invoke(&self, prompt: &str) -> Result<Value, InvocationError> {
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.header("x-api-key", api_key);
        }
        let response = request
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|err| InvocationError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| InvocationError::Transport(format!("body read failed: {err}")))?;
        if !status.is_success() {
            return Err(InvocationError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        debug!("flow {} answered with {} bytes", self.url, body.len());
        serde_json::from_str(&body).map_err(|err| InvocationError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl ImageFetcher for LangflowClient {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, InvocationError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| InvocationError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(InvocationError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| InvocationError::Transport(format!("image read failed: {err}")))?;
        Ok(bytes.to_vec())
    }
}

pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_owned();
    }
    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{truncate_chars, InvocationError, LangflowClient};
    use crate::config::Config;

    #[test]
    fn request_body_places_prompt_on_input_component_and_keeps_extra_tweaks() {
        let mut cfg = Config::default();
        cfg.flow.url = "http://127.0.0.1:7860/api/v1/run/chat".to_owned();
        cfg.flow.tweaks.insert(
            "Agent-Xxy8r".to_owned(),
            json!({"model_name": "gpt-4o-mini", "temperature": 0.1}),
        );
        let target = cfg.flow.chat_target();
        let client = LangflowClient::new(&cfg.flow, &target).expect("client");
        let body = client.request_body("xin chào");
        assert_eq!(
            body.pointer("/tweaks/TextInput-xpmxA/input_value")
                .and_then(Value::as_str),
            Some("xin chào")
        );
        assert_eq!(
            body.pointer("/tweaks/Agent-Xxy8r/model_name")
                .and_then(Value::as_str),
            Some("gpt-4o-mini")
        );
        assert_eq!(body.get("output_type").and_then(Value::as_str), Some("chat"));
        assert_eq!(body.get("input_type").and_then(Value::as_str), Some("text"));
    }

    #[test]
    fn request_body_merges_into_existing_input_component_tweak() {
        let mut cfg = Config::default();
        cfg.flow.url = "http://127.0.0.1:7860/api/v1/run/chat".to_owned();
        cfg.flow.tweaks.insert(
            "TextInput-xpmxA".to_owned(),
            json!({"input_value": "stale", "sender": "User"}),
        );
        let target = cfg.flow.chat_target();
        let client = LangflowClient::new(&cfg.flow, &target).expect("client");
        let body = client.request_body("fresh");
        assert_eq!(
            body.pointer("/tweaks/TextInput-xpmxA"),
            Some(&json!({"input_value": "fresh", "sender": "User"}))
        );
    }

    #[test]
    fn invocation_errors_render_their_cause() {
        let status = InvocationError::Status {
            status: 502,
            body: "bad gateway".to_owned(),
        };
        assert_eq!(status.to_string(), "flow returned status 502: bad gateway");
        assert_eq!(
            InvocationError::Malformed("expected value".to_owned()).to_string(),
            "flow response is not valid JSON: expected value"
        );
    }

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("đường", 10), "đường");
        assert_eq!(truncate_chars("đường dài", 4), "đườ…");
    }
}
