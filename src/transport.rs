//! Abstract HTTP transport for chat-completion probes.
//!
//! The orchestrator and monitor talk to an endpoint only through
//! [`ChatTransport`], which keeps them testable without a network. The
//! production implementation is a thin reqwest wrapper.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

use crate::error::ProbeError;

/// Fixed seed sent with `gpt-*`/`chatgpt-*` probes so repeated runs are
/// reproducible. A compatibility requirement of the target APIs.
pub const DETERMINISTIC_SEED: u64 = 331;

/// Models whose requests must carry the deterministic seed (case-sensitive
/// prefix match).
static SEEDED_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(gpt-|chatgpt-)").expect("invalid seeded-model pattern"));

/// Build the chat-completion request body for one probe.
pub fn build_chat_body(model: &str, prompt: &str, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
    });
    if stream {
        body["stream"] = json!(true);
    }
    if SEEDED_MODEL.is_match(model) {
        body["seed"] = json!(DETERMINISTIC_SEED);
    }
    body
}

/// Strip trailing slashes so path joins stay clean.
pub fn trim_endpoint(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub status: u16,
    /// Parsed body, when the body was valid JSON
    pub json: Option<Value>,
    /// Raw body text, kept for error reporting when JSON parsing fails
    pub text: String,
}

impl ChatResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Best-effort error message from a failed response body.
    pub fn error_message(&self) -> String {
        if let Some(json) = &self.json {
            if let Some(message) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
            {
                return message.to_string();
            }
            return json.to_string();
        }
        if self.text.is_empty() {
            "unable to parse response body".to_string()
        } else {
            self.text.clone()
        }
    }
}

/// An open streaming response: status line plus the raw byte-chunk stream.
pub struct ChatStream {
    pub status: u16,
    pub chunks: BoxStream<'static, Result<Bytes, ProbeError>>,
}

/// HTTP transport used by probes. Implementations suspend only at network
/// I/O; cancellation is driven by the caller's timeout.
pub trait ChatTransport: Send + Sync {
    /// POST a non-streaming chat completion.
    fn complete(
        &self,
        endpoint: &str,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> impl Future<Output = Result<ChatResponse, ProbeError>> + Send;

    /// POST a streaming chat completion and hand back the byte stream.
    fn stream(
        &self,
        endpoint: &str,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> impl Future<Output = Result<ChatStream, ProbeError>> + Send;
}

/// Production transport backed by a pooled reqwest client.
///
/// No client-level timeout is set: timeouts are per-probe policy applied by
/// the orchestrator.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Share the underlying client, e.g. with the remote-collaborator calls.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn completions_url(endpoint: &str) -> String {
        format!("{}/v1/chat/completions", trim_endpoint(endpoint))
    }

    async fn post_chat(
        &self,
        endpoint: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<reqwest::Response, ProbeError> {
        self.client
            .post(Self::completions_url(endpoint))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProbeError::from_transport(&e))
    }
}

impl ChatTransport for HttpTransport {
    async fn complete(
        &self,
        endpoint: &str,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<ChatResponse, ProbeError> {
        let body = build_chat_body(model, prompt, false);
        let response = self.post_chat(endpoint, api_key, &body).await?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProbeError::from_transport(&e))?;
        let json = serde_json::from_str::<Value>(&text).ok();
        Ok(ChatResponse { status, json, text })
    }

    async fn stream(
        &self,
        endpoint: &str,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<ChatStream, ProbeError> {
        let body = build_chat_body(model, prompt, true);
        let response = self.post_chat(endpoint, api_key, &body).await?;
        let status = response.status().as_u16();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProbeError::from_transport(&e)))
            .boxed();
        Ok(ChatStream { status, chunks })
    }
}
