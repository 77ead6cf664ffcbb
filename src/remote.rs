//! Auxiliary endpoint calls that sit outside the chat-completion probes:
//! model discovery, billing quota, and provider key health checks.

use chrono::{Datelike, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ProbeError, Result};
use crate::transport::trim_endpoint;

async fn get_json(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
) -> Result<Value> {
    let response = client
        .get(url)
        .header("Authorization", format!("Bearer {}", api_key))
        .send()
        .await
        .map_err(|e| ProbeError::from_transport(&e))?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(ProbeError::from_status(status));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ProbeError::from_transport(&e))
}

/// Fetch the endpoint's model ids from `/v1/models`.
pub async fn fetch_model_list(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
) -> Result<Vec<String>> {
    let url = format!("{}/v1/models", trim_endpoint(endpoint));
    let body = get_json(client, &url, api_key).await?;
    let models: Vec<String> = body
        .get("data")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    debug!(count = models.len(), "model list fetched");
    Ok(models)
}

/// Billing quota as reported by the OpenAI-compatible dashboard endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaInfo {
    /// Total grant in dollars, absent when the endpoint does not report one
    pub hard_limit_usd: Option<f64>,
    /// Dollars consumed since the first of the current month
    pub used_usd: f64,
}

impl QuotaInfo {
    pub fn remaining_usd(&self) -> Option<f64> {
        self.hard_limit_usd.map(|limit| limit - self.used_usd)
    }
}

/// Query subscription and month-to-date usage. Usage is reported by the API
/// in cents.
pub async fn fetch_quota(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
) -> Result<QuotaInfo> {
    let base = trim_endpoint(endpoint);

    let subscription = get_json(
        client,
        &format!("{}/dashboard/billing/subscription", base),
        api_key,
    )
    .await?;
    let hard_limit_usd = subscription
        .get("hard_limit_usd")
        .and_then(Value::as_f64);

    let today = Utc::now().date_naive();
    let start = format!("{:04}-{:02}-01", today.year(), today.month());
    let end = today.format("%Y-%m-%d").to_string();
    let usage = get_json(
        client,
        &format!(
            "{}/dashboard/billing/usage?start_date={}&end_date={}",
            base, start, end
        ),
        api_key,
    )
    .await?;
    let used_usd = usage
        .get("total_usage")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        / 100.0;

    Ok(QuotaInfo {
        hard_limit_usd,
        used_usd,
    })
}

async fn post_key_check(
    client: &reqwest::Client,
    url: &str,
    body: Value,
) -> Result<Value> {
    let response = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| ProbeError::from_transport(&e))?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(ProbeError::from_status(status));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ProbeError::from_transport(&e))
}

/// Validate a batch of OAuth refresh tokens against a checker service. The
/// response is passed through as-is.
pub async fn check_refresh_tokens(
    client: &reqwest::Client,
    checker_url: &str,
    tokens: &[String],
) -> Result<Value> {
    post_key_check(
        client,
        checker_url,
        json!({"type": "refreshTokens", "tokens": tokens}),
    )
    .await
}

/// Validate a batch of session keys.
pub async fn check_session_keys(
    client: &reqwest::Client,
    checker_url: &str,
    keys: &[String],
) -> Result<Value> {
    post_key_check(
        client,
        checker_url,
        json!({"type": "sessionKeys", "keys": keys}),
    )
    .await
}

/// Validate a batch of Gemini API keys.
pub async fn check_gemini_keys(
    client: &reqwest::Client,
    checker_url: &str,
    keys: &[String],
) -> Result<Value> {
    post_key_check(
        client,
        checker_url,
        json!({"type": "geminiAPI", "keys": keys}),
    )
    .await
}
