//! Test orchestrator: drives one probe per model, applies per-model timeout
//! policy, runs probes in concurrency-bounded batches, and classifies each
//! outcome into the run report.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::ProbeError;
use crate::events::{EventBus, ProbeEvent};
use crate::report::RunReport;
use crate::streaming::{DecoderEvent, StreamDecoder, StreamMetrics, Utf8ChunkBuffer};
use crate::tokenizer::{CharCountEstimator, TokenEstimator};
use crate::transport::ChatTransport;

// ==================================================================================================
// Timeout policy
// ==================================================================================================

/// One entry in the ordered timeout-rule table. First match wins.
struct TimeoutRule {
    name: &'static str,
    matches: fn(&str) -> bool,
    apply: fn(u64) -> u64,
}

fn match_o1(model: &str) -> bool {
    model.starts_with("o1-")
}

fn match_deepseek_r1(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.contains("deepseek-r1") || lower.contains("deepseek_r1")
}

fn match_claude(model: &str) -> bool {
    model.to_ascii_lowercase().contains("claude")
}

fn apply_o1(base_ms: u64) -> u64 {
    base_ms.saturating_mul(6)
}

fn apply_deepseek_r1(base_ms: u64) -> u64 {
    base_ms.saturating_mul(5).max(60_000)
}

fn apply_claude(base_ms: u64) -> u64 {
    base_ms.saturating_mul(3).max(30_000)
}

/// Model-name heuristics for reasoning/slow model families. Kept as an
/// explicit table so the rules stay auditable and testable in isolation.
const TIMEOUT_RULES: &[TimeoutRule] = &[
    TimeoutRule {
        name: "o1 reasoning",
        matches: match_o1,
        apply: apply_o1,
    },
    TimeoutRule {
        name: "deepseek-r1 chain of thought",
        matches: match_deepseek_r1,
        apply: apply_deepseek_r1,
    },
    TimeoutRule {
        name: "claude",
        matches: match_claude,
        apply: apply_claude,
    },
];

/// Effective per-probe timeout for a model, from the base timeout.
pub fn effective_timeout_ms(model: &str, base_timeout_ms: u64) -> u64 {
    for rule in TIMEOUT_RULES {
        if (rule.matches)(model) {
            let effective = (rule.apply)(base_timeout_ms);
            debug!(
                model = model,
                rule = rule.name,
                timeout_ms = effective,
                "timeout rule applied"
            );
            return effective;
        }
    }
    base_timeout_ms
}

// ==================================================================================================
// Probe configuration and outcomes
// ==================================================================================================

/// Caller-supplied parameters for one probe run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub endpoint: String,
    pub api_key: String,
    pub prompt: String,
    pub base_timeout_ms: u64,
    pub concurrency: usize,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    NonStream,
    Stream,
}

impl std::fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMode::NonStream => write!(f, "non-stream"),
            ProbeMode::Stream => write!(f, "stream"),
        }
    }
}

/// Probe succeeded and the endpoint answered with the requested model.
#[derive(Debug, Clone, Serialize)]
pub struct ValidOutcome {
    pub model: String,
    pub mode: ProbeMode,
    pub response_time_ms: u64,
    pub ttfb_ms: Option<u64>,
    /// Approximate (character-based) for non-stream, delta count for stream
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub content_length: usize,
    /// Provider reported nonzero reasoning tokens for an o1 model
    pub has_o1_reason: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamMetrics>,
}

/// Probe succeeded but the endpoint answered with a different model id.
#[derive(Debug, Clone, Serialize)]
pub struct InconsistentOutcome {
    pub model: String,
    pub returned_model: String,
    pub response_time_ms: u64,
    pub ttfb_ms: Option<u64>,
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub content_length: usize,
    pub has_o1_reason: bool,
}

/// Probe failed with a classified error.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidOutcome {
    pub model: String,
    pub mode: ProbeMode,
    pub kind: ProbeError,
    /// Human-readable, independent of any raw exception string
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

/// Streaming returned a valid HTTP response but no usable content. Distinct
/// from Invalid: non-streaming may still work for this model.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEmptyOutcome {
    pub model: String,
    pub metrics: StreamMetrics,
    pub warning: String,
}

/// Classified result of one probe. Created once, never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Valid(ValidOutcome),
    Inconsistent(InconsistentOutcome),
    Invalid(InvalidOutcome),
    StreamEmpty(StreamEmptyOutcome),
}

impl ProbeOutcome {
    pub fn model(&self) -> &str {
        match self {
            ProbeOutcome::Valid(o) => &o.model,
            ProbeOutcome::Inconsistent(o) => &o.model,
            ProbeOutcome::Invalid(o) => &o.model,
            ProbeOutcome::StreamEmpty(o) => &o.model,
        }
    }

    /// Progress event for this outcome, tagged by mode.
    pub fn to_event(&self) -> ProbeEvent {
        match self {
            ProbeOutcome::Valid(o) if o.mode == ProbeMode::Stream => {
                ProbeEvent::StreamValid(o.clone())
            }
            ProbeOutcome::Valid(o) => ProbeEvent::Valid(o.clone()),
            ProbeOutcome::Inconsistent(o) => ProbeEvent::Inconsistent(o.clone()),
            ProbeOutcome::Invalid(o) if o.mode == ProbeMode::Stream => {
                ProbeEvent::StreamInvalid(o.clone())
            }
            ProbeOutcome::Invalid(o) => ProbeEvent::Invalid(o.clone()),
            ProbeOutcome::StreamEmpty(o) => ProbeEvent::StreamEmpty(o.clone()),
        }
    }
}

fn invalid(model: &str, mode: ProbeMode, kind: ProbeError, http_status: Option<u16>) -> ProbeOutcome {
    let message = format!("[{}] {}", kind, kind.describe());
    ProbeOutcome::Invalid(InvalidOutcome {
        model: model.to_string(),
        mode,
        kind,
        message,
        http_status,
    })
}

fn invalid_with_body(
    model: &str,
    mode: ProbeMode,
    kind: ProbeError,
    body_message: String,
    http_status: u16,
) -> ProbeOutcome {
    ProbeOutcome::Invalid(InvalidOutcome {
        model: model.to_string(),
        mode,
        message: format!("[{}] {}", kind, body_message),
        kind,
        http_status: Some(http_status),
    })
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn token_chars(events: &[DecoderEvent]) -> usize {
    events
        .iter()
        .map(|event| match event {
            DecoderEvent::Token(token) => token.content.chars().count(),
            _ => 0,
        })
        .sum()
}

// ==================================================================================================
// Single-probe execution
// ==================================================================================================

/// Run one probe end to end and classify it. Every failure path is folded
/// into an outcome; this function never returns an error.
pub async fn probe_model<T: ChatTransport>(
    transport: &T,
    estimator: &dyn TokenEstimator,
    model: &str,
    config: &ProbeConfig,
) -> ProbeOutcome {
    let timeout_ms = effective_timeout_ms(model, config.base_timeout_ms);
    if config.stream {
        stream_probe(transport, model, config, timeout_ms).await
    } else {
        non_stream_probe(transport, estimator, model, config, timeout_ms).await
    }
}

pub(crate) async fn non_stream_probe<T: ChatTransport>(
    transport: &T,
    estimator: &dyn TokenEstimator,
    model: &str,
    config: &ProbeConfig,
    timeout_ms: u64,
) -> ProbeOutcome {
    let started = Instant::now();
    let call = transport.complete(&config.endpoint, &config.api_key, model, &config.prompt);

    let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Err(_) => return invalid(model, ProbeMode::NonStream, ProbeError::Timeout, None),
        Ok(Err(err)) => return invalid(model, ProbeMode::NonStream, err, None),
        Ok(Ok(response)) => response,
    };

    let response_time_ms = started.elapsed().as_millis() as u64;

    if !response.is_success() {
        let kind = ProbeError::from_status(response.status);
        return invalid_with_body(
            model,
            ProbeMode::NonStream,
            kind,
            response.error_message(),
            response.status,
        );
    }

    let Some(data) = response.json else {
        return invalid(
            model,
            ProbeMode::NonStream,
            ProbeError::MalformedResponse("response body is not JSON".to_string()),
            Some(response.status),
        );
    };

    let returned_model = data
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("no returned model")
        .to_string();

    let has_o1_reason = returned_model.starts_with("o1-")
        && data
            .get("usage")
            .and_then(|u| u.get("completion_tokens_details"))
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            > 0;

    let content = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let content_length = content.chars().count();
    let token_count = estimator.estimate(content);
    let tokens_per_second = if response_time_ms > 0 {
        round2(token_count as f64 / (response_time_ms as f64 / 1000.0))
    } else {
        0.0
    };

    if returned_model == model {
        ProbeOutcome::Valid(ValidOutcome {
            model: model.to_string(),
            mode: ProbeMode::NonStream,
            response_time_ms,
            // Without streaming the first byte is the whole body
            ttfb_ms: Some(response_time_ms),
            token_count,
            tokens_per_second,
            content_length,
            has_o1_reason,
            stream: None,
        })
    } else {
        ProbeOutcome::Inconsistent(InconsistentOutcome {
            model: model.to_string(),
            returned_model,
            response_time_ms,
            ttfb_ms: Some(response_time_ms),
            token_count,
            tokens_per_second,
            content_length,
            has_o1_reason,
        })
    }
}

pub(crate) async fn stream_probe<T: ChatTransport>(
    transport: &T,
    model: &str,
    config: &ProbeConfig,
    timeout_ms: u64,
) -> ProbeOutcome {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    let open = transport.stream(&config.endpoint, &config.api_key, model, &config.prompt);
    let opened = match tokio::time::timeout_at(deadline, open).await {
        Err(_) => return invalid(model, ProbeMode::Stream, ProbeError::Timeout, None),
        Ok(Err(err)) => return invalid(model, ProbeMode::Stream, err, None),
        Ok(Ok(stream)) => stream,
    };

    if !(200..300).contains(&opened.status) {
        let kind = ProbeError::from_status(opened.status);
        return invalid(model, ProbeMode::Stream, kind, Some(opened.status));
    }

    let mut decoder = StreamDecoder::new();
    let mut content_length = 0usize;
    let mut chunks = opened.chunks;

    let consume = async {
        // Chunk boundaries are byte-oriented and may split a multi-byte
        // character; reassemble before the decoder sees the text
        let mut text = Utf8ChunkBuffer::default();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            content_length += token_chars(&decoder.feed(&text.push(&chunk)));
            if decoder.is_done() {
                break;
            }
        }
        if !decoder.is_done() {
            content_length += token_chars(&decoder.feed(&text.finish()));
        }
        Ok::<(), ProbeError>(())
    };

    match tokio::time::timeout_at(deadline, consume).await {
        Err(_) => return invalid(model, ProbeMode::Stream, ProbeError::Timeout, None),
        Ok(Err(err)) => return invalid(model, ProbeMode::Stream, err, None),
        Ok(Ok(())) => {}
    }

    let (metrics, _) = decoder.finish();
    if metrics.token_count > 0 {
        ProbeOutcome::Valid(ValidOutcome {
            model: model.to_string(),
            mode: ProbeMode::Stream,
            response_time_ms: metrics.total_time_ms,
            ttfb_ms: metrics.ttfb_ms,
            token_count: metrics.token_count as u64,
            tokens_per_second: metrics.tokens_per_second,
            content_length,
            has_o1_reason: false,
            stream: Some(metrics),
        })
    } else {
        ProbeOutcome::StreamEmpty(StreamEmptyOutcome {
            model: model.to_string(),
            metrics,
            warning: "stream produced no content; non-streaming mode may still work".to_string(),
        })
    }
}

// ==================================================================================================
// Orchestrator
// ==================================================================================================

/// Runs probes for many models in concurrency-bounded batches and aggregates
/// the classified outcomes into a [`RunReport`].
pub struct TestOrchestrator<T: ChatTransport> {
    transport: Arc<T>,
    estimator: Arc<dyn TokenEstimator>,
    bus: EventBus,
}

impl<T: ChatTransport + 'static> TestOrchestrator<T> {
    pub fn new(transport: T) -> Self {
        Self::with_estimator(transport, Arc::new(CharCountEstimator))
    }

    pub fn with_estimator(transport: T, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            transport: Arc::new(transport),
            estimator,
            bus: EventBus::new(),
        }
    }

    /// Progress sink; subscribe before calling `run`.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Probe every model. Models are partitioned into consecutive groups of
    /// `concurrency`; a group's probes run concurrently and the next group
    /// never starts before every probe in the current one has settled.
    pub async fn run(&self, models: &[String], config: &ProbeConfig) -> RunReport {
        let mut report = RunReport::default();
        let concurrency = config.concurrency.max(1);
        let mode = if config.stream {
            ProbeMode::Stream
        } else {
            ProbeMode::NonStream
        };
        info!(
            models = models.len(),
            concurrency,
            mode = %mode,
            "starting probe run"
        );

        for batch in models.chunks(concurrency) {
            let handles: Vec<(String, tokio::task::JoinHandle<ProbeOutcome>)> = batch
                .iter()
                .map(|model| {
                    let transport = self.transport.clone();
                    let estimator = self.estimator.clone();
                    let bus = self.bus.clone();
                    let task_model = model.clone();
                    let config = config.clone();
                    let handle = tokio::spawn(async move {
                        let outcome =
                            probe_model(&*transport, &*estimator, &task_model, &config).await;
                        // Publish from the task so progress arrives in
                        // completion order within the batch
                        bus.publish(&outcome.to_event());
                        outcome
                    });
                    (model.clone(), handle)
                })
                .collect();

            for (model, handle) in handles {
                match handle.await {
                    Ok(outcome) => report.push(outcome),
                    Err(join_err) => {
                        // A panicked probe task is an orchestration bug, not
                        // an API failure: report it, keep it out of the
                        // buckets, and let sibling probes finish normally.
                        let message =
                            ProbeError::OrchestrationError(join_err.to_string()).to_string();
                        error!(model = %model, "{}", message);
                        self.bus.publish(&ProbeEvent::Error { model, message });
                    }
                }
            }
        }

        report
    }
}
